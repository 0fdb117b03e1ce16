use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::UnknownVariant;

/// Minimum digits for a phone number to be considered usable
const MIN_PHONE_DIGITS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationStatus {
    Inactive,
    Active,
}

impl ActivationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationStatus::Inactive => "inactive",
            ActivationStatus::Active => "active",
        }
    }
}

impl fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(ActivationStatus::Inactive),
            "active" => Ok(ActivationStatus::Active),
            other => Err(UnknownVariant::new("activation status", other)),
        }
    }
}

crate::models::text_column!(ActivationStatus);

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub phone_normalized: Option<String>,
    pub status: ActivationStatus,
    pub first_purchase_used: bool,
    pub last_points_update: Option<DateTime<Utc>>,
    pub points_expiration_date: Option<NaiveDate>,
    pub last_entry_at: Option<DateTime<Utc>>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateAccountData {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl CreateAccountData {
    /// Checks the registration form fields
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.name.trim().is_empty() {
            return Err(LedgerError::InvalidInput("Name is required".to_string()));
        }

        if !is_plausible_email(&self.email) {
            return Err(LedgerError::InvalidInput(format!(
                "Invalid email address: {}",
                self.email.trim()
            )));
        }

        if let Some(phone) = self.phone.as_deref().filter(|p| !p.trim().is_empty()) {
            if normalize_phone(phone).len() < MIN_PHONE_DIGITS {
                return Err(LedgerError::InvalidInput(format!(
                    "Invalid phone number: {}",
                    phone
                )));
            }
        }

        Ok(())
    }
}

impl Account {
    /// Builds a new, inactive account from validated registration data
    pub fn new(data: CreateAccountData, now: DateTime<Utc>) -> Self {
        let phone = data
            .phone
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        let phone_normalized = phone.as_deref().map(normalize_phone);

        Self {
            id: Uuid::new_v4(),
            name: data.name.trim().to_string(),
            email: normalize_email(&data.email),
            phone,
            phone_normalized,
            status: ActivationStatus::Inactive,
            first_purchase_used: false,
            last_points_update: None,
            points_expiration_date: None,
            last_entry_at: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ActivationStatus::Active
    }
}

/// Lower-cased, trimmed email used for uniqueness
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Digits only; formatting is ignored for uniqueness
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn is_plausible_email(email: &str) -> bool {
    let email = email.trim();
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !email.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(name: &str, email: &str, phone: Option<&str>) -> CreateAccountData {
        CreateAccountData {
            name: name.to_string(),
            email: email.to_string(),
            phone: phone.map(str::to_string),
        }
    }

    #[test]
    fn test_normalize_phone_ignores_formatting() {
        assert_eq!(normalize_phone("+52 (55) 1234-5678"), "525512345678");
        assert_eq!(normalize_phone("55.1234.5678"), "5512345678");
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Ana@Example.COM "), "ana@example.com");
    }

    #[test]
    fn test_validate_registration() {
        assert!(form("Ana", "ana@example.com", Some("55 1234 5678")).validate().is_ok());
        assert!(form("Ana", "ana@example.com", None).validate().is_ok());
        assert!(matches!(
            form("  ", "ana@example.com", None).validate(),
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(matches!(
            form("Ana", "ana.example.com", None).validate(),
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(matches!(
            form("Ana", "ana@localhost", None).validate(),
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(matches!(
            form("Ana", "ana@example.com", Some("12-34")).validate(),
            Err(LedgerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_new_account_is_inactive_and_normalized() {
        let account = Account::new(
            form(" Ana ", "Ana@Example.com", Some(" (55) 1234-5678 ")),
            Utc::now(),
        );

        assert_eq!(account.status, ActivationStatus::Inactive);
        assert_eq!(account.name, "Ana");
        assert_eq!(account.email, "ana@example.com");
        assert_eq!(account.phone.as_deref(), Some("(55) 1234-5678"));
        assert_eq!(account.phone_normalized.as_deref(), Some("5512345678"));
        assert!(!account.first_purchase_used);
        assert!(account.points_expiration_date.is_none());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("active".parse::<ActivationStatus>().unwrap(), ActivationStatus::Active);
        assert!("verified".parse::<ActivationStatus>().is_err());
    }
}
