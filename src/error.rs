use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;

use crate::store::{StoreError, UniqueField};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Points must be a positive amount (got {0})")]
    InvalidAmount(Decimal),

    #[error("Account has no active loyalty program")]
    InactiveAccount,

    #[error("Insufficient points: requested {requested}, available {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Account not found")]
    AccountNotFound,

    #[error("Email address is already registered")]
    DuplicateEmail,

    #[error("Phone number is already registered")]
    DuplicatePhone,

    #[error("Verification token is invalid")]
    TokenNotFound,

    #[error("Verification token has expired")]
    TokenExpired,

    #[error("Verification token has already been used")]
    TokenAlreadyConsumed,

    #[error("Account is already active")]
    AlreadyActive,

    #[error("Validation error: {0}")]
    InvalidInput(String),

    #[error("Timed out waiting for the account lock")]
    LockTimeout,

    #[error("Account was modified concurrently")]
    Conflict,

    #[error("Storage error: {0}")]
    Storage(#[source] StoreError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UniqueViolation(UniqueField::Email) => LedgerError::DuplicateEmail,
            StoreError::UniqueViolation(UniqueField::Phone) => LedgerError::DuplicatePhone,
            StoreError::RevisionConflict { .. } => LedgerError::Conflict,
            other => LedgerError::Storage(other),
        }
    }
}

impl LedgerError {
    /// Stable machine-readable kind
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InvalidAmount(_) => "invalid_amount",
            LedgerError::InactiveAccount => "inactive_account",
            LedgerError::InsufficientBalance { .. } => "insufficient_balance",
            LedgerError::AccountNotFound => "account_not_found",
            LedgerError::DuplicateEmail => "duplicate_email",
            LedgerError::DuplicatePhone => "duplicate_phone",
            LedgerError::TokenNotFound => "token_not_found",
            LedgerError::TokenExpired => "token_expired",
            LedgerError::TokenAlreadyConsumed => "token_already_consumed",
            LedgerError::AlreadyActive => "already_active",
            LedgerError::InvalidInput(_) => "invalid_input",
            LedgerError::LockTimeout => "lock_timeout",
            LedgerError::Conflict => "conflict",
            LedgerError::Storage(_) => "storage_error",
        }
    }

    /// Only lock contention is safe to retry; everything else is caller input
    /// or infrastructure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::LockTimeout | LedgerError::Conflict)
    }

    pub(crate) fn status(&self) -> StatusCode {
        match self {
            LedgerError::InvalidAmount(_) | LedgerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LedgerError::InactiveAccount => StatusCode::FORBIDDEN,
            LedgerError::InsufficientBalance { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            LedgerError::AccountNotFound | LedgerError::TokenNotFound => StatusCode::NOT_FOUND,
            LedgerError::TokenExpired => StatusCode::GONE,
            LedgerError::DuplicateEmail
            | LedgerError::DuplicatePhone
            | LedgerError::TokenAlreadyConsumed
            | LedgerError::AlreadyActive
            | LedgerError::Conflict => StatusCode::CONFLICT,
            LedgerError::LockTimeout => StatusCode::SERVICE_UNAVAILABLE,
            LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<crate::services::locks::LockTimedOut> for LedgerError {
    fn from(_: crate::services::locks::LockTimedOut) -> Self {
        LedgerError::LockTimeout
    }
}

impl IntoResponse for LedgerError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Storage details stay in the logs
        let message = match &self {
            LedgerError::Storage(e) => {
                tracing::error!(error = %e, "Storage failure");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": self.code(),
            "message": message,
            "retryable": self.is_retryable(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
