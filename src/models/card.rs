use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The single program type the ledger tracks
pub const LOYALTY_PROGRAM: &str = "loyalty";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LoyaltyCard {
    pub id: Uuid,
    pub account_id: Uuid,
    pub program: String,
    pub is_active: bool,
    /// Cached total; must equal earn - redeem - expire over this card's entries
    pub points: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LoyaltyCard {
    /// Opens an active loyalty card with an empty balance
    pub fn open(account_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            account_id,
            program: LOYALTY_PROGRAM.to_string(),
            is_active: true,
            points: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether entries may be posted against this card
    pub fn is_ledger_eligible(&self) -> bool {
        self.is_active && self.program == LOYALTY_PROGRAM
    }
}
