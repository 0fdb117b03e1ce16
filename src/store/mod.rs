// Store module - ledger log, cached card balances and verification tokens

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::fmt;
use uuid::Uuid;

use crate::models::{
    Account, HistoryQuery, LedgerEntry, LedgerTotals, LoyaltyCard, NewLedgerEntry,
    VerificationToken,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Position of an account in the expiry ordering (date, then id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ExpiryCursor {
    pub expires_on: NaiveDate,
    pub account_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Email,
    Phone,
    Token,
}

impl fmt::Display for UniqueField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UniqueField::Email => "email",
            UniqueField::Phone => "phone",
            UniqueField::Token => "verification token",
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Duplicate {0}")]
    UniqueViolation(UniqueField),

    #[error("Account {account_id} changed since revision {expected}")]
    RevisionConflict { account_id: Uuid, expected: i64 },

    #[error("Account {0} does not exist")]
    MissingAccount(Uuid),

    #[error("Card {card_id} does not belong to account {account_id}")]
    CardMismatch { account_id: Uuid, card_id: Uuid },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything a mutation needs to know about one account
#[derive(Debug, Clone)]
pub struct AccountState {
    pub account: Account,
    /// The active loyalty card if there is one, else the most recent card
    pub card: Option<LoyaltyCard>,
    pub token: Option<VerificationToken>,
}

impl AccountState {
    pub fn eligible_card(&self) -> Option<&LoyaltyCard> {
        self.card.as_ref().filter(|c| c.is_ledger_eligible())
    }

    /// Cached balance of the active card
    pub fn balance(&self) -> Decimal {
        self.eligible_card()
            .map(|c| c.points)
            .unwrap_or(Decimal::ZERO)
    }
}

/// Consistent read of an account and its ledger aggregates
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub state: AccountState,
    pub totals: LedgerTotals,
    pub last_running_balance: Option<Decimal>,
}

/// One atomic write against a single account
#[derive(Debug, Clone)]
pub struct AccountChange {
    /// Revision the change was computed from
    pub expected_revision: i64,
    pub account: Account,
    pub card: Option<LoyaltyCard>,
    pub entry: Option<NewLedgerEntry>,
    pub token: Option<VerificationToken>,
}

impl AccountChange {
    /// Starts a change from the current state; the store bumps the revision
    pub fn from_state(state: &AccountState, now: DateTime<Utc>) -> Self {
        let mut account = state.account.clone();
        account.updated_at = now;

        Self {
            expected_revision: state.account.revision,
            account,
            card: None,
            entry: None,
            token: None,
        }
    }
}

#[async_trait]
pub trait LoyaltyStore: Send + Sync {
    /// Inserts a new account; email and phone uniqueness is enforced here
    async fn insert_account(&self, account: &Account) -> StoreResult<()>;

    async fn find_account(&self, id: Uuid) -> StoreResult<Option<Account>>;

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>>;

    async fn email_taken(&self, email: &str) -> StoreResult<bool>;

    async fn phone_taken(&self, phone_normalized: &str) -> StoreResult<bool>;

    async fn load_state(&self, account_id: Uuid) -> StoreResult<Option<AccountState>>;

    async fn find_token(&self, token: &str) -> StoreResult<Option<VerificationToken>>;

    /// Applies a change atomically. Returns the appended entry, if any, with
    /// its sequence assigned.
    async fn commit(&self, change: AccountChange) -> StoreResult<Option<LedgerEntry>>;

    async fn snapshot(&self, account_id: Uuid) -> StoreResult<Option<AccountSnapshot>>;

    /// Entries newest first
    async fn history(&self, account_id: Uuid, query: &HistoryQuery)
        -> StoreResult<Vec<LedgerEntry>>;

    /// Balance derived from the log up to and including `at`
    async fn balance_at(&self, account_id: Uuid, at: DateTime<Utc>) -> StoreResult<Decimal>;

    /// Accounts whose expiration date is before `today` and whose card still
    /// holds points, ordered by date then id, strictly after `after`
    async fn accounts_with_expired_points(
        &self,
        today: NaiveDate,
        after: Option<ExpiryCursor>,
        limit: i64,
    ) -> StoreResult<Vec<ExpiryCursor>>;

    async fn ping(&self) -> StoreResult<()>;
}
