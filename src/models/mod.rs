// Models module - Ledger entity representations

/// Stores a string-backed enum in a TEXT column
macro_rules! text_column {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <String as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <String as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let raw = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                Ok(raw.parse::<$ty>()?)
            }
        }
    };
}

pub(crate) use text_column;

pub mod account;
pub mod card;
pub mod ledger_entry;
pub mod summary;
pub mod verification_token;

pub use account::{Account, ActivationStatus, CreateAccountData};
pub use card::LoyaltyCard;
pub use ledger_entry::{HistoryQuery, HistoryRecord, LedgerEntry, LedgerTotals, NewLedgerEntry, TransactionKind};
pub use summary::{AccountSummary, Reconciliation};
pub use verification_token::VerificationToken;

#[derive(thiserror::Error, Debug)]
#[error("Unknown {what}: {value}")]
pub struct UnknownVariant {
    what: &'static str,
    value: String,
}

impl UnknownVariant {
    pub fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_string(),
        }
    }
}
