use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use uuid::Uuid;

use crate::models::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Earn,
    Redeem,
    Expire,
    Discount,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Earn => "earn",
            TransactionKind::Redeem => "redeem",
            TransactionKind::Expire => "expire",
            TransactionKind::Discount => "discount",
        }
    }

    /// Human-readable label used in history exports
    pub fn label(&self) -> &'static str {
        match self {
            TransactionKind::Earn => "Points earned",
            TransactionKind::Redeem => "Points redeemed",
            TransactionKind::Expire => "Points expired",
            TransactionKind::Discount => "Discount applied",
        }
    }

    /// Effect of `points` on the balance
    pub fn signed(&self, points: Decimal) -> Decimal {
        match self {
            TransactionKind::Earn => points,
            TransactionKind::Redeem | TransactionKind::Expire => -points,
            TransactionKind::Discount => Decimal::ZERO,
        }
    }

    /// Whether this kind moves points and therefore resets the expiration horizon
    pub fn moves_points(&self) -> bool {
        !matches!(self, TransactionKind::Discount)
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "earn" => Ok(TransactionKind::Earn),
            "redeem" => Ok(TransactionKind::Redeem),
            "expire" => Ok(TransactionKind::Expire),
            "discount" => Ok(TransactionKind::Discount),
            other => Err(UnknownVariant::new("transaction kind", other)),
        }
    }
}

crate::models::text_column!(TransactionKind);

/// Immutable ledger row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    /// Insertion order; breaks timestamp ties
    pub sequence: i64,
    pub account_id: Uuid,
    pub card_id: Uuid,
    pub kind: TransactionKind,
    pub points: Decimal,
    pub amount: Option<Decimal>,
    pub reason: String,
    pub order_reference: Option<String>,
    /// Balance after this entry, over all prior entries of the account
    pub running_balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Entry as built by the balance engine, before the store assigns a sequence
#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub card_id: Uuid,
    pub kind: TransactionKind,
    pub points: Decimal,
    pub amount: Option<Decimal>,
    pub reason: String,
    pub order_reference: Option<String>,
    pub running_balance: Decimal,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    pub fn with_sequence(self, sequence: i64) -> LedgerEntry {
        LedgerEntry {
            id: self.id,
            sequence,
            account_id: self.account_id,
            card_id: self.card_id,
            kind: self.kind,
            points: self.points,
            amount: self.amount,
            reason: self.reason,
            order_reference: self.order_reference,
            running_balance: self.running_balance,
            created_at: self.created_at,
        }
    }
}

/// Per-kind sums over an account's ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerTotals {
    pub earned: Decimal,
    pub redeemed: Decimal,
    pub expired: Decimal,
    pub discounted: Decimal,
    pub entries: i64,
}

impl LedgerTotals {
    pub fn add(&mut self, kind: TransactionKind, points: Decimal, amount: Option<Decimal>) {
        match kind {
            TransactionKind::Earn => self.earned += points,
            TransactionKind::Redeem => self.redeemed += points,
            TransactionKind::Expire => self.expired += points,
            TransactionKind::Discount => self.discounted += amount.unwrap_or_default(),
        }
        self.entries += 1;
    }

    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut totals = Self::default();
        for entry in entries {
            totals.add(entry.kind, entry.points, entry.amount);
        }
        totals
    }

    /// Balance derived from the log alone
    pub fn balance(&self) -> Decimal {
        self.earned - self.redeemed - self.expired
    }
}

/// Filter for history exports
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// Most recent N entries only
    pub limit: Option<i64>,
}

impl HistoryQuery {
    pub fn between(date_from: Option<DateTime<Utc>>, date_to: Option<DateTime<Utc>>) -> Self {
        Self {
            date_from,
            date_to,
            limit: None,
        }
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.date_from.map_or(true, |from| entry.created_at >= from)
            && self.date_to.map_or(true, |to| entry.created_at <= to)
    }
}

/// Read-only view of a ledger entry for history exports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub date: DateTime<Utc>,
    pub kind: TransactionKind,
    pub label: &'static str,
    pub points: Decimal,
    pub amount: Option<Decimal>,
    pub reason: String,
    pub order_reference: Option<String>,
    pub balance: Decimal,
}

impl From<LedgerEntry> for HistoryRecord {
    fn from(entry: LedgerEntry) -> Self {
        Self {
            date: entry.created_at,
            kind: entry.kind,
            label: entry.kind.label(),
            points: entry.points,
            amount: entry.amount,
            reason: entry.reason,
            order_reference: entry.order_reference,
            balance: entry.running_balance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(kind: TransactionKind, points: Decimal, amount: Option<Decimal>) -> LedgerEntry {
        NewLedgerEntry {
            id: Uuid::new_v4(),
            account_id: Uuid::nil(),
            card_id: Uuid::nil(),
            kind,
            points,
            amount,
            reason: String::new(),
            order_reference: None,
            running_balance: Decimal::ZERO,
            created_at: Utc::now(),
        }
        .with_sequence(1)
    }

    #[test]
    fn test_signed_effects() {
        assert_eq!(TransactionKind::Earn.signed(dec!(10)), dec!(10));
        assert_eq!(TransactionKind::Redeem.signed(dec!(10)), dec!(-10));
        assert_eq!(TransactionKind::Expire.signed(dec!(10)), dec!(-10));
        assert_eq!(TransactionKind::Discount.signed(dec!(10)), Decimal::ZERO);
    }

    #[test]
    fn test_totals_ignore_discounts_for_balance() {
        let entries = vec![
            entry(TransactionKind::Earn, dec!(100), None),
            entry(TransactionKind::Redeem, dec!(30), None),
            entry(TransactionKind::Discount, Decimal::ZERO, Some(dec!(12.50))),
            entry(TransactionKind::Expire, dec!(20), None),
        ];

        let totals = LedgerTotals::from_entries(&entries);
        assert_eq!(totals.earned, dec!(100));
        assert_eq!(totals.redeemed, dec!(30));
        assert_eq!(totals.expired, dec!(20));
        assert_eq!(totals.discounted, dec!(12.50));
        assert_eq!(totals.entries, 4);
        assert_eq!(totals.balance(), dec!(50));
    }

    #[test]
    fn test_history_query_bounds_are_inclusive() {
        let e = entry(TransactionKind::Earn, dec!(1), None);
        let at = e.created_at;

        assert!(HistoryQuery::between(Some(at), Some(at)).matches(&e));
        assert!(!HistoryQuery::between(Some(at + chrono::Duration::seconds(1)), None).matches(&e));
        assert!(!HistoryQuery::between(None, Some(at - chrono::Duration::seconds(1))).matches(&e));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("expire".parse::<TransactionKind>().unwrap(), TransactionKind::Expire);
        assert!("refund".parse::<TransactionKind>().is_err());
    }
}
