use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{account::Account, card::LoyaltyCard, ledger_entry::LedgerTotals};

/// Read-only points overview for one account
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountSummary {
    pub account_id: Uuid,
    pub points_available: Decimal,
    pub points_earned: Decimal,
    pub points_redeemed: Decimal,
    pub points_expired: Decimal,
    pub expiration_date: Option<NaiveDate>,
    pub is_active: bool,
    pub first_purchase_available: bool,
}

impl AccountSummary {
    pub fn build(account: &Account, card: Option<&LoyaltyCard>, totals: &LedgerTotals) -> Self {
        let points_available = card
            .filter(|c| c.is_ledger_eligible())
            .map(|c| c.points)
            .unwrap_or(Decimal::ZERO);

        Self {
            account_id: account.id,
            points_available,
            points_earned: totals.earned,
            points_redeemed: totals.redeemed,
            points_expired: totals.expired,
            expiration_date: account.points_expiration_date,
            is_active: account.is_active(),
            first_purchase_available: !account.first_purchase_used,
        }
    }
}

/// Cached balance compared against the log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub account_id: Uuid,
    pub cached_balance: Decimal,
    pub ledger_balance: Decimal,
    pub last_running_balance: Option<Decimal>,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.cached_balance == self.ledger_balance
            && self
                .last_running_balance
                .map_or(self.ledger_balance.is_zero(), |b| b == self.ledger_balance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn reconciliation(cached: Decimal, ledger: Decimal, last: Option<Decimal>) -> Reconciliation {
        Reconciliation {
            account_id: Uuid::nil(),
            cached_balance: cached,
            ledger_balance: ledger,
            last_running_balance: last,
        }
    }

    #[test]
    fn test_reconciliation_consistency() {
        assert!(reconciliation(dec!(40), dec!(40), Some(dec!(40))).is_consistent());
        assert!(reconciliation(Decimal::ZERO, Decimal::ZERO, None).is_consistent());
        assert!(!reconciliation(dec!(40), dec!(100), Some(dec!(100))).is_consistent());
        assert!(!reconciliation(dec!(40), dec!(40), Some(dec!(100))).is_consistent());
    }
}
