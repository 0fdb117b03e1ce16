// Balance engine - plans and commits ledger entries; callers hold the account lock

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::models::{LedgerEntry, LoyaltyCard, NewLedgerEntry, TransactionKind};
use crate::store::{AccountChange, AccountState, LoyaltyStore, StoreError};

/// Points stay valid this long after the last points movement
pub const POINTS_VALIDITY_DAYS: i64 = 365;

/// 10% off the first purchase
pub const FIRST_PURCHASE_DISCOUNT_RATE: Decimal = Decimal::from_parts(10, 0, 0, false, 2);

/// Points awarded per currency unit spent
pub const POINTS_PER_CURRENCY_UNIT: Decimal = Decimal::from_parts(5, 0, 0, false, 0);

/// Points and money are kept to cents
const SCALE: u32 = 2;

/// Largest amount a NUMERIC(14, 2) column holds: 999,999,999,999.99
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(276_447_231, 23_283, 0, false, 2);

fn bounded(value: Option<Decimal>, input: Decimal) -> Result<Decimal> {
    value
        .map(|v| v.round_dp(SCALE))
        .filter(|v| *v <= MAX_AMOUNT)
        .ok_or(LedgerError::InvalidAmount(input))
}

/// An entry to be recorded
#[derive(Debug, Clone)]
pub struct EntryDraft {
    pub kind: TransactionKind,
    pub points: Decimal,
    pub reason: Option<String>,
    pub order_reference: Option<String>,
    pub amount: Option<Decimal>,
}

impl EntryDraft {
    pub fn earn(points: Decimal, reason: Option<String>, order_reference: Option<String>) -> Self {
        Self {
            kind: TransactionKind::Earn,
            points,
            reason,
            order_reference,
            amount: None,
        }
    }

    pub fn redeem(points: Decimal, order_reference: Option<String>) -> Self {
        Self {
            kind: TransactionKind::Redeem,
            points,
            reason: None,
            order_reference,
            amount: None,
        }
    }

    pub fn expire(points: Decimal) -> Self {
        Self {
            kind: TransactionKind::Expire,
            points,
            reason: None,
            order_reference: None,
            amount: None,
        }
    }

    pub fn discount(amount: Decimal, order_reference: Option<String>) -> Self {
        Self {
            kind: TransactionKind::Discount,
            points: Decimal::ZERO,
            reason: None,
            order_reference,
            amount: Some(amount),
        }
    }
}

fn default_reason(kind: TransactionKind) -> &'static str {
    match kind {
        TransactionKind::Earn => "Points added for purchase",
        TransactionKind::Redeem => "Points redemption",
        TransactionKind::Expire => "Points expired",
        TransactionKind::Discount => "First purchase discount (10%)",
    }
}

/// Last day the points are valid, counted from the last points movement
pub fn expiration_date(last_points_update: DateTime<Utc>) -> NaiveDate {
    last_points_update.date_naive() + Duration::days(POINTS_VALIDITY_DAYS)
}

/// Points awarded for a purchase of `order_total`
pub fn purchase_points(order_total: Decimal) -> Result<Decimal> {
    bounded(
        order_total.checked_mul(POINTS_PER_CURRENCY_UNIT),
        order_total,
    )
}

/// First purchase discount for `order_total`
pub fn first_purchase_discount(order_total: Decimal) -> Result<Decimal> {
    bounded(
        order_total.checked_mul(FIRST_PURCHASE_DISCOUNT_RATE),
        order_total,
    )
}

/// Builds the change that records `draft` against `state`.
///
/// Returns the change and the balance after it.
pub fn plan_record(
    state: &AccountState,
    draft: EntryDraft,
    now: DateTime<Utc>,
) -> Result<(AccountChange, Decimal)> {
    let EntryDraft {
        kind,
        points,
        reason,
        order_reference,
        amount,
    } = draft;

    let (points, amount) = match kind {
        TransactionKind::Discount => {
            let amount = amount.unwrap_or(Decimal::NEGATIVE_ONE).round_dp(SCALE);
            if amount.is_sign_negative() || amount > MAX_AMOUNT {
                return Err(LedgerError::InvalidAmount(amount));
            }
            (Decimal::ZERO, Some(amount))
        }
        _ => {
            let points = points.round_dp(SCALE);
            if points <= Decimal::ZERO || points > MAX_AMOUNT {
                return Err(LedgerError::InvalidAmount(points));
            }
            (points, None)
        }
    };

    let account_id = state.account.id;
    let mut card = state
        .eligible_card()
        .cloned()
        .unwrap_or_else(|| LoyaltyCard::open(account_id, now));

    let available = card.points;
    let balance = bounded(available.checked_add(kind.signed(points)), points)?;
    if balance.is_sign_negative() {
        return Err(LedgerError::InsufficientBalance {
            requested: points,
            available,
        });
    }

    // Keep the per-account timeline monotonic
    let at = state.account.last_entry_at.map_or(now, |last| last.max(now));

    card.points = balance;
    card.updated_at = now;

    let mut change = AccountChange::from_state(state, now);
    if kind.moves_points() {
        change.account.last_points_update = Some(at);
        change.account.points_expiration_date = Some(expiration_date(at));
    }
    change.account.last_entry_at = Some(at);

    change.entry = Some(NewLedgerEntry {
        id: Uuid::new_v4(),
        account_id,
        card_id: card.id,
        kind,
        points,
        amount,
        reason: reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| default_reason(kind).to_string()),
        order_reference,
        running_balance: balance,
        created_at: at,
    });
    change.card = Some(card);

    Ok((change, balance))
}

/// Result of a recorded entry
#[derive(Debug, Clone)]
pub struct Recorded {
    pub entry: LedgerEntry,
    pub balance: Decimal,
}

pub struct BalanceEngine {
    store: Arc<dyn LoyaltyStore>,
    clock: Arc<dyn Clock>,
}

impl BalanceEngine {
    pub fn new(store: Arc<dyn LoyaltyStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn commit(&self, change: AccountChange, balance: Decimal) -> Result<Recorded> {
        let entry = self
            .store
            .commit(change)
            .await?
            .ok_or_else(|| {
                LedgerError::Storage(StoreError::Unavailable(
                    "ledger entry was not returned".to_string(),
                ))
            })?;

        Ok(Recorded { entry, balance })
    }

    /// Appends one entry and updates the cached balance atomically
    pub async fn record(&self, state: &AccountState, draft: EntryDraft) -> Result<Recorded> {
        let (change, balance) = plan_record(state, draft, self.clock.now())?;
        self.commit(change, balance).await
    }

    pub async fn earn(
        &self,
        state: &AccountState,
        points: Decimal,
        reason: Option<String>,
        order_reference: Option<String>,
    ) -> Result<Recorded> {
        if !state.account.is_active() {
            return Err(LedgerError::InactiveAccount);
        }

        self.record(state, EntryDraft::earn(points, reason, order_reference))
            .await
    }

    pub async fn redeem(
        &self,
        state: &AccountState,
        points: Decimal,
        order_reference: Option<String>,
    ) -> Result<Recorded> {
        if !state.account.is_active() {
            return Err(LedgerError::InactiveAccount);
        }

        if points <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(points));
        }

        let available = state.balance();
        if points > available {
            return Err(LedgerError::InsufficientBalance {
                requested: points,
                available,
            });
        }

        self.record(state, EntryDraft::redeem(points, order_reference))
            .await
    }

    /// Expires the whole balance once the horizon has passed.
    ///
    /// Returns `None` when there is nothing to expire.
    pub async fn expire(&self, state: &AccountState, today: NaiveDate) -> Result<Option<Recorded>> {
        let balance = state.balance();
        let due = state
            .account
            .points_expiration_date
            .map_or(false, |date| date < today);

        if !due || balance <= Decimal::ZERO {
            return Ok(None);
        }

        self.record(state, EntryDraft::expire(balance))
            .await
            .map(Some)
    }

    /// Records the first purchase discount at most once per account.
    ///
    /// Returns `None` for inactive accounts and accounts that already used it.
    pub async fn apply_first_purchase_discount(
        &self,
        state: &AccountState,
        order_total: Decimal,
        order_reference: Option<String>,
    ) -> Result<Option<Recorded>> {
        if !state.account.is_active() || state.account.first_purchase_used {
            return Ok(None);
        }

        if order_total.is_sign_negative() {
            return Err(LedgerError::InvalidAmount(order_total));
        }

        let discount = first_purchase_discount(order_total)?;
        let (mut change, balance) = plan_record(
            state,
            EntryDraft::discount(discount, order_reference),
            self.clock.now(),
        )?;
        change.account.first_purchase_used = true;

        self.commit(change, balance).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Account, ActivationStatus, CreateAccountData};
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn account(status: ActivationStatus) -> Account {
        let mut account = Account::new(
            CreateAccountData {
                name: "Ana".to_string(),
                email: format!("{}@example.com", Uuid::new_v4()),
                phone: None,
            },
            start(),
        );
        account.status = status;
        account
    }

    fn state_with_balance(balance: Decimal) -> AccountState {
        let account = account(ActivationStatus::Active);
        let mut card = LoyaltyCard::open(account.id, start());
        card.points = balance;
        AccountState {
            account,
            card: Some(card),
            token: None,
        }
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, BalanceEngine, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let engine = BalanceEngine::new(store.clone(), clock.clone());
        let account = account(ActivationStatus::Active);
        store.insert_account(&account).await.unwrap();
        (store, clock, engine, account.id)
    }

    async fn state(store: &MemoryStore, id: Uuid) -> AccountState {
        store.load_state(id).await.unwrap().unwrap()
    }

    #[test]
    fn test_plan_rejects_non_positive_points() {
        let state = state_with_balance(dec!(10));

        for points in [Decimal::ZERO, dec!(-5), dec!(0.001)] {
            let result = plan_record(&state, EntryDraft::earn(points, None, None), start());
            assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
        }
    }

    #[test]
    fn test_plan_discount_forces_zero_points() {
        let state = state_with_balance(dec!(10));
        let mut draft = EntryDraft::discount(dec!(12.5), None);
        draft.points = dec!(99);

        let (change, balance) = plan_record(&state, draft, start()).unwrap();
        let entry = change.entry.unwrap();

        assert_eq!(entry.points, Decimal::ZERO);
        assert_eq!(entry.amount, Some(dec!(12.5)));
        assert_eq!(entry.running_balance, dec!(10));
        assert_eq!(balance, dec!(10));
        // Discounts do not move the expiration horizon
        assert!(change.account.points_expiration_date.is_none());
    }

    #[test]
    fn test_plan_discount_requires_non_negative_amount() {
        let state = state_with_balance(dec!(10));

        let negative = plan_record(&state, EntryDraft::discount(dec!(-1), None), start());
        assert!(matches!(negative, Err(LedgerError::InvalidAmount(_))));

        let mut missing = EntryDraft::discount(Decimal::ZERO, None);
        missing.amount = None;
        assert!(matches!(
            plan_record(&state, missing, start()),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_plan_never_goes_negative() {
        let state = state_with_balance(dec!(10));

        let result = plan_record(&state, EntryDraft::redeem(dec!(10.01), None), start());
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientBalance { available, .. }) if available == dec!(10)
        ));
    }

    #[test]
    fn test_plan_sets_rolling_horizon() {
        let state = state_with_balance(Decimal::ZERO);

        let (change, _) = plan_record(&state, EntryDraft::earn(dec!(5), None, None), start()).unwrap();

        assert_eq!(change.account.last_points_update, Some(start()));
        assert_eq!(
            change.account.points_expiration_date,
            Some(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap())
        );
    }

    #[test]
    fn test_plan_clamps_timestamp_to_last_entry() {
        let mut state = state_with_balance(dec!(10));
        let later = start() + Duration::hours(1);
        state.account.last_entry_at = Some(later);

        let (change, _) = plan_record(&state, EntryDraft::earn(dec!(1), None, None), start()).unwrap();

        assert_eq!(change.entry.unwrap().created_at, later);
    }

    #[test]
    fn test_plan_uses_default_reason() {
        let state = state_with_balance(dec!(10));

        let (change, _) =
            plan_record(&state, EntryDraft::earn(dec!(1), Some("  ".into()), None), start()).unwrap();
        assert_eq!(change.entry.unwrap().reason, "Points added for purchase");
    }

    #[test]
    fn test_purchase_points_and_discount_rates() {
        assert_eq!(purchase_points(dec!(12.345)).unwrap(), dec!(61.72));
        assert_eq!(first_purchase_discount(dec!(250)).unwrap(), dec!(25));
        assert_eq!(first_purchase_discount(dec!(99.99)).unwrap(), dec!(10.00));
    }

    #[test]
    fn test_max_amount_is_column_limit() {
        assert_eq!(MAX_AMOUNT, dec!(999999999999.99));
    }

    #[test]
    fn test_rates_reject_huge_order_totals() {
        assert!(matches!(
            purchase_points(Decimal::MAX),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            purchase_points(dec!(200000000000)),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            first_purchase_discount(Decimal::MAX),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_plan_rejects_amounts_beyond_column_range() {
        let state = state_with_balance(Decimal::ZERO);

        for points in [Decimal::MAX, MAX_AMOUNT + dec!(0.01)] {
            let result = plan_record(&state, EntryDraft::earn(points, None, None), start());
            assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));
        }

        let discount = plan_record(
            &state,
            EntryDraft::discount(Decimal::MAX, None),
            start(),
        );
        assert!(matches!(discount, Err(LedgerError::InvalidAmount(_))));
    }

    #[test]
    fn test_plan_rejects_balance_overflow() {
        let state = state_with_balance(MAX_AMOUNT);

        let result = plan_record(&state, EntryDraft::earn(dec!(1), None, None), start());
        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));

        let (_, balance) =
            plan_record(&state, EntryDraft::redeem(dec!(1), None), start()).unwrap();
        assert_eq!(balance, MAX_AMOUNT - dec!(1));
    }

    #[tokio::test]
    async fn test_earn_requires_active_account() {
        let (store, _clock, engine, _) = setup().await;
        let inactive = account(ActivationStatus::Inactive);
        store.insert_account(&inactive).await.unwrap();

        let result = engine
            .earn(&state(&store, inactive.id).await, dec!(10), None, None)
            .await;
        assert!(matches!(result, Err(LedgerError::InactiveAccount)));
    }

    #[tokio::test]
    async fn test_balance_matches_ledger_sums() {
        let (store, clock, engine, id) = setup().await;

        engine
            .earn(&state(&store, id).await, dec!(100), Some("purchase".into()), None)
            .await
            .unwrap();
        clock.advance(Duration::minutes(1));
        engine
            .redeem(&state(&store, id).await, dec!(30), Some("SO-1".into()))
            .await
            .unwrap();
        clock.advance(Duration::minutes(1));
        engine
            .earn(&state(&store, id).await, dec!(12.5), None, None)
            .await
            .unwrap();

        let entries = store.entries(id).await;
        let mut prefix = Decimal::ZERO;
        for entry in &entries {
            prefix += entry.kind.signed(entry.points);
            assert_eq!(entry.running_balance, prefix);
        }

        assert_eq!(state(&store, id).await.balance(), dec!(82.5));
        assert_eq!(prefix, dec!(82.5));
    }

    #[tokio::test]
    async fn test_redeem_over_balance_leaves_balance_unchanged() {
        let (store, _clock, engine, id) = setup().await;
        engine
            .earn(&state(&store, id).await, dec!(100), None, None)
            .await
            .unwrap();

        let ok = engine
            .redeem(&state(&store, id).await, dec!(60), None)
            .await
            .unwrap();
        assert_eq!(ok.balance, dec!(40));

        let rejected = engine.redeem(&state(&store, id).await, dec!(60), None).await;
        assert!(matches!(
            rejected,
            Err(LedgerError::InsufficientBalance { .. })
        ));
        assert_eq!(state(&store, id).await.balance(), dec!(40));
        assert_eq!(store.entries(id).await.len(), 2);
    }

    #[tokio::test]
    async fn test_earn_beyond_max_balance_is_rejected() {
        let (store, _clock, engine, id) = setup().await;
        engine
            .earn(&state(&store, id).await, MAX_AMOUNT, None, None)
            .await
            .unwrap();

        let result = engine.earn(&state(&store, id).await, dec!(1), None, None).await;
        assert!(matches!(result, Err(LedgerError::InvalidAmount(_))));

        let huge = engine
            .earn(&state(&store, id).await, Decimal::MAX, None, None)
            .await;
        assert!(matches!(huge, Err(LedgerError::InvalidAmount(_))));

        assert_eq!(state(&store, id).await.balance(), MAX_AMOUNT);
        assert_eq!(store.entries(id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_cache_untouched() {
        let (store, _clock, engine, id) = setup().await;
        engine
            .earn(&state(&store, id).await, dec!(50), None, None)
            .await
            .unwrap();

        store.set_fail_on_commit(true);
        let result = engine.earn(&state(&store, id).await, dec!(25), None, None).await;
        assert!(matches!(result, Err(LedgerError::Storage(_))));

        store.set_fail_on_commit(false);
        assert_eq!(state(&store, id).await.balance(), dec!(50));
        assert_eq!(store.entries(id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_expire_after_horizon() {
        let (store, clock, engine, id) = setup().await;
        engine
            .earn(&state(&store, id).await, dec!(50), Some("purchase".into()), None)
            .await
            .unwrap();

        // Horizon not reached yet
        let today = clock.now().date_naive();
        assert!(engine
            .expire(&state(&store, id).await, today)
            .await
            .unwrap()
            .is_none());

        clock.advance(Duration::days(POINTS_VALIDITY_DAYS + 1));
        let today = clock.now().date_naive();
        let expired = engine
            .expire(&state(&store, id).await, today)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(expired.entry.kind, TransactionKind::Expire);
        assert_eq!(expired.entry.points, dec!(50));
        assert_eq!(expired.balance, Decimal::ZERO);
        assert_eq!(state(&store, id).await.balance(), Decimal::ZERO);

        // Nothing left; a second pass is a no-op
        assert!(engine
            .expire(&state(&store, id).await, today)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expire_skips_accounts_without_horizon() {
        let (store, clock, engine, id) = setup().await;

        let today = clock.now().date_naive() + Duration::days(1000);
        assert!(engine
            .expire(&state(&store, id).await, today)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_first_purchase_discount_once() {
        let (store, _clock, engine, id) = setup().await;

        let first = engine
            .apply_first_purchase_discount(&state(&store, id).await, dec!(200), Some("SO-7".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.entry.amount, Some(dec!(20)));
        assert_eq!(first.entry.points, Decimal::ZERO);

        let second = engine
            .apply_first_purchase_discount(&state(&store, id).await, dec!(200), None)
            .await
            .unwrap();
        assert!(second.is_none());

        let discounts = store
            .entries(id)
            .await
            .into_iter()
            .filter(|e| e.kind == TransactionKind::Discount)
            .count();
        assert_eq!(discounts, 1);
        assert!(state(&store, id).await.account.first_purchase_used);
    }
}
