// Loyalty service - mutations run lock, load, plan, commit, notify

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rust_decimal::Decimal;
use url::Url;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::models::{
    account::{normalize_email, normalize_phone},
    Account, AccountSummary, CreateAccountData, HistoryQuery, HistoryRecord, LedgerEntry,
    Reconciliation, VerificationToken,
};
use crate::services::balance::{purchase_points, BalanceEngine};
use crate::services::locks::{AccountGuard, AccountLocks};
use crate::services::notifier::{LoyaltyEvent, LoyaltyNotifier};
use crate::services::verification::{Activated, TokenSource, VerificationService};
use crate::store::{AccountState, ExpiryCursor, LoyaltyStore};

#[derive(Debug, Clone)]
pub struct LoyaltySettings {
    /// Lifetime of a verification token
    pub token_ttl: Duration,
    /// Longest wait for an account's lock
    pub lock_timeout: StdDuration,
    /// Accounts handled per expiration sweep run
    pub expiry_batch_size: i64,
    /// Public base URL for verification links
    pub verification_base_url: Option<Url>,
}

impl Default for LoyaltySettings {
    fn default() -> Self {
        Self {
            token_ttl: Duration::hours(24),
            lock_timeout: StdDuration::from_secs(2),
            expiry_batch_size: 500,
            verification_base_url: None,
        }
    }
}

/// A newly registered account and its first verification token
#[derive(Debug, Clone)]
pub struct Registration {
    pub account: Account,
    pub token: VerificationToken,
}

pub struct LoyaltyService {
    store: Arc<dyn LoyaltyStore>,
    clock: Arc<dyn Clock>,
    locks: AccountLocks,
    balances: BalanceEngine,
    verification: VerificationService,
    notifier: Arc<dyn LoyaltyNotifier>,
    settings: LoyaltySettings,
}

impl LoyaltyService {
    pub fn new(
        store: Arc<dyn LoyaltyStore>,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn TokenSource>,
        notifier: Arc<dyn LoyaltyNotifier>,
        settings: LoyaltySettings,
    ) -> Self {
        Self {
            locks: AccountLocks::new(settings.lock_timeout),
            balances: BalanceEngine::new(store.clone(), clock.clone()),
            verification: VerificationService::new(store.clone(), clock.clone(), tokens),
            store,
            clock,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &LoyaltySettings {
        &self.settings
    }

    /// Takes the account's lock and loads its current state
    async fn lock_account(&self, account_id: Uuid) -> Result<(AccountGuard, AccountState)> {
        let guard = self.locks.acquire(account_id).await?;
        let state = self
            .store
            .load_state(account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound)?;

        Ok((guard, state))
    }

    async fn ensure_exists(&self, account_id: Uuid) -> Result<Account> {
        self.store
            .find_account(account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound)
    }

    fn verification_link(&self, token: &str) -> Option<String> {
        self.settings
            .verification_base_url
            .as_ref()
            .and_then(|base| base.join(&format!("loyalty/verify/{}", token)).ok())
            .map(String::from)
    }

    /// Creates an inactive account and sends its first verification token
    #[tracing::instrument(skip(self, data), fields(email = %data.email))]
    pub async fn register(&self, data: CreateAccountData) -> Result<Registration> {
        data.validate()?;

        let account = Account::new(data, self.clock.now());
        self.store.insert_account(&account).await?;

        tracing::info!(account_id = %account.id, "Account registered");

        let token = self.issue_token(account.id, None).await?;
        Ok(Registration { account, token })
    }

    pub async fn is_email_available(&self, email: &str) -> Result<bool> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(LedgerError::InvalidInput("Email is required".to_string()));
        }

        Ok(!self.store.email_taken(&email).await?)
    }

    pub async fn is_phone_available(&self, phone: &str) -> Result<bool> {
        let phone = normalize_phone(phone);
        if phone.is_empty() {
            return Err(LedgerError::InvalidInput("Phone is required".to_string()));
        }

        Ok(!self.store.phone_taken(&phone).await?)
    }

    /// Issues a verification token; `ttl` defaults to the configured lifetime
    #[tracing::instrument(skip(self))]
    pub async fn issue_token(
        &self,
        account_id: Uuid,
        ttl: Option<Duration>,
    ) -> Result<VerificationToken> {
        let (_guard, state) = self.lock_account(account_id).await?;
        let ttl = ttl.unwrap_or(self.settings.token_ttl);

        let token = self.verification.issue(&state, ttl).await?;

        self.notifier.notify(LoyaltyEvent::VerificationIssued {
            account_id,
            name: state.account.name.clone(),
            email: state.account.email.clone(),
            token: token.token.clone(),
            verification_link: self.verification_link(&token.token),
            expires_at: token.expires_at,
        });

        Ok(token)
    }

    /// Reissues the token of a pending account looked up by email
    #[tracing::instrument(skip(self))]
    pub async fn resend_verification(&self, email: &str) -> Result<VerificationToken> {
        let account = self
            .store
            .find_account_by_email(&normalize_email(email))
            .await?
            .ok_or(LedgerError::AccountNotFound)?;

        if account.is_active() {
            return Err(LedgerError::AlreadyActive);
        }

        self.issue_token(account.id, None).await
    }

    /// Consumes `token` for `account_id` and activates the account
    #[tracing::instrument(skip(self, token))]
    pub async fn activate(&self, account_id: Uuid, token: &str) -> Result<Activated> {
        let (_guard, state) = self.lock_account(account_id).await?;

        let activated = self.verification.consume(&state, token).await?;

        self.notifier.notify(LoyaltyEvent::AccountActivated {
            account_id,
            name: activated.account.name.clone(),
            email: activated.account.email.clone(),
        });

        Ok(activated)
    }

    /// Activates whichever account `token` was issued to
    #[tracing::instrument(skip(self, token))]
    pub async fn activate_by_token(&self, token: &str) -> Result<Activated> {
        let account_id = self.verification.find_owner(token).await?;
        self.activate(account_id, token).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn earn(
        &self,
        account_id: Uuid,
        points: Decimal,
        reason: Option<String>,
        order_reference: Option<String>,
    ) -> Result<LedgerEntry> {
        let (_guard, state) = self.lock_account(account_id).await?;

        let recorded = self
            .balances
            .earn(&state, points, reason, order_reference)
            .await?;

        tracing::info!(points = %points, balance = %recorded.balance, "Points earned");
        Ok(recorded.entry)
    }

    #[tracing::instrument(skip(self))]
    pub async fn redeem(
        &self,
        account_id: Uuid,
        points: Decimal,
        order_reference: Option<String>,
    ) -> Result<LedgerEntry> {
        let (_guard, state) = self.lock_account(account_id).await?;
        let points_before = state.balance();

        let recorded = self
            .balances
            .redeem(&state, points, order_reference.clone())
            .await?;

        tracing::info!(points = %points, balance = %recorded.balance, "Points redeemed");

        self.notifier.notify(LoyaltyEvent::PointsRedeemed {
            account_id,
            name: state.account.name.clone(),
            email: state.account.email.clone(),
            points_before,
            points_redeemed: recorded.entry.points,
            points_after: recorded.balance,
            order_reference,
        });

        Ok(recorded.entry)
    }

    /// Earns points for a purchase. Returns `None` when nothing is awarded.
    #[tracing::instrument(skip(self))]
    pub async fn award_purchase_points(
        &self,
        account_id: Uuid,
        order_total: Decimal,
        order_reference: Option<String>,
    ) -> Result<Option<LedgerEntry>> {
        if order_total.is_sign_negative() {
            return Err(LedgerError::InvalidAmount(order_total));
        }

        let points = purchase_points(order_total)?;
        let (_guard, state) = self.lock_account(account_id).await?;

        if points.is_zero() || !state.account.is_active() {
            tracing::debug!(points = %points, "No purchase points awarded");
            return Ok(None);
        }

        let reason = order_reference
            .as_deref()
            .map(|order| format!("Points added for order {}", order));
        let recorded = self
            .balances
            .earn(&state, points, reason, order_reference)
            .await?;

        Ok(Some(recorded.entry))
    }

    /// Returns the discount granted, or `None` if the account is not eligible
    #[tracing::instrument(skip(self))]
    pub async fn apply_first_purchase_discount(
        &self,
        account_id: Uuid,
        order_total: Decimal,
        order_reference: Option<String>,
    ) -> Result<Option<Decimal>> {
        let (_guard, state) = self.lock_account(account_id).await?;

        let recorded = self
            .balances
            .apply_first_purchase_discount(&state, order_total, order_reference)
            .await?;

        Ok(recorded.and_then(|r| r.entry.amount))
    }

    /// Expires the account's points if its horizon has passed
    #[tracing::instrument(skip(self))]
    pub async fn expire_points(&self, account_id: Uuid) -> Result<Option<LedgerEntry>> {
        let (_guard, state) = self.lock_account(account_id).await?;

        let recorded = self.balances.expire(&state, self.today()).await?;
        if let Some(r) = &recorded {
            tracing::info!(points = %r.entry.points, "Points expired");
        }

        Ok(recorded.map(|r| r.entry))
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.now().date_naive()
    }

    /// Next batch of accounts with points past their expiration date,
    /// continuing after `after`
    pub async fn accounts_due_for_expiry(
        &self,
        after: Option<ExpiryCursor>,
    ) -> Result<Vec<ExpiryCursor>> {
        Ok(self
            .store
            .accounts_with_expired_points(self.today(), after, self.settings.expiry_batch_size)
            .await?)
    }

    #[cfg(test)]
    pub(crate) fn locks(&self) -> &AccountLocks {
        &self.locks
    }

    pub async fn summary(&self, account_id: Uuid) -> Result<AccountSummary> {
        let snapshot = self
            .store
            .snapshot(account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound)?;

        Ok(AccountSummary::build(
            &snapshot.state.account,
            snapshot.state.card.as_ref(),
            &snapshot.totals,
        ))
    }

    /// Ledger entries newest first, optionally bounded by date and count
    pub async fn export_history(
        &self,
        account_id: Uuid,
        query: &HistoryQuery,
    ) -> Result<Vec<HistoryRecord>> {
        if let (Some(from), Some(to)) = (query.date_from, query.date_to) {
            if from > to {
                return Err(LedgerError::InvalidInput(
                    "date_from must not be after date_to".to_string(),
                ));
            }
        }

        if query.limit.map_or(false, |l| l <= 0) {
            return Err(LedgerError::InvalidInput(
                "limit must be positive".to_string(),
            ));
        }

        self.ensure_exists(account_id).await?;

        let entries = self.store.history(account_id, query).await?;
        Ok(entries.into_iter().map(HistoryRecord::from).collect())
    }

    /// Balance derived from the log as of `at`
    pub async fn balance_at(&self, account_id: Uuid, at: DateTime<Utc>) -> Result<Decimal> {
        self.ensure_exists(account_id).await?;
        Ok(self.store.balance_at(account_id, at).await?)
    }

    /// Compares the cached card total with the log
    pub async fn reconcile(&self, account_id: Uuid) -> Result<Reconciliation> {
        let snapshot = self
            .store
            .snapshot(account_id)
            .await?
            .ok_or(LedgerError::AccountNotFound)?;

        let reconciliation = Reconciliation {
            account_id,
            cached_balance: snapshot.state.balance(),
            ledger_balance: snapshot.totals.balance(),
            last_running_balance: snapshot.last_running_balance,
        };

        if !reconciliation.is_consistent() {
            tracing::error!(
                account_id = %account_id,
                cached = %reconciliation.cached_balance,
                ledger = %reconciliation.ledger_balance,
                "Cached balance disagrees with ledger"
            );
        }

        Ok(reconciliation)
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.store.ping().await?)
    }
}
