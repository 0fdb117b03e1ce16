// In-memory store for tests and database-less runs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Account, HistoryQuery, LedgerEntry, LedgerTotals, LoyaltyCard, VerificationToken};
use crate::store::{
    AccountChange, AccountSnapshot, AccountState, ExpiryCursor, LoyaltyStore, StoreError,
    StoreResult, UniqueField,
};

#[derive(Default)]
struct Tables {
    accounts: HashMap<Uuid, Account>,
    emails: HashMap<String, Uuid>,
    phones: HashMap<String, Uuid>,
    cards: HashMap<Uuid, Vec<LoyaltyCard>>,
    // Per account, insertion order
    entries: HashMap<Uuid, Vec<LedgerEntry>>,
    tokens: HashMap<Uuid, VerificationToken>,
    token_owners: HashMap<String, Uuid>,
    next_sequence: i64,
}

impl Tables {
    fn state_of(&self, account_id: Uuid) -> Option<AccountState> {
        let account = self.accounts.get(&account_id)?.clone();
        let card = self.cards.get(&account_id).and_then(|cards| {
            cards
                .iter()
                .find(|c| c.is_ledger_eligible())
                .or_else(|| cards.last())
                .cloned()
        });
        let token = self.tokens.get(&account_id).cloned();

        Some(AccountState {
            account,
            card,
            token,
        })
    }

    fn owns_card(&self, account_id: Uuid, card_id: Uuid) -> bool {
        self.cards
            .get(&account_id)
            .map_or(false, |cards| cards.iter().any(|c| c.id == card_id))
    }

    fn ordered_entries(&self, account_id: Uuid) -> Vec<&LedgerEntry> {
        let mut entries: Vec<&LedgerEntry> = self
            .entries
            .get(&account_id)
            .map(|e| e.iter().collect())
            .unwrap_or_default();
        entries.sort_by_key(|e| (e.created_at, e.sequence));
        entries
    }

    fn check(&self, change: &AccountChange) -> StoreResult<()> {
        let account_id = change.account.id;
        let current = self
            .accounts
            .get(&account_id)
            .ok_or(StoreError::MissingAccount(account_id))?;

        if current.revision != change.expected_revision {
            return Err(StoreError::RevisionConflict {
                account_id,
                expected: change.expected_revision,
            });
        }

        if let Some(card) = &change.card {
            if card.account_id != account_id {
                return Err(StoreError::CardMismatch {
                    account_id,
                    card_id: card.id,
                });
            }
        }

        if let Some(entry) = &change.entry {
            let card_in_change = change.card.as_ref().map_or(false, |c| c.id == entry.card_id);
            if entry.account_id != account_id
                || !(card_in_change || self.owns_card(account_id, entry.card_id))
            {
                return Err(StoreError::CardMismatch {
                    account_id,
                    card_id: entry.card_id,
                });
            }
        }

        if let Some(token) = &change.token {
            let taken_by_other = self
                .token_owners
                .get(&token.token)
                .map_or(false, |owner| *owner != account_id);
            if token.account_id != account_id || taken_by_other {
                return Err(StoreError::UniqueViolation(UniqueField::Token));
            }
        }

        Ok(())
    }
}

/// Store backed by hash maps behind a single `RwLock`, so every commit and
/// every snapshot is atomic with respect to the others.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    fail_on_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent commit fail before touching any table
    pub fn set_fail_on_commit(&self, fail: bool) {
        self.fail_on_commit.store(fail, Ordering::SeqCst);
    }

    /// All entries of an account in timeline order
    pub async fn entries(&self, account_id: Uuid) -> Vec<LedgerEntry> {
        let tables = self.tables.read().await;
        tables
            .ordered_entries(account_id)
            .into_iter()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl LoyaltyStore for MemoryStore {
    async fn insert_account(&self, account: &Account) -> StoreResult<()> {
        let mut tables = self.tables.write().await;

        if tables.emails.contains_key(&account.email) {
            return Err(StoreError::UniqueViolation(UniqueField::Email));
        }
        if let Some(phone) = &account.phone_normalized {
            if tables.phones.contains_key(phone) {
                return Err(StoreError::UniqueViolation(UniqueField::Phone));
            }
            tables.phones.insert(phone.clone(), account.id);
        }

        tables.emails.insert(account.email.clone(), account.id);
        tables.accounts.insert(account.id, account.clone());

        Ok(())
    }

    async fn find_account(&self, id: Uuid) -> StoreResult<Option<Account>> {
        Ok(self.tables.read().await.accounts.get(&id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let tables = self.tables.read().await;
        Ok(tables
            .emails
            .get(email)
            .and_then(|id| tables.accounts.get(id))
            .cloned())
    }

    async fn email_taken(&self, email: &str) -> StoreResult<bool> {
        Ok(self.tables.read().await.emails.contains_key(email))
    }

    async fn phone_taken(&self, phone_normalized: &str) -> StoreResult<bool> {
        Ok(self.tables.read().await.phones.contains_key(phone_normalized))
    }

    async fn load_state(&self, account_id: Uuid) -> StoreResult<Option<AccountState>> {
        Ok(self.tables.read().await.state_of(account_id))
    }

    async fn find_token(&self, token: &str) -> StoreResult<Option<VerificationToken>> {
        let tables = self.tables.read().await;
        Ok(tables
            .token_owners
            .get(token)
            .and_then(|owner| tables.tokens.get(owner))
            .cloned())
    }

    async fn commit(&self, change: AccountChange) -> StoreResult<Option<LedgerEntry>> {
        if self.fail_on_commit.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("commit rejected".to_string()));
        }

        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        // Validate first so a rejected change leaves nothing behind
        tables.check(&change)?;

        let account_id = change.account.id;
        let mut account = change.account;
        account.revision = change.expected_revision + 1;
        tables.accounts.insert(account_id, account);

        if let Some(card) = change.card {
            let cards = tables.cards.entry(account_id).or_default();
            match cards.iter_mut().find(|c| c.id == card.id) {
                Some(existing) => *existing = card,
                None => cards.push(card),
            }
        }

        if let Some(token) = change.token {
            if let Some(previous) = tables.tokens.get(&account_id) {
                tables.token_owners.remove(&previous.token);
            }
            tables.token_owners.insert(token.token.clone(), account_id);
            tables.tokens.insert(account_id, token);
        }

        let entry = change.entry.map(|new_entry| {
            tables.next_sequence += 1;
            let entry = new_entry.with_sequence(tables.next_sequence);
            tables
                .entries
                .entry(account_id)
                .or_default()
                .push(entry.clone());
            entry
        });

        Ok(entry)
    }

    async fn snapshot(&self, account_id: Uuid) -> StoreResult<Option<AccountSnapshot>> {
        let tables = self.tables.read().await;
        let Some(state) = tables.state_of(account_id) else {
            return Ok(None);
        };

        let ordered = tables.ordered_entries(account_id);
        let last_running_balance = ordered.last().map(|e| e.running_balance);
        let totals = LedgerTotals::from_entries(ordered);

        Ok(Some(AccountSnapshot {
            state,
            totals,
            last_running_balance,
        }))
    }

    async fn history(
        &self,
        account_id: Uuid,
        query: &HistoryQuery,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let tables = self.tables.read().await;
        let limit = query
            .limit
            .and_then(|l| usize::try_from(l).ok())
            .unwrap_or(usize::MAX);

        Ok(tables
            .ordered_entries(account_id)
            .into_iter()
            .rev()
            .filter(|e| query.matches(e))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn balance_at(&self, account_id: Uuid, at: DateTime<Utc>) -> StoreResult<Decimal> {
        let tables = self.tables.read().await;
        let totals = LedgerTotals::from_entries(
            tables
                .ordered_entries(account_id)
                .into_iter()
                .filter(|e| e.created_at <= at),
        );
        Ok(totals.balance())
    }

    async fn accounts_with_expired_points(
        &self,
        today: NaiveDate,
        after: Option<ExpiryCursor>,
        limit: i64,
    ) -> StoreResult<Vec<ExpiryCursor>> {
        let tables = self.tables.read().await;

        let mut due: Vec<ExpiryCursor> = tables
            .accounts
            .values()
            .filter_map(|a| {
                a.points_expiration_date.map(|expires_on| ExpiryCursor {
                    expires_on,
                    account_id: a.id,
                })
            })
            .filter(|c| c.expires_on < today)
            .filter(|c| after.map_or(true, |after| *c > after))
            .filter(|c| {
                tables
                    .state_of(c.account_id)
                    .map_or(false, |s| s.balance() > Decimal::ZERO)
            })
            .collect();
        due.sort();
        due.truncate(usize::try_from(limit).unwrap_or(0));

        Ok(due)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
