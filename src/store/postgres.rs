// PostgreSQL store - revision-guarded commits, REPEATABLE READ snapshots

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::models::{
    Account, HistoryQuery, LedgerEntry, LedgerTotals, LoyaltyCard, TransactionKind,
    VerificationToken,
};
use crate::store::{
    AccountChange, AccountSnapshot, AccountState, ExpiryCursor, LoyaltyStore, StoreError,
    StoreResult, UniqueField,
};

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// PostgreSQL implementation of LoyaltyStore
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Maps constraint violations onto store errors
fn classify(err: sqlx::Error, account_id: Uuid, card_id: Option<Uuid>) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(UNIQUE_VIOLATION) => match db.constraint() {
                Some("loyalty_accounts_email_key") => {
                    return StoreError::UniqueViolation(UniqueField::Email)
                }
                Some("loyalty_accounts_phone_key") => {
                    return StoreError::UniqueViolation(UniqueField::Phone)
                }
                Some("loyalty_verification_tokens_token_key") => {
                    return StoreError::UniqueViolation(UniqueField::Token)
                }
                _ => {}
            },
            Some(FOREIGN_KEY_VIOLATION) => {
                if let Some(card_id) = card_id {
                    return StoreError::CardMismatch {
                        account_id,
                        card_id,
                    };
                }
            }
            _ => {}
        }
    }
    StoreError::Database(err)
}

async fn load_state_in(conn: &mut PgConnection, account_id: Uuid) -> StoreResult<Option<AccountState>> {
    let account = sqlx::query_as::<_, Account>(
        r#"
        SELECT * FROM loyalty_accounts WHERE id = $1
        "#,
    )
    .bind(account_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(account) = account else {
        return Ok(None);
    };

    let card = sqlx::query_as::<_, LoyaltyCard>(
        r#"
        SELECT * FROM loyalty_cards
        WHERE account_id = $1
        ORDER BY (is_active AND program = 'loyalty') DESC, created_at DESC
        LIMIT 1
        "#,
    )
    .bind(account_id)
    .fetch_optional(&mut *conn)
    .await?;

    let token = sqlx::query_as::<_, VerificationToken>(
        r#"
        SELECT * FROM loyalty_verification_tokens WHERE account_id = $1
        "#,
    )
    .bind(account_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(Some(AccountState {
        account,
        card,
        token,
    }))
}

#[async_trait]
impl LoyaltyStore for PgStore {
    async fn insert_account(&self, account: &Account) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO loyalty_accounts (
                id, name, email, phone, phone_normalized, status,
                first_purchase_used, last_points_update, points_expiration_date,
                last_entry_at, revision, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(account.id)
        .bind(&account.name)
        .bind(&account.email)
        .bind(&account.phone)
        .bind(&account.phone_normalized)
        .bind(account.status.as_str())
        .bind(account.first_purchase_used)
        .bind(account.last_points_update)
        .bind(account.points_expiration_date)
        .bind(account.last_entry_at)
        .bind(account.revision)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| classify(e, account.id, None))?;

        Ok(())
    }

    async fn find_account(&self, id: Uuid) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT * FROM loyalty_accounts WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn find_account_by_email(&self, email: &str) -> StoreResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT * FROM loyalty_accounts WHERE LOWER(email) = LOWER($1)
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    async fn email_taken(&self, email: &str) -> StoreResult<bool> {
        let taken = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM loyalty_accounts WHERE LOWER(email) = LOWER($1))
            "#,
        )
        .bind(email)
        .fetch_one(&self.pool)
        .await?;

        Ok(taken)
    }

    async fn phone_taken(&self, phone_normalized: &str) -> StoreResult<bool> {
        let taken = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM loyalty_accounts WHERE phone_normalized = $1)
            "#,
        )
        .bind(phone_normalized)
        .fetch_one(&self.pool)
        .await?;

        Ok(taken)
    }

    async fn load_state(&self, account_id: Uuid) -> StoreResult<Option<AccountState>> {
        let mut conn = self.pool.acquire().await?;
        load_state_in(&mut *conn, account_id).await
    }

    async fn find_token(&self, token: &str) -> StoreResult<Option<VerificationToken>> {
        let token = sqlx::query_as::<_, VerificationToken>(
            r#"
            SELECT * FROM loyalty_verification_tokens WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(token)
    }

    async fn commit(&self, change: AccountChange) -> StoreResult<Option<LedgerEntry>> {
        let account = &change.account;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE loyalty_accounts
            SET
                status = $3,
                first_purchase_used = $4,
                last_points_update = $5,
                points_expiration_date = $6,
                last_entry_at = $7,
                updated_at = $8,
                revision = revision + 1
            WHERE id = $1 AND revision = $2
            "#,
        )
        .bind(account.id)
        .bind(change.expected_revision)
        .bind(account.status.as_str())
        .bind(account.first_purchase_used)
        .bind(account.last_points_update)
        .bind(account.points_expiration_date)
        .bind(account.last_entry_at)
        .bind(account.updated_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, bool>(
                r#"
                SELECT EXISTS (SELECT 1 FROM loyalty_accounts WHERE id = $1)
                "#,
            )
            .bind(account.id)
            .fetch_one(&mut *tx)
            .await?;

            return Err(if exists {
                StoreError::RevisionConflict {
                    account_id: account.id,
                    expected: change.expected_revision,
                }
            } else {
                StoreError::MissingAccount(account.id)
            });
        }

        if let Some(card) = &change.card {
            if card.account_id != account.id {
                return Err(StoreError::CardMismatch {
                    account_id: account.id,
                    card_id: card.id,
                });
            }

            sqlx::query(
                r#"
                INSERT INTO loyalty_cards (id, account_id, program, is_active, points, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (id) DO UPDATE
                SET
                    is_active = EXCLUDED.is_active,
                    points = EXCLUDED.points,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(card.id)
            .bind(card.account_id)
            .bind(&card.program)
            .bind(card.is_active)
            .bind(card.points)
            .bind(card.created_at)
            .bind(card.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(token) = &change.token {
            sqlx::query(
                r#"
                INSERT INTO loyalty_verification_tokens (account_id, token, issued_at, expires_at, consumed, consumed_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (account_id) DO UPDATE
                SET
                    token = EXCLUDED.token,
                    issued_at = EXCLUDED.issued_at,
                    expires_at = EXCLUDED.expires_at,
                    consumed = EXCLUDED.consumed,
                    consumed_at = EXCLUDED.consumed_at
                "#,
            )
            .bind(account.id)
            .bind(&token.token)
            .bind(token.issued_at)
            .bind(token.expires_at)
            .bind(token.consumed)
            .bind(token.consumed_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(e, account.id, None))?;
        }

        let entry = match &change.entry {
            Some(entry) => {
                let inserted = sqlx::query_as::<_, LedgerEntry>(
                    r#"
                    INSERT INTO loyalty_ledger_entries (
                        id, account_id, card_id, kind, points, amount,
                        reason, order_reference, running_balance, created_at
                    )
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                    RETURNING *
                    "#,
                )
                .bind(entry.id)
                .bind(entry.account_id)
                .bind(entry.card_id)
                .bind(entry.kind.as_str())
                .bind(entry.points)
                .bind(entry.amount)
                .bind(&entry.reason)
                .bind(&entry.order_reference)
                .bind(entry.running_balance)
                .bind(entry.created_at)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| classify(e, account.id, Some(entry.card_id)))?;

                Some(inserted)
            }
            None => None,
        };

        tx.commit().await?;

        Ok(entry)
    }

    async fn snapshot(&self, account_id: Uuid) -> StoreResult<Option<AccountSnapshot>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let Some(state) = load_state_in(&mut *tx, account_id).await? else {
            tx.commit().await?;
            return Ok(None);
        };

        let groups = sqlx::query_as::<_, (TransactionKind, Decimal, Decimal, i64)>(
            r#"
            SELECT
                kind,
                COALESCE(SUM(points), 0) AS points,
                COALESCE(SUM(amount), 0) AS amount,
                COUNT(*) AS entries
            FROM loyalty_ledger_entries
            WHERE account_id = $1
            GROUP BY kind
            "#,
        )
        .bind(account_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut totals = LedgerTotals::default();
        for (kind, points, amount, entries) in groups {
            match kind {
                TransactionKind::Earn => totals.earned = points,
                TransactionKind::Redeem => totals.redeemed = points,
                TransactionKind::Expire => totals.expired = points,
                TransactionKind::Discount => totals.discounted = amount,
            }
            totals.entries += entries;
        }

        let last_running_balance = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT running_balance FROM loyalty_ledger_entries
            WHERE account_id = $1
            ORDER BY created_at DESC, sequence DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

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
        let entries = sqlx::query_as::<_, LedgerEntry>(
            r#"
            SELECT * FROM loyalty_ledger_entries
            WHERE account_id = $1
                AND ($2::timestamptz IS NULL OR created_at >= $2)
                AND ($3::timestamptz IS NULL OR created_at <= $3)
            ORDER BY created_at DESC, sequence DESC
            LIMIT $4
            "#,
        )
        .bind(account_id)
        .bind(query.date_from)
        .bind(query.date_to)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    async fn balance_at(&self, account_id: Uuid, at: DateTime<Utc>) -> StoreResult<Decimal> {
        let balance = sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(
                CASE kind
                    WHEN 'earn' THEN points
                    WHEN 'redeem' THEN -points
                    WHEN 'expire' THEN -points
                    ELSE 0
                END
            ), 0)
            FROM loyalty_ledger_entries
            WHERE account_id = $1 AND created_at <= $2
            "#,
        )
        .bind(account_id)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(balance)
    }

    async fn accounts_with_expired_points(
        &self,
        today: NaiveDate,
        after: Option<ExpiryCursor>,
        limit: i64,
    ) -> StoreResult<Vec<ExpiryCursor>> {
        let rows = sqlx::query_as::<_, (NaiveDate, Uuid)>(
            r#"
            SELECT a.points_expiration_date, a.id
            FROM loyalty_accounts a
            JOIN loyalty_cards c
                ON c.account_id = a.id AND c.is_active AND c.program = 'loyalty'
            WHERE a.points_expiration_date < $1 AND c.points > 0
              AND ($2::date IS NULL OR (a.points_expiration_date, a.id) > ($2::date, $3::uuid))
            ORDER BY a.points_expiration_date, a.id
            LIMIT $4
            "#,
        )
        .bind(today)
        .bind(after.map(|c| c.expires_on))
        .bind(after.map(|c| c.account_id))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(expires_on, account_id)| ExpiryCursor {
                expires_on,
                account_id,
            })
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
