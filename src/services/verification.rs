// Verification module - one token per account, consuming it activates the account

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::models::{Account, ActivationStatus, LoyaltyCard, VerificationToken};
use crate::store::{AccountChange, AccountState, LoyaltyStore, StoreError, UniqueField};

/// Random bytes per token
const TOKEN_BYTES: usize = 32;

/// Attempts before giving up on a colliding token
const MAX_ISSUE_ATTEMPTS: usize = 3;

pub trait TokenSource: Send + Sync {
    fn generate(&self) -> Option<String>;
}

/// URL-safe tokens from the system CSPRNG
pub struct RandomTokenSource {
    rng: SystemRandom,
}

impl RandomTokenSource {
    pub fn new() -> Self {
        Self {
            rng: SystemRandom::new(),
        }
    }
}

impl Default for RandomTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSource for RandomTokenSource {
    fn generate(&self) -> Option<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        self.rng.fill(&mut bytes).ok()?;
        Some(URL_SAFE_NO_PAD.encode(bytes))
    }
}

/// Account and card after a successful activation
#[derive(Debug, Clone)]
pub struct Activated {
    pub account: Account,
    pub card: LoyaltyCard,
}

pub struct VerificationService {
    store: Arc<dyn LoyaltyStore>,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenSource>,
}

impl VerificationService {
    pub fn new(
        store: Arc<dyn LoyaltyStore>,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            store,
            clock,
            tokens,
        }
    }

    fn next_token(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<VerificationToken> {
        let token = self.tokens.generate().ok_or_else(|| {
            LedgerError::Storage(StoreError::Unavailable(
                "secure random source failed".to_string(),
            ))
        })?;

        Ok(VerificationToken {
            account_id,
            token,
            issued_at: now,
            expires_at,
            consumed: false,
            consumed_at: None,
        })
    }

    /// Issues a fresh token, superseding any previous one.
    ///
    /// Caller holds the account lock.
    pub async fn issue(&self, state: &AccountState, ttl: Duration) -> Result<VerificationToken> {
        if state.account.is_active() {
            return Err(LedgerError::AlreadyActive);
        }

        if ttl <= Duration::zero() {
            return Err(LedgerError::InvalidInput(
                "Token lifetime must be positive".to_string(),
            ));
        }

        let now = self.clock.now();
        let expires_at = now.checked_add_signed(ttl).ok_or_else(|| {
            LedgerError::InvalidInput("Token lifetime is out of range".to_string())
        })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let token = self.next_token(state.account.id, now, expires_at)?;

            let mut change = AccountChange::from_state(state, now);
            change.token = Some(token.clone());

            match self.store.commit(change).await {
                Ok(_) => {
                    tracing::debug!(
                        account_id = %state.account.id,
                        expires_at = %token.expires_at,
                        "Issued verification token"
                    );
                    return Ok(token);
                }
                Err(StoreError::UniqueViolation(UniqueField::Token))
                    if attempts < MAX_ISSUE_ATTEMPTS =>
                {
                    tracing::warn!(account_id = %state.account.id, "Verification token collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Account the token was issued to
    pub async fn find_owner(&self, token: &str) -> Result<Uuid> {
        self.store
            .find_token(token)
            .await?
            .map(|t| t.account_id)
            .ok_or(LedgerError::TokenNotFound)
    }

    /// Validates `token` against the account's current token
    pub fn check(&self, state: &AccountState, token: &str) -> Result<VerificationToken> {
        let current = state
            .token
            .as_ref()
            .filter(|t| t.token == token)
            .ok_or(LedgerError::TokenNotFound)?;

        if current.is_expired_at(self.clock.now()) {
            return Err(LedgerError::TokenExpired);
        }

        if current.consumed {
            return Err(LedgerError::TokenAlreadyConsumed);
        }

        Ok(current.clone())
    }

    /// Consumes the token and activates the account and its loyalty card.
    ///
    /// Caller holds the account lock.
    pub async fn consume(&self, state: &AccountState, token: &str) -> Result<Activated> {
        let mut token = self.check(state, token)?;
        let now = self.clock.now();

        token.consumed = true;
        token.consumed_at = Some(now);

        let card = match &state.card {
            Some(existing) => {
                let mut card = existing.clone();
                card.is_active = true;
                card.updated_at = now;
                card
            }
            None => LoyaltyCard::open(state.account.id, now),
        };

        let mut change = AccountChange::from_state(state, now);
        change.account.status = ActivationStatus::Active;
        change.card = Some(card.clone());
        change.token = Some(token);
        let account = change.account.clone();

        self.store.commit(change).await?;

        tracing::info!(account_id = %account.id, card_id = %card.id, "Account activated");

        Ok(Activated { account, card })
    }
}

/// Hands out a fixed sequence of tokens
#[cfg(test)]
pub(crate) struct FixedTokens {
    tokens: std::sync::Mutex<std::collections::VecDeque<String>>,
}

#[cfg(test)]
impl FixedTokens {
    pub(crate) fn new(tokens: &[&str]) -> Self {
        Self {
            tokens: std::sync::Mutex::new(tokens.iter().map(|t| t.to_string()).collect()),
        }
    }
}

#[cfg(test)]
impl TokenSource for FixedTokens {
    fn generate(&self) -> Option<String> {
        self.tokens.lock().unwrap().pop_front()
    }
}
