use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Idle lock entries are pruned once the table grows past this size
const PRUNE_THRESHOLD: usize = 1024;

#[derive(thiserror::Error, Debug)]
#[error("Timed out after {0:?} waiting for account lock")]
pub struct LockTimedOut(pub Duration);

/// Held for the duration of one account mutation
pub type AccountGuard = OwnedMutexGuard<()>;

/// Per-account exclusive locks with a bounded wait.
///
/// Accounts never share a lock, so mutations on different accounts proceed in
/// parallel.
pub struct AccountLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Duration,
}

impl AccountLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits at most the configured timeout for the account's lock
    pub async fn acquire(&self, account_id: Uuid) -> Result<AccountGuard, LockTimedOut> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() >= PRUNE_THRESHOLD {
                // Only the table itself references an idle lock
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(account_id).or_default().clone()
        };

        tokio::time::timeout(self.timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                tracing::warn!(
                    account_id = %account_id,
                    timeout_ms = self.timeout.as_millis(),
                    "Account lock wait timed out"
                );
                LockTimedOut(self.timeout)
            })
    }
}
