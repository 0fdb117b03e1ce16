use std::sync::Arc;

use rust_decimal::Decimal;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};

use crate::error::LedgerError;
use crate::services::loyalty::LoyaltyService;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExpirationStats {
    pub total_checked: usize,
    pub accounts_expired: usize,
    pub points_expired: Decimal,
    pub skipped: usize,
    pub failures: usize,
}

/// Expires the points of every account whose expiration date has passed
///
/// Due accounts are paged through in batches, each batch starting after the
/// last account of the previous one. Each account is expired under its own
/// lock in its own commit, so a failure leaves the accounts already processed
/// expired. Failed accounts are left for the next run.
pub async fn expire_due_points(service: &LoyaltyService) -> Result<ExpirationStats, LedgerError> {
    let mut stats = ExpirationStats::default();
    let mut cursor = None;

    loop {
        let due = service.accounts_due_for_expiry(cursor).await?;

        let Some(last) = due.last().copied() else {
            break;
        };
        cursor = Some(last);

        tracing::info!(batch = due.len(), "Expiring points for due accounts");

        for account_id in due.into_iter().map(|c| c.account_id) {
            stats.total_checked += 1;

            match service.expire_points(account_id).await {
                Ok(Some(entry)) => {
                    stats.accounts_expired += 1;
                    stats.points_expired += entry.points;
                }
                Ok(None) => stats.skipped += 1,
                Err(e) => {
                    tracing::error!(
                        account_id = %account_id,
                        error = %e,
                        retryable = e.is_retryable(),
                        "Failed to expire points"
                    );
                    stats.failures += 1;
                }
            }
        }
    }

    tracing::info!(?stats, "Points expiration job completed");

    Ok(stats)
}

/// Schedules the expiration sweep on `cron` (seconds-resolution expression)
pub async fn start_scheduler(
    service: Arc<LoyaltyService>,
    cron: &str,
) -> Result<JobScheduler, JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;

    let job = Job::new_async(cron, move |_id, _scheduler| {
        let service = service.clone();
        Box::pin(async move {
            if let Err(e) = expire_due_points(&service).await {
                tracing::error!(error = %e, "Points expiration job aborted");
            }
        })
    })?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    tracing::info!(cron = %cron, "Points expiration job scheduled");

    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::services::balance::POINTS_VALIDITY_DAYS;
    use crate::services::loyalty::LoyaltySettings;
    use crate::services::notifier::LogNotifier;
    use crate::services::verification::FixedTokens;
    use crate::models::CreateAccountData;
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    struct Harness {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        service: LoyaltyService,
    }

    fn harness(tokens: &[&str]) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 2, 1, 8, 0, 0).unwrap(),
        ));
        let service = LoyaltyService::new(
            store.clone(),
            clock.clone(),
            Arc::new(FixedTokens::new(tokens)),
            Arc::new(LogNotifier),
            LoyaltySettings {
                expiry_batch_size: 2,
                lock_timeout: std::time::Duration::from_millis(50),
                ..LoyaltySettings::default()
            },
        );

        Harness {
            store,
            clock,
            service,
        }
    }

    async fn funded_account(h: &Harness, n: usize, points: Decimal) -> Uuid {
        let registration = h
            .service
            .register(CreateAccountData {
                name: format!("Customer {}", n),
                email: format!("customer{}@example.com", n),
                phone: None,
            })
            .await
            .unwrap();
        let id = registration.account.id;
        h.service.activate(id, &registration.token.token).await.unwrap();
        h.service.earn(id, points, None, None).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_sweep_expires_all_due_accounts_across_batches() {
        let h = harness(&["t1", "t2", "t3", "t4", "t5"]);
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(funded_account(&h, n, dec!(50)).await);
        }

        let nothing = expire_due_points(&h.service).await.unwrap();
        assert_eq!(nothing, ExpirationStats::default());

        h.clock.advance(Duration::days(POINTS_VALIDITY_DAYS + 1));
        let stats = expire_due_points(&h.service).await.unwrap();

        assert_eq!(stats.accounts_expired, 5);
        assert_eq!(stats.points_expired, dec!(250));
        assert_eq!(stats.failures, 0);

        for id in ids {
            let summary = h.service.summary(id).await.unwrap();
            assert_eq!(summary.points_available, Decimal::ZERO);
            assert_eq!(summary.points_expired, dec!(50));
        }

        // A second run finds nothing
        let again = expire_due_points(&h.service).await.unwrap();
        assert_eq!(again.total_checked, 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_accounts_still_within_horizon() {
        let h = harness(&["t1", "t2"]);
        let old = funded_account(&h, 1, dec!(30)).await;

        h.clock.advance(Duration::days(200));
        let recent = funded_account(&h, 2, dec!(40)).await;

        h.clock.advance(Duration::days(200));
        let stats = expire_due_points(&h.service).await.unwrap();

        assert_eq!(stats.accounts_expired, 1);
        assert_eq!(h.service.summary(old).await.unwrap().points_available, Decimal::ZERO);
        assert_eq!(h.service.summary(recent).await.unwrap().points_available, dec!(40));
    }

    #[tokio::test]
    async fn test_failed_accounts_are_retried_next_run() {
        let h = harness(&["t1", "t2", "t3"]);
        for n in 0..3 {
            funded_account(&h, n, dec!(10)).await;
        }
        h.clock.advance(Duration::days(POINTS_VALIDITY_DAYS + 1));

        h.store.set_fail_on_commit(true);
        let failed = expire_due_points(&h.service).await.unwrap();
        assert_eq!(failed.total_checked, 3);
        assert_eq!(failed.failures, 3);
        assert_eq!(failed.accounts_expired, 0);

        h.store.set_fail_on_commit(false);
        let retried = expire_due_points(&h.service).await.unwrap();
        assert_eq!(retried.accounts_expired, 3);
        assert_eq!(retried.points_expired, dec!(30));
    }

    #[tokio::test]
    async fn test_stuck_accounts_do_not_starve_later_ones() {
        let h = harness(&["t1", "t2", "t3"]);
        let mut ids = Vec::new();
        for n in 0..3 {
            ids.push(funded_account(&h, n, dec!(10)).await);
            h.clock.advance(Duration::days(1));
        }
        h.clock.advance(Duration::days(POINTS_VALIDITY_DAYS + 1));

        // The two earliest due accounts fill a whole batch and stay locked
        let first = h.service.locks().acquire(ids[0]).await.unwrap();
        let second = h.service.locks().acquire(ids[1]).await.unwrap();

        let stats = expire_due_points(&h.service).await.unwrap();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.accounts_expired, 1);
        assert_eq!(stats.points_expired, dec!(10));
        assert_eq!(
            h.service.summary(ids[2]).await.unwrap().points_available,
            Decimal::ZERO
        );

        drop(first);
        drop(second);
        let retried = expire_due_points(&h.service).await.unwrap();
        assert_eq!(retried.accounts_expired, 2);
        assert_eq!(retried.failures, 0);
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let h = harness(&[]);
        let result = start_scheduler(Arc::new(h.service), "not a cron").await;
        assert!(result.is_err());
    }
}
