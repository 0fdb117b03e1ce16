// Notifier module - fire-and-forget customer notifications sent after commit

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, Secret};
use serde::Serialize;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Webhook rejected notification: HTTP {0}")]
    Rejected(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoyaltyEvent {
    VerificationIssued {
        account_id: Uuid,
        name: String,
        email: String,
        token: String,
        verification_link: Option<String>,
        expires_at: DateTime<Utc>,
    },
    AccountActivated {
        account_id: Uuid,
        name: String,
        email: String,
    },
    PointsRedeemed {
        account_id: Uuid,
        name: String,
        email: String,
        points_before: Decimal,
        points_redeemed: Decimal,
        points_after: Decimal,
        order_reference: Option<String>,
    },
}

impl LoyaltyEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LoyaltyEvent::VerificationIssued { .. } => "verification_issued",
            LoyaltyEvent::AccountActivated { .. } => "account_activated",
            LoyaltyEvent::PointsRedeemed { .. } => "points_redeemed",
        }
    }

    pub fn account_id(&self) -> Uuid {
        match self {
            LoyaltyEvent::VerificationIssued { account_id, .. }
            | LoyaltyEvent::AccountActivated { account_id, .. }
            | LoyaltyEvent::PointsRedeemed { account_id, .. } => *account_id,
        }
    }
}

pub trait LoyaltyNotifier: Send + Sync {
    fn notify(&self, event: LoyaltyEvent);
}

/// Writes notifications to the log; used when no webhook is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl LoyaltyNotifier for LogNotifier {
    fn notify(&self, event: LoyaltyEvent) {
        match &event {
            LoyaltyEvent::VerificationIssued {
                account_id,
                email,
                verification_link,
                expires_at,
                ..
            } => tracing::info!(
                account_id = %account_id,
                email = %email,
                link = verification_link.as_deref().unwrap_or("-"),
                expires_at = %expires_at,
                "Verification email"
            ),
            LoyaltyEvent::AccountActivated { account_id, email, .. } => {
                tracing::info!(account_id = %account_id, email = %email, "Welcome email")
            }
            LoyaltyEvent::PointsRedeemed {
                account_id,
                points_redeemed,
                points_after,
                ..
            } => tracing::info!(
                account_id = %account_id,
                points_redeemed = %points_redeemed,
                points_after = %points_after,
                "Redemption receipt"
            ),
        }
    }
}

/// Posts notifications as JSON to an external mailer
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: Url,
    token: Option<Secret<String>>,
}

impl WebhookNotifier {
    pub fn new(url: Url, token: Option<Secret<String>>) -> Self {
        Self {
            client: Client::new(),
            url,
            token,
        }
    }

    #[tracing::instrument(skip(self, event), fields(event = event.name(), account_id = %event.account_id()))]
    pub async fn deliver(&self, event: &LoyaltyEvent) -> Result<(), NotifyError> {
        let mut request = self
            .client
            .post(self.url.clone())
            .json(event)
            .timeout(WEBHOOK_TIMEOUT);

        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(status.as_u16()));
        }

        tracing::debug!("Notification delivered");
        Ok(())
    }
}

impl LoyaltyNotifier for WebhookNotifier {
    fn notify(&self, event: LoyaltyEvent) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(event = event.name(), "No runtime available, dropping notification");
            return;
        };

        let notifier = self.clone();
        runtime.spawn(async move {
            if let Err(e) = notifier.deliver(&event).await {
                tracing::warn!(
                    error = %e,
                    event = event.name(),
                    account_id = %event.account_id(),
                    "Notification delivery failed"
                );
            }
        });
    }
}

/// Keeps every notification in memory
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    events: std::sync::Mutex<Vec<LoyaltyEvent>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn events(&self) -> Vec<LoyaltyEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl LoyaltyNotifier for RecordingNotifier {
    fn notify(&self, event: LoyaltyEvent) {
        self.events.lock().unwrap().push(event);
    }
}
