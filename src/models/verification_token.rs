use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Signup confirmation token; one row per account, overwritten on reissue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct VerificationToken {
    pub account_id: Uuid,
    #[serde(skip_serializing)]
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl VerificationToken {
    /// Checks if token is expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Checks if token can still be redeemed at `now`
    pub fn is_pending_at(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && !self.is_expired_at(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(issued_at: DateTime<Utc>, ttl: Duration) -> VerificationToken {
        VerificationToken {
            account_id: Uuid::new_v4(),
            token: "abc123".to_string(),
            issued_at,
            expires_at: issued_at + ttl,
            consumed: false,
            consumed_at: None,
        }
    }

    #[test]
    fn test_pending_until_expiry() {
        let now = Utc::now();
        let t = token(now, Duration::hours(24));

        assert!(t.is_pending_at(now));
        assert!(t.is_pending_at(now + Duration::hours(24)));
        assert!(!t.is_pending_at(now + Duration::hours(24) + Duration::seconds(1)));
    }

    #[test]
    fn test_consumed_is_never_pending() {
        let now = Utc::now();
        let mut t = token(now, Duration::hours(24));
        t.consumed = true;

        assert!(!t.is_pending_at(now));
        assert!(!t.is_expired_at(now));
    }

    #[test]
    fn test_token_string_not_serialized() {
        let t = token(Utc::now(), Duration::hours(1));
        let json = serde_json::to_string(&t).unwrap();
        assert!(!json.contains("abc123"));
    }
}
