use secrecy::Secret;
use serde::Deserialize;

const DEFAULT_TOKEN_TTL_HOURS: i64 = 24;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_EXPIRY_CRON: &str = "0 0 3 * * *";
const DEFAULT_EXPIRY_BATCH_SIZE: i64 = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    // Absent means the in-memory store is used
    pub database_url: Option<String>,
    pub base_url: String,
    pub host: String,
    pub port: u16,

    // Verification tokens
    pub token_ttl_hours: i64,

    // Per-account lock wait
    pub lock_timeout_ms: u64,

    // Points expiration sweep
    pub expiry_cron: String,
    pub expiry_batch_size: i64,

    // Notification webhook
    pub notify_webhook_url: Option<String>,
    pub notify_webhook_token: Option<Secret<String>>,
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        Ok(Self {
            database_url: config.get("database_url").ok(),
            base_url: config.get("base_url")?,
            host: config.get("host").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: config.get("port")?,

            token_ttl_hours: config
                .get("token_ttl_hours")
                .unwrap_or(DEFAULT_TOKEN_TTL_HOURS),

            lock_timeout_ms: config
                .get("lock_timeout_ms")
                .unwrap_or(DEFAULT_LOCK_TIMEOUT_MS),

            expiry_cron: config
                .get("expiry_cron")
                .unwrap_or_else(|_| DEFAULT_EXPIRY_CRON.to_string()),
            expiry_batch_size: config
                .get("expiry_batch_size")
                .unwrap_or(DEFAULT_EXPIRY_BATCH_SIZE),

            notify_webhook_url: config.get("notify_webhook_url").ok(),
            notify_webhook_token: config
                .get::<String>("notify_webhook_token")
                .ok()
                .map(Secret::new),
        })
    }

    /// Settings for the loyalty service derived from this configuration
    pub fn loyalty_settings(
        &self,
    ) -> Result<crate::services::loyalty::LoyaltySettings, config::ConfigError> {
        let token_ttl = chrono::Duration::try_hours(self.token_ttl_hours)
            .filter(|ttl| *ttl > chrono::Duration::zero())
            .ok_or_else(|| {
                config::ConfigError::Message(format!(
                    "token_ttl_hours must be a positive number of hours (got {})",
                    self.token_ttl_hours
                ))
            })?;

        Ok(crate::services::loyalty::LoyaltySettings {
            token_ttl,
            lock_timeout: std::time::Duration::from_millis(self.lock_timeout_ms),
            expiry_batch_size: self.expiry_batch_size,
            verification_base_url: url::Url::parse(&self.base_url).ok(),
        })
    }
}

#[cfg(test)]
impl Config {
    pub fn for_tests() -> Self {
        Self {
            database_url: None,
            base_url: "http://localhost:3000".to_string(),
            host: "127.0.0.1".to_string(),
            port: 3000,
            token_ttl_hours: DEFAULT_TOKEN_TTL_HOURS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            expiry_cron: DEFAULT_EXPIRY_CRON.to_string(),
            expiry_batch_size: DEFAULT_EXPIRY_BATCH_SIZE,
            notify_webhook_url: None,
            notify_webhook_token: None,
        }
    }
}
