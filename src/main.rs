use std::{net::SocketAddr, sync::Arc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loyalty_ledger::api::{self, AppState};
use loyalty_ledger::clock::SystemClock;
use loyalty_ledger::config::Config;
use loyalty_ledger::db;
use loyalty_ledger::jobs;
use loyalty_ledger::services::{
    notifier::{LogNotifier, LoyaltyNotifier, WebhookNotifier},
    verification::RandomTokenSource,
    LoyaltyService,
};
use loyalty_ledger::store::{LoyaltyStore, MemoryStore, PgStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loyalty_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting loyalty ledger...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    let store: Arc<dyn LoyaltyStore> = match &config.database_url {
        Some(database_url) => {
            let pool = db::create_pool(database_url).await?;
            tracing::info!("Database pool created");

            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations completed");

            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, ledger is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let notifier: Arc<dyn LoyaltyNotifier> = match config
        .notify_webhook_url
        .as_deref()
        .map(url::Url::parse)
        .transpose()?
    {
        Some(url) => {
            tracing::info!(url = %url, "Notifications delivered by webhook");
            Arc::new(WebhookNotifier::new(url, config.notify_webhook_token.clone()))
        }
        None => Arc::new(LogNotifier),
    };

    let service = Arc::new(LoyaltyService::new(
        store,
        Arc::new(SystemClock),
        Arc::new(RandomTokenSource::new()),
        notifier,
        config.loyalty_settings()?,
    ));

    let mut scheduler = jobs::start_scheduler(service.clone(), &config.expiry_cron)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start points expiration job: {:?}", e))?;

    let app = api::router(AppState { service });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler
        .shutdown()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to stop scheduler: {:?}", e))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, cleaning up...");
}
