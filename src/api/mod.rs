// API module - HTTP endpoints

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::services::LoyaltyService;

pub mod accounts;
pub mod health;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<LoyaltyService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .merge(accounts::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
