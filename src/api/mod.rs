//! HTTP surface: REST routes, the event WebSocket and health.

mod error;
mod routes;
mod ws;

pub use error::ApiError;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use tower_http::cors::CorsLayer;

use crate::core::Core;

/// Build the full router.
pub fn router(core: Arc<Core>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/events", get(ws::events_handler))
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .with_state(core)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "delivery-notify",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
