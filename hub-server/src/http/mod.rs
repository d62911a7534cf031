//! HTTP endpoints for peerhub-server.
//!
//! Registry, admission and relay APIs, the duplex channel upgrade, and
//! health and metrics endpoints.

pub mod api;
pub mod error;
pub mod health;
mod metrics;

use crate::channel::ws;
use crate::server::CoordinatorState;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::{Extension, Router};
use std::sync::Arc;

pub use error::ApiError;
pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(state: Arc<CoordinatorState>) -> Router {
    let body_limit = state.config().server.max_body_bytes;
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/v1/peers", post(api::register).get(api::discover))
        .route("/v1/peers/:id", delete(api::deregister))
        .route("/v1/peers/:id/heartbeat", post(api::heartbeat))
        .route("/v1/peers/:id/private", post(api::resolve_private))
        .route("/v1/relay/admission", post(api::admission))
        .route("/v1/relay/execute", post(api::execute))
        .route(
            "/v1/relay/sessions/:id",
            get(api::get_session).delete(api::complete_session),
        )
        .route("/v1/relay/sessions/:id/bytes", post(api::record_bytes))
        .route("/v1/channel/:peer_id", get(ws::channel_handler))
        .route("/v1/stats", get(api::stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(state))
}
