//! Health check endpoint.

use crate::server::CoordinatorState;
use axum::{Extension, Json};
use hub_core::AdmissionMode;
use serde::Serialize;
use std::sync::Arc;

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// "ok", or "degraded" while the relay is shut down to traffic.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Current admission mode.
    pub mode: AdmissionMode,
    /// Registered peers.
    pub peers: usize,
    /// Peers with an open duplex channel.
    pub connected_channels: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(
    Extension(state): Extension<Arc<CoordinatorState>>,
) -> Json<HealthStatus> {
    let mode = state.admission().mode();
    let status = if mode == AdmissionMode::Shutdown {
        "degraded"
    } else {
        "ok"
    };

    Json(HealthStatus {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        mode,
        peers: state.registry().len(),
        connected_channels: state.channels().len(),
        uptime_seconds: state.started_at().elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_serializes() {
        let status = HealthStatus {
            status: "ok".to_string(),
            version: "0.1.0".to_string(),
            mode: AdmissionMode::Warning,
            peers: 42,
            connected_channels: 15,
            uptime_seconds: 3600,
        };

        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"status\":\"ok\""));
        assert!(json.contains("\"mode\":\"warning\""));
        assert!(json.contains("\"peers\":42"));
    }
}
