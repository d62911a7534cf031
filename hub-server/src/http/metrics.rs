//! Prometheus metrics endpoint.

use crate::admission::mode_level;
use crate::server::CoordinatorState;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Gauges describe current state; counters are monotonic since startup.
pub async fn metrics_handler(
    Extension(state): Extension<Arc<CoordinatorState>>,
) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(&state),
    )
}

fn render(state: &CoordinatorState) -> String {
    let m = state.metrics();
    let r = state.relay().counters();
    let stats = state.stats();

    let gauges = [
        ("peerhub_peers", "Registered peers", stats.peers as f64),
        (
            "peerhub_channels_connected",
            "Peers with an open duplex channel",
            stats.connected_channels as f64,
        ),
        (
            "peerhub_sessions_active",
            "Active relay sessions",
            stats.active_sessions as f64,
        ),
        (
            "peerhub_relays_pending",
            "Mediated relays awaiting an answer",
            stats.pending_relays as f64,
        ),
        (
            "peerhub_relays_hosted",
            "Hand-offs to relay-capable peers in flight",
            stats.hosted_relays as f64,
        ),
        (
            "peerhub_cost_ratio",
            "Projected spend over budget",
            stats.cost.ratio,
        ),
        (
            "peerhub_admission_mode",
            "Admission mode (0 normal .. 4 shutdown)",
            mode_level(stats.mode),
        ),
    ];

    let counters = [
        ("peerhub_registrations_total", "Registrations accepted", &m.registrations_total),
        ("peerhub_heartbeats_total", "Heartbeats accepted", &m.heartbeats_total),
        ("peerhub_deregistrations_total", "Peers removed by request", &m.deregistrations_total),
        ("peerhub_admissions_total", "Admissions granted", &m.admissions_total),
        ("peerhub_rejections_total", "Admissions and relays rejected", &m.rejections_total),
        ("peerhub_channels_opened_total", "Duplex channels opened", &m.channels_opened_total),
        ("peerhub_rate_limit_hits_total", "Requests refused by a rate limiter", &m.rate_limit_hits),
        ("peerhub_errors_total", "Requests that failed otherwise", &m.errors_total),
        ("peerhub_relays_mediated_total", "Mediated relays delivered", &r.mediated_total),
        ("peerhub_relays_hosted_total", "Relays handed to peers", &r.hosted_total),
        ("peerhub_relay_timeouts_total", "Mediated relays timed out", &r.timeouts_total),
        (
            "peerhub_relay_connection_lost_total",
            "Mediated relays cut short by a disconnect",
            &r.connection_lost_total,
        ),
        ("peerhub_relay_malformed_total", "Payloads rejected as malformed", &r.malformed_total),
        (
            "peerhub_relay_source_failed_total",
            "Deliveries the source reported as failed",
            &r.source_failed_total,
        ),
        ("peerhub_bytes_mediated_total", "Bytes returned by mediated relays", &r.bytes_mediated),
    ];

    let mut body = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(
        body,
        "# HELP peerhub_info Server information\n# TYPE peerhub_info gauge\npeerhub_info{{version=\"{}\"}} 1\n",
        env!("CARGO_PKG_VERSION")
    );
    for (name, help, value) in gauges {
        let _ = writeln!(body, "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n");
    }
    for (name, help, counter) in counters {
        let value = counter.load(Ordering::Relaxed);
        let _ = writeln!(body, "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n");
    }
    let _ = writeln!(
        body,
        "# HELP peerhub_bytes_relayed_total Bytes charged to relay sessions\n# TYPE peerhub_bytes_relayed_total counter\npeerhub_bytes_relayed_total {}",
        stats.bytes_relayed
    );
    for (tier, count) in &stats.sessions_by_tier {
        let _ = writeln!(body, "peerhub_sessions_by_tier{{tier=\"{tier}\"}} {count}");
    }
    body
}
