//! Background loops.
//!
//! Three independent tasks: cost-signal refresh, registry sweep, session
//! sweep. None of them holds a lock across an await, so request handling
//! never waits on them.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use crate::admission::CostAdmissionController;
use crate::limits::RateLimits;
use crate::registry::PeerRegistry;
use crate::session::SessionTracker;
use crate::sink::{emit, MetricsSink};

/// Spawn the periodic cost refresh.
///
/// The first tick is one full period out; the caller performs the initial
/// refresh itself.
pub fn spawn_cost_refresh(
    admission: Arc<CostAdmissionController>,
    sessions: Arc<SessionTracker>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Cost refresh task started (interval: {}s)", period.as_secs());
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            let outcome = admission.refresh(&sessions).await;
            tracing::debug!(
                ratio = outcome.snapshot.ratio,
                estimated = outcome.snapshot.estimated,
                mode = %admission.mode(),
                "Cost refresh complete"
            );
        }
    })
}

/// Spawn the registry sweep: purge expired peers and idle rate-limit keys.
pub fn spawn_registry_sweep(
    registry: Arc<PeerRegistry>,
    rate_limits: Arc<RateLimits>,
    sink: Arc<dyn MetricsSink>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Registry sweep task started (interval: {}s)", period.as_secs());
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            let purged = registry.purge_expired();
            rate_limits.shrink();
            if purged == 0 {
                tracing::debug!("Registry sweep: no expired peers");
            }
            emit(&sink, "peerhub_peers", registry.len() as f64);
            emit(&sink, "peerhub_rate_limit_keys", rate_limits.peer_keys_count() as f64);
        }
    })
}

/// Spawn the session sweep: drop expired and inactive sessions.
pub fn spawn_session_sweep(
    sessions: Arc<SessionTracker>,
    sink: Arc<dyn MetricsSink>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Session sweep task started (interval: {}s)", period.as_secs());
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            sessions.sweep();
            emit(&sink, "peerhub_sessions_active", sessions.len() as f64);
            for (tier, count) in sessions.counts_by_tier() {
                emit(&sink, &format!("peerhub_sessions_active_{tier}"), count as f64);
            }
        }
    })
}
