//! Coordinator state and lifecycle.
//!
//! [`CoordinatorState`] owns every component and is handed to the HTTP
//! layer as `Arc<CoordinatorState>`. `start` runs the initial cost refresh
//! and spawns the background loops; `shutdown` stops them and settles
//! everything still in flight.

use hub_core::{AdmissionMode, CostSnapshot};
use hub_types::PeerId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::admission::CostAdmissionController;
use crate::channel::ChannelRegistry;
use crate::cleanup;
use crate::config::{Config, ConfigError};
use crate::cost::CostProvider;
use crate::error::HubError;
use crate::limits::RateLimits;
use crate::registry::{Heartbeat, PeerDescriptor, PeerRegistry, Registration};
use crate::relay::RelayCoordinator;
use crate::session::SessionTracker;
use crate::sink::MetricsSink;

/// Operational metrics for monitoring coordinator activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct HubMetrics {
    /// Successful registrations (including re-registrations).
    pub registrations_total: AtomicU64,
    /// Accepted heartbeats.
    pub heartbeats_total: AtomicU64,
    /// Peers removed by request.
    pub deregistrations_total: AtomicU64,
    /// Admissions granted through the admission endpoint.
    pub admissions_total: AtomicU64,
    /// Admissions and relays rejected by the controller.
    pub rejections_total: AtomicU64,
    /// Duplex channels opened.
    pub channels_opened_total: AtomicU64,
    /// Requests refused by a rate limiter.
    pub rate_limit_hits: AtomicU64,
    /// Requests that ended in any other error.
    pub errors_total: AtomicU64,
}

/// Point-in-time coordinator statistics.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    /// Current admission mode.
    pub mode: AdmissionMode,
    /// Current cost snapshot.
    pub cost: CostSnapshot,
    /// Active sessions keyed by tier.
    pub sessions_by_tier: BTreeMap<String, usize>,
    /// Active sessions in total.
    pub active_sessions: usize,
    /// Registered peers (including expired, not yet purged).
    pub peers: usize,
    /// Peers with an open duplex channel.
    pub connected_channels: usize,
    /// Mediated relays awaiting an answer.
    pub pending_relays: usize,
    /// Hand-offs to relay-capable peers not yet released.
    pub hosted_relays: usize,
    /// Bytes relayed since startup.
    pub bytes_relayed: u64,
    /// Seconds since the state was created.
    pub uptime_seconds: u64,
}

/// Everything the coordinator runs on.
pub struct CoordinatorState {
    config: Config,
    registry: Arc<PeerRegistry>,
    sessions: Arc<SessionTracker>,
    admission: Arc<CostAdmissionController>,
    channels: Arc<ChannelRegistry>,
    relay: Arc<RelayCoordinator>,
    rate_limits: Arc<RateLimits>,
    sink: Arc<dyn MetricsSink>,
    metrics: HubMetrics,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl std::fmt::Debug for CoordinatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorState")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("peers", &self.registry.len())
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl CoordinatorState {
    /// Build every component from a validated configuration.
    pub fn new(
        config: Config,
        provider: Arc<dyn CostProvider>,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let catalog = config.tier_catalog()?;

        let registry = Arc::new(PeerRegistry::new(&config));
        let sessions = Arc::new(SessionTracker::new());
        let admission = Arc::new(CostAdmissionController::new(
            &config.admission,
            catalog,
            provider,
            sink.clone(),
        ));
        let channels = Arc::new(ChannelRegistry::new());
        let relay = Arc::new(RelayCoordinator::new(
            &config.relay,
            registry.clone(),
            sessions.clone(),
            admission.clone(),
            channels.clone(),
        ));
        let rate_limits = Arc::new(RateLimits::new(&config.limits));

        Ok(Self {
            config,
            registry,
            sessions,
            admission,
            channels,
            relay,
            rate_limits,
            sink,
            metrics: HubMetrics::default(),
            tasks: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        })
    }

    /// Refresh the cost signal once, then spawn the background loops.
    pub async fn start(self: &Arc<Self>) {
        let outcome = self.admission.refresh(&self.sessions).await;
        tracing::info!(
            mode = %self.admission.mode(),
            ratio = outcome.snapshot.ratio,
            estimated = outcome.snapshot.estimated,
            "coordinator started"
        );

        let handles = vec![
            cleanup::spawn_cost_refresh(
                self.admission.clone(),
                self.sessions.clone(),
                Duration::from_secs(self.config.admission.refresh_interval_secs),
            ),
            cleanup::spawn_registry_sweep(
                self.registry.clone(),
                self.rate_limits.clone(),
                self.sink.clone(),
                Duration::from_secs(self.config.registry.sweep_interval_secs),
            ),
            cleanup::spawn_session_sweep(
                self.sessions.clone(),
                self.sink.clone(),
                Duration::from_secs(self.config.sessions.sweep_interval_secs),
            ),
        ];
        self.lock_tasks().extend(handles);
    }

    /// Stop the background loops, fail every pending relay and drop all
    /// channels. Safe to call more than once.
    pub fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        let abandoned = self.relay.shutdown();
        self.channels.clear();
        tracing::info!(
            stopped_tasks = tasks.len(),
            abandoned,
            "coordinator shut down"
        );
    }

    /// Register or re-register a peer.
    pub fn register(&self, descriptor: PeerDescriptor) -> Result<Registration, HubError> {
        self.check_rate(&descriptor.peer_id)?;
        let registration = self.registry.register(descriptor)?;
        self.metrics
            .registrations_total
            .fetch_add(1, Ordering::Relaxed);
        Ok(registration)
    }

    /// Refresh a peer's liveness.
    pub fn heartbeat(&self, peer_id: &PeerId) -> Result<Heartbeat, HubError> {
        self.check_rate(peer_id)?;
        let heartbeat = self.registry.heartbeat(peer_id)?;
        self.metrics.heartbeats_total.fetch_add(1, Ordering::Relaxed);
        Ok(heartbeat)
    }

    /// Remove a peer, ending its sessions and any relays it was part of.
    pub fn deregister(&self, peer_id: &PeerId) -> bool {
        let removed = self.registry.deregister(peer_id);
        let failed = self.relay.peer_gone(peer_id);
        let ended = self
            .sessions
            .terminate_where(|s| &s.peer_id == peer_id)
            .len();
        if removed {
            self.metrics
                .deregistrations_total
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(peer = %peer_id, failed, ended, "peer removed");
        }
        removed
    }

    /// Apply the global and per-peer rate limits.
    pub fn check_rate(&self, peer_id: &PeerId) -> Result<(), HubError> {
        self.rate_limits.check(peer_id).map_err(|e| {
            self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(peer = %peer_id, error = %e, "rate limited");
            HubError::from(e)
        })
    }

    /// Current statistics.
    pub fn stats(&self) -> Stats {
        Stats {
            mode: self.admission.mode(),
            cost: self.admission.snapshot(),
            sessions_by_tier: self.sessions.counts_by_tier(),
            active_sessions: self.sessions.len(),
            peers: self.registry.len(),
            connected_channels: self.channels.len(),
            pending_relays: self.relay.pending_count(),
            hosted_relays: self.relay.hosted().assignment_count(),
            bytes_relayed: self.sessions.bytes_relayed(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Configuration in force.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Peer registry.
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Session tracker.
    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    /// Admission controller.
    pub fn admission(&self) -> &Arc<CostAdmissionController> {
        &self.admission
    }

    /// Open duplex channels.
    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// Relay coordinator.
    pub fn relay(&self) -> &Arc<RelayCoordinator> {
        &self.relay
    }

    /// Rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Operational counters.
    pub fn metrics(&self) -> &HubMetrics {
        &self.metrics
    }

    /// When the state was created.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CoordinatorState {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}
