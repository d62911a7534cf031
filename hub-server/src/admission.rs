//! Cost-driven admission controller.
//!
//! Holds the current [`AdmissionMode`] and [`CostSnapshot`] behind a
//! read-write lock. `decide` only reads; `refresh` polls the cost
//! provider outside the lock, then swaps in the new snapshot and mode and
//! force-terminates sessions the transition no longer allows.
//!
//! A transition's terminations run under the write lock, and
//! [`CostAdmissionController::decide_with`] keeps the read lock until the
//! caller has recorded its session, so no session admitted under the old
//! mode outlives a transition that forbids it.

use hub_core::{
    decide, AdmissionMode, AdmissionPolicy, AdmissionRequest, CostSnapshot, Decision,
    FallbackEstimator, LoadView, ModeTransition, Termination, Thresholds, TierCatalog,
};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Instant;

use crate::config::AdmissionConfig;
use crate::cost::CostProvider;
use crate::session::SessionTracker;
use crate::sink::{emit, MetricsSink};
use crate::unix_now;

#[derive(Debug, Clone, Copy)]
struct ControllerState {
    mode: AdmissionMode,
    snapshot: CostSnapshot,
    snapshot_at: Instant,
    bytes_mark: u64,
}

/// What a refresh did.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    /// Snapshot now in force.
    pub snapshot: CostSnapshot,
    /// Mode change, if any.
    pub transition: Option<ModeTransition>,
    /// Sessions force-terminated by the transition.
    pub terminated: usize,
}

/// Admission controller.
pub struct CostAdmissionController {
    thresholds: Thresholds,
    policy: AdmissionPolicy,
    catalog: TierCatalog,
    budget_limit: f64,
    fallback: FallbackEstimator,
    provider: Arc<dyn CostProvider>,
    sink: Arc<dyn MetricsSink>,
    state: RwLock<ControllerState>,
}

impl std::fmt::Debug for CostAdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CostAdmissionController")
            .field("provider", &self.provider.name())
            .field("mode", &self.mode())
            .field("budget_limit", &self.budget_limit)
            .finish_non_exhaustive()
    }
}

impl CostAdmissionController {
    /// Create a controller in Normal mode with an empty snapshot.
    pub fn new(
        config: &AdmissionConfig,
        catalog: TierCatalog,
        provider: Arc<dyn CostProvider>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let snapshot = CostSnapshot::initial(config.budget_limit, unix_now());
        Self {
            thresholds: config.thresholds,
            policy: config.policy(),
            catalog,
            budget_limit: config.budget_limit,
            fallback: config.fallback(),
            provider,
            sink,
            state: RwLock::new(ControllerState {
                mode: AdmissionMode::Normal,
                snapshot,
                snapshot_at: Instant::now(),
                bytes_mark: 0,
            }),
        }
    }

    /// Current mode.
    pub fn mode(&self) -> AdmissionMode {
        self.read().mode
    }

    /// Current cost snapshot.
    pub fn snapshot(&self) -> CostSnapshot {
        self.read().snapshot
    }

    /// Tier catalogue.
    pub fn catalog(&self) -> &TierCatalog {
        &self.catalog
    }

    /// Mode-specific limits.
    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Decide a request against the current mode and load.
    pub fn decide(&self, request: &AdmissionRequest, load: &dyn LoadView) -> Decision {
        self.decide_with(request, load, |decision| decision)
    }

    /// Decide a request and run `commit` on the decision before any mode
    /// transition can take effect.
    ///
    /// `commit` must not call back into the controller.
    pub fn decide_with<R>(
        &self,
        request: &AdmissionRequest,
        load: &dyn LoadView,
        commit: impl FnOnce(Decision) -> R,
    ) -> R {
        let state = self.read();
        let decision = decide(
            state.mode,
            &self.policy,
            &self.catalog,
            request,
            load,
            &state.snapshot,
        );
        match &decision {
            Decision::Admit(g) => tracing::debug!(
                peer = %request.peer_id,
                tier = %g.tier,
                bandwidth = g.bandwidth,
                mode = %g.mode,
                "relay admitted"
            ),
            Decision::Reject(r) => tracing::debug!(
                peer = %request.peer_id,
                tier = %request.tier,
                reason = %r.reason,
                mode = %r.mode,
                retry_after = r.retry_after_secs,
                "relay rejected"
            ),
        }
        let committed = commit(decision);
        drop(state);
        committed
    }

    /// Poll the provider (or estimate), update the mode, and apply the
    /// transition's terminations.
    pub async fn refresh(&self, sessions: &SessionTracker) -> RefreshOutcome {
        let polled = self.provider.poll().await;
        let bytes_total = sessions.bytes_relayed();
        let now = Instant::now();

        let snapshot = {
            let mut state = self.write();
            let snapshot = match polled {
                Ok(reading) => CostSnapshot::from_reading(reading, self.budget_limit, unix_now()),
                Err(e) => {
                    let estimate = self.fallback.estimate(
                        &state.snapshot,
                        now.saturating_duration_since(state.snapshot_at),
                        bytes_total.saturating_sub(state.bytes_mark),
                        unix_now(),
                    );
                    tracing::warn!(
                        provider = self.provider.name(),
                        error = %e,
                        ratio = estimate.ratio,
                        "cost provider failed, using fallback estimate"
                    );
                    estimate
                }
            };
            state.snapshot = snapshot;
            state.snapshot_at = now;
            state.bytes_mark = bytes_total;
            snapshot
        };

        let (transition, terminated) = self.apply(snapshot.ratio, sessions);
        self.report(&snapshot);
        RefreshOutcome {
            snapshot,
            transition,
            terminated,
        }
    }

    /// Move to the mode a ratio calls for and terminate what it forbids.
    ///
    /// Returns the transition (if any) and the number of sessions ended.
    pub fn apply(
        &self,
        ratio: f64,
        sessions: &SessionTracker,
    ) -> (Option<ModeTransition>, usize) {
        let mut state = self.write();
        let next = state.mode.next(ratio, &self.thresholds);
        let Some(transition) = ModeTransition::between(state.mode, next) else {
            return (None, 0);
        };
        state.mode = next;

        let terminated = match transition.termination() {
            Termination::None => 0,
            Termination::NonTopTier => sessions
                .terminate_where(|s| !self.catalog.is_top(&s.tier))
                .len(),
            Termination::All => sessions.terminate_where(|_| true).len(),
        };
        drop(state);

        if transition.is_escalation() {
            tracing::warn!(
                from = %transition.from,
                to = %transition.to,
                ratio,
                terminated,
                "admission mode escalated"
            );
        } else {
            tracing::info!(
                from = %transition.from,
                to = %transition.to,
                ratio,
                "admission mode relaxed"
            );
        }
        (Some(transition), terminated)
    }

    fn report(&self, snapshot: &CostSnapshot) {
        let mode = self.mode();
        emit(&self.sink, "peerhub_cost_ratio", snapshot.ratio);
        emit(&self.sink, "peerhub_projected_spend", snapshot.projected_spend);
        emit(&self.sink, "peerhub_admission_mode", mode_level(mode));
        emit(
            &self.sink,
            "peerhub_cost_estimated",
            if snapshot.estimated { 1.0 } else { 0.0 },
        );
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, ControllerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, ControllerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Numeric level of a mode for gauges (Normal = 0 ... Shutdown = 4).
pub fn mode_level(mode: AdmissionMode) -> f64 {
    AdmissionMode::ALL
        .iter()
        .position(|m| *m == mode)
        .unwrap_or(0) as f64
}
