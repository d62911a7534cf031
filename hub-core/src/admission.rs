//! The admission rule table.
//!
//! [`decide`] is a pure function of the current mode, the policy, the tier
//! catalogue, the request, and a view of current session load. For fixed
//! request and load, moving to a stricter mode never produces a more
//! permissive outcome: every rule of a mode also applies to all stricter
//! modes, and bandwidth and duration caps only shrink.
//!
//! A *continuation* is a request naming a session that is still active,
//! owned by the same peer, and in the same tier. Continuations were already
//! counted against concurrency caps and have already been through the
//! direct-connection check, so only mode eligibility and caps apply to them.

use hub_types::{PeerId, SessionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::{AdmissionMode, CostSnapshot, PolicyError, Tier, TierCatalog};

/// What a caller asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest {
    /// Requesting peer.
    pub peer_id: PeerId,
    /// Declared tier name.
    pub tier: String,
    /// Requested bandwidth in KiB/s (0 means "tier default").
    pub requested_bandwidth: u64,
    /// Whether the peer holds a premium entitlement.
    pub is_premium: bool,
    /// Whether the peer already tried a direct connection.
    pub p2p_attempted: bool,
    /// Session this request continues, if any.
    pub continuation: Option<SessionId>,
    /// A bare liveness probe; admitted in every mode, creates no session.
    pub health_check: bool,
}

/// What the rule table needs to know about an active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSessionInfo {
    /// Owning peer.
    pub peer_id: PeerId,
    /// Tier the session was admitted under.
    pub tier: String,
}

/// Read-only view of current relay load.
pub trait LoadView {
    /// Number of active sessions in a tier.
    fn active_in_tier(&self, tier: &str) -> usize;

    /// Look up an active session.
    fn active_session(&self, id: &SessionId) -> Option<ActiveSessionInfo>;
}

/// Retry-after hints per mode, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAfter {
    /// Hint when rejected in Normal mode (capacity).
    #[serde(default = "default_retry_normal")]
    pub normal: u64,
    /// Hint when rejected in Warning mode.
    #[serde(default = "default_retry_warning")]
    pub warning: u64,
    /// Hint when rejected in Throttle mode.
    #[serde(default = "default_retry_throttle")]
    pub throttle: u64,
    /// Hint when rejected in Emergency mode.
    #[serde(default = "default_retry_emergency")]
    pub emergency: u64,
    /// Hint when rejected in Shutdown mode.
    #[serde(default = "default_retry_shutdown")]
    pub shutdown: u64,
}

fn default_retry_normal() -> u64 {
    30
}

fn default_retry_warning() -> u64 {
    60
}

fn default_retry_throttle() -> u64 {
    120
}

fn default_retry_emergency() -> u64 {
    300
}

fn default_retry_shutdown() -> u64 {
    900
}

impl Default for RetryAfter {
    fn default() -> Self {
        Self {
            normal: default_retry_normal(),
            warning: default_retry_warning(),
            throttle: default_retry_throttle(),
            emergency: default_retry_emergency(),
            shutdown: default_retry_shutdown(),
        }
    }
}

impl RetryAfter {
    /// Hint for a mode.
    pub fn for_mode(&self, mode: AdmissionMode) -> u64 {
        match mode {
            AdmissionMode::Normal => self.normal,
            AdmissionMode::Warning => self.warning,
            AdmissionMode::Throttle => self.throttle,
            AdmissionMode::Emergency => self.emergency,
            AdmissionMode::Shutdown => self.shutdown,
        }
    }
}

/// Mode-specific limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdmissionPolicy {
    /// Fraction of a tier's bandwidth granted in Warning mode.
    pub warning_bandwidth_factor: f64,
    /// Hard bandwidth ceiling in Throttle mode, KiB/s.
    pub throttle_bandwidth_ceiling: u64,
    /// Global cap on concurrent top-tier sessions in Throttle mode.
    pub throttle_max_top_sessions: usize,
    /// Bandwidth ceiling for Emergency continuations, KiB/s.
    pub emergency_bandwidth_ceiling: u64,
    /// Duration cap for Emergency continuations, seconds.
    pub emergency_max_duration_secs: u64,
    /// Retry-after hints.
    pub retry_after: RetryAfter,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            warning_bandwidth_factor: 0.5,
            throttle_bandwidth_ceiling: 512,
            throttle_max_top_sessions: 100,
            emergency_bandwidth_ceiling: 5,
            emergency_max_duration_secs: 300,
            retry_after: RetryAfter::default(),
        }
    }
}

impl AdmissionPolicy {
    /// Check value ranges and that ceilings shrink as modes escalate.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if !(self.warning_bandwidth_factor > 0.0 && self.warning_bandwidth_factor <= 1.0) {
            return Err(PolicyError::InvalidValue {
                field: "warning_bandwidth_factor",
                reason: "must be in (0, 1]".into(),
            });
        }
        if self.emergency_bandwidth_ceiling == 0
            || self.emergency_bandwidth_ceiling > self.throttle_bandwidth_ceiling
        {
            return Err(PolicyError::InvalidValue {
                field: "emergency_bandwidth_ceiling",
                reason: "must be non-zero and not above the throttle ceiling".into(),
            });
        }
        Ok(())
    }

    /// Bandwidth cap for a tier in a mode.
    ///
    /// Each stricter mode takes the minimum with the previous one.
    pub fn bandwidth_cap(&self, tier: &Tier, mode: AdmissionMode) -> u64 {
        let normal = tier.max_bandwidth;
        let warning = ((normal as f64 * self.warning_bandwidth_factor).floor() as u64).max(1);
        let throttle = warning.min(self.throttle_bandwidth_ceiling);
        let emergency = throttle.min(self.emergency_bandwidth_ceiling);
        match mode {
            AdmissionMode::Normal => normal,
            AdmissionMode::Warning => warning,
            AdmissionMode::Throttle => throttle,
            AdmissionMode::Emergency | AdmissionMode::Shutdown => emergency,
        }
    }

    /// Duration cap for a tier in a mode.
    pub fn duration_cap(&self, tier: &Tier, mode: AdmissionMode) -> Duration {
        let tier_cap = tier.max_duration();
        if mode >= AdmissionMode::Emergency {
            tier_cap.min(Duration::from_secs(self.emergency_max_duration_secs))
        } else {
            tier_cap
        }
    }
}

/// Scheduling priority attached to an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Liveness probe only.
    Probe,
    /// Admitted under reduced limits.
    Reduced,
    /// Ordinary admission.
    Normal,
    /// Top-tier admission.
    Elevated,
    /// Top-tier continuation kept alive through an emergency.
    Essential,
}

/// An admission grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    /// Tier the grant was made under.
    pub tier: String,
    /// Bandwidth cap, KiB/s.
    pub bandwidth: u64,
    /// Session duration cap, seconds.
    pub max_duration_secs: u64,
    /// Priority label.
    pub priority: Priority,
    /// Mode at decision time.
    pub mode: AdmissionMode,
    /// Session being continued, if any.
    pub continuation: Option<SessionId>,
    /// True for health-check grants (no session).
    pub health_check: bool,
    /// Cost signal at decision time.
    pub cost: CostSnapshot,
}

impl Grant {
    /// Duration cap.
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectReason {
    /// Tier name not in the catalogue.
    UnknownTier {
        /// Name given.
        tier: String,
    },
    /// Top tier requested without a premium entitlement.
    PremiumRequired,
    /// Tier is at its concurrency cap.
    TierAtCapacity {
        /// Tier name.
        tier: String,
        /// Cap in force.
        limit: usize,
    },
    /// Attempt a direct connection first.
    TryDirectFirst,
    /// Only the top tier is served in this mode.
    TopTierOnly,
    /// Only continuations of active top-tier sessions are served.
    ContinuationOnly,
    /// Relay is shut down to all traffic.
    Shutdown,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTier { tier } => write!(f, "unknown tier {tier}"),
            Self::PremiumRequired => write!(f, "top tier requires a premium entitlement"),
            Self::TierAtCapacity { tier, limit } => {
                write!(f, "tier {tier} at capacity ({limit} sessions)")
            }
            Self::TryDirectFirst => write!(f, "attempt a direct connection before relaying"),
            Self::TopTierOnly => write!(f, "only the top tier is being served"),
            Self::ContinuationOnly => {
                write!(f, "only active top-tier sessions are being continued")
            }
            Self::Shutdown => write!(f, "relay shut down"),
        }
    }
}

/// A rejection with back-off guidance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Why.
    pub reason: RejectReason,
    /// Mode that triggered the rejection.
    pub mode: AdmissionMode,
    /// Seconds to wait before retrying.
    pub retry_after_secs: u64,
    /// Cost signal at decision time.
    pub cost: CostSnapshot,
}

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Admitted under the grant's limits.
    Admit(Grant),
    /// Rejected.
    Reject(Rejection),
}

impl Decision {
    /// Whether this is an admission.
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit(_))
    }
}

/// Decide whether to admit a relay request.
pub fn decide(
    mode: AdmissionMode,
    policy: &AdmissionPolicy,
    catalog: &TierCatalog,
    request: &AdmissionRequest,
    load: &dyn LoadView,
    cost: &CostSnapshot,
) -> Decision {
    let reject = |reason: RejectReason| {
        Decision::Reject(Rejection {
            reason,
            mode,
            retry_after_secs: policy.retry_after.for_mode(mode),
            cost: *cost,
        })
    };

    if request.health_check {
        return Decision::Admit(Grant {
            tier: request.tier.clone(),
            bandwidth: 0,
            max_duration_secs: 0,
            priority: Priority::Probe,
            mode,
            continuation: None,
            health_check: true,
            cost: *cost,
        });
    }

    let Some(tier) = catalog.get(&request.tier) else {
        return reject(RejectReason::UnknownTier {
            tier: request.tier.clone(),
        });
    };
    let is_top = catalog.is_top(&tier.name);
    if is_top && !request.is_premium {
        return reject(RejectReason::PremiumRequired);
    }

    let continuation = request.continuation.filter(|id| {
        load.active_session(id)
            .is_some_and(|s| s.peer_id == request.peer_id && s.tier == tier.name)
    });
    let is_new = continuation.is_none();

    // Mode eligibility.
    match mode {
        AdmissionMode::Shutdown => return reject(RejectReason::Shutdown),
        AdmissionMode::Emergency if !is_top => return reject(RejectReason::TopTierOnly),
        AdmissionMode::Emergency if is_new => return reject(RejectReason::ContinuationOnly),
        AdmissionMode::Throttle if !is_top => return reject(RejectReason::TopTierOnly),
        _ => {}
    }

    if is_new && mode >= AdmissionMode::Warning && !request.p2p_attempted {
        return reject(RejectReason::TryDirectFirst);
    }

    if is_new {
        let mut limit = tier.max_concurrent_sessions;
        if mode >= AdmissionMode::Throttle {
            limit = limit.min(policy.throttle_max_top_sessions);
        }
        if load.active_in_tier(&tier.name) >= limit {
            return reject(RejectReason::TierAtCapacity {
                tier: tier.name.clone(),
                limit,
            });
        }
    }

    let cap = policy.bandwidth_cap(tier, mode);
    let bandwidth = if request.requested_bandwidth == 0 {
        cap
    } else {
        request.requested_bandwidth.min(cap)
    };

    let priority = match (mode, is_top) {
        (AdmissionMode::Emergency, true) => Priority::Essential,
        (_, true) => Priority::Elevated,
        (AdmissionMode::Normal, false) => Priority::Normal,
        (_, false) => Priority::Reduced,
    };

    Decision::Admit(Grant {
        tier: tier.name.clone(),
        bandwidth,
        max_duration_secs: policy.duration_cap(tier, mode).as_secs(),
        priority,
        mode,
        continuation,
        health_check: false,
        cost: *cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct FakeLoad {
        per_tier: HashMap<String, usize>,
        sessions: HashMap<SessionId, ActiveSessionInfo>,
    }

    impl LoadView for FakeLoad {
        fn active_in_tier(&self, tier: &str) -> usize {
            self.per_tier.get(tier).copied().unwrap_or(0)
        }

        fn active_session(&self, id: &SessionId) -> Option<ActiveSessionInfo> {
            self.sessions.get(id).cloned()
        }
    }

    fn peer() -> PeerId {
        PeerId::new("peer-a").unwrap()
    }

    fn request(tier: &str) -> AdmissionRequest {
        AdmissionRequest {
            peer_id: peer(),
            tier: tier.into(),
            requested_bandwidth: 0,
            is_premium: tier == "premium",
            p2p_attempted: true,
            continuation: None,
            health_check: false,
        }
    }

    fn cost() -> CostSnapshot {
        CostSnapshot::initial(100.0, 0)
    }

    fn run(mode: AdmissionMode, req: &AdmissionRequest, load: &FakeLoad) -> Decision {
        decide(
            mode,
            &AdmissionPolicy::default(),
            &TierCatalog::standard(),
            req,
            load,
            &cost(),
        )
    }

    fn premium_session(load: &mut FakeLoad) -> SessionId {
        let id = SessionId::new();
        load.sessions.insert(
            id,
            ActiveSessionInfo {
                peer_id: peer(),
                tier: "premium".into(),
            },
        );
        *load.per_tier.entry("premium".into()).or_default() += 1;
        id
    }

    fn rejection(d: Decision) -> Rejection {
        match d {
            Decision::Reject(r) => r,
            Decision::Admit(g) => panic!("expected rejection, got {g:?}"),
        }
    }

    fn grant(d: Decision) -> Grant {
        match d {
            Decision::Admit(g) => g,
            Decision::Reject(r) => panic!("expected admission, got {r:?}"),
        }
    }

    #[test]
    fn normal_admits_at_tier_default() {
        let g = grant(run(AdmissionMode::Normal, &request("free"), &FakeLoad::default()));
        assert_eq!(g.bandwidth, 64);
        assert_eq!(g.max_duration_secs, 600);
        assert_eq!(g.priority, Priority::Normal);
    }

    #[test]
    fn requested_bandwidth_is_capped_by_tier() {
        let mut req = request("basic");
        req.requested_bandwidth = 10_000;
        let g = grant(run(AdmissionMode::Normal, &req, &FakeLoad::default()));
        assert_eq!(g.bandwidth, 256);

        req.requested_bandwidth = 10;
        let g = grant(run(AdmissionMode::Normal, &req, &FakeLoad::default()));
        assert_eq!(g.bandwidth, 10);
    }

    #[test]
    fn normal_enforces_tier_concurrency() {
        let mut load = FakeLoad::default();
        load.per_tier.insert("free".into(), 50);
        let r = rejection(run(AdmissionMode::Normal, &request("free"), &load));
        assert_eq!(
            r.reason,
            RejectReason::TierAtCapacity {
                tier: "free".into(),
                limit: 50
            }
        );
        assert_eq!(r.retry_after_secs, 30);
    }

    #[test]
    fn warning_requires_direct_attempt() {
        let mut req = request("standard");
        req.p2p_attempted = false;
        let r = rejection(run(AdmissionMode::Warning, &req, &FakeLoad::default()));
        assert_eq!(r.reason, RejectReason::TryDirectFirst);
        assert_eq!(r.mode, AdmissionMode::Warning);

        req.p2p_attempted = true;
        let g = grant(run(AdmissionMode::Warning, &req, &FakeLoad::default()));
        assert_eq!(g.bandwidth, 512);
        assert_eq!(g.priority, Priority::Reduced);
    }

    #[test]
    fn throttle_serves_only_top_tier() {
        let r = rejection(run(AdmissionMode::Throttle, &request("standard"), &FakeLoad::default()));
        assert_eq!(r.reason, RejectReason::TopTierOnly);

        let g = grant(run(AdmissionMode::Throttle, &request("premium"), &FakeLoad::default()));
        assert_eq!(g.bandwidth, 512);
        assert_eq!(g.priority, Priority::Elevated);
    }

    #[test]
    fn throttle_caps_top_tier_sessions_globally() {
        let mut load = FakeLoad::default();
        load.per_tier.insert("premium".into(), 100);
        let r = rejection(run(AdmissionMode::Throttle, &request("premium"), &load));
        assert!(matches!(r.reason, RejectReason::TierAtCapacity { limit: 100, .. }));
    }

    #[test]
    fn emergency_rejects_free_tier_with_long_backoff() {
        let r = rejection(run(AdmissionMode::Emergency, &request("free"), &FakeLoad::default()));
        assert_eq!(r.mode, AdmissionMode::Emergency);
        assert_eq!(r.retry_after_secs, 300);
    }

    #[test]
    fn emergency_admits_only_continuations() {
        let mut load = FakeLoad::default();
        let r = rejection(run(AdmissionMode::Emergency, &request("premium"), &load));
        assert_eq!(r.reason, RejectReason::ContinuationOnly);

        let id = premium_session(&mut load);
        let mut req = request("premium");
        req.continuation = Some(id);
        req.p2p_attempted = false;
        let g = grant(run(AdmissionMode::Emergency, &req, &load));
        assert_eq!(g.bandwidth, 5);
        assert_eq!(g.continuation, Some(id));
        assert_eq!(g.priority, Priority::Essential);
        assert_eq!(g.max_duration_secs, 300);
    }

    #[test]
    fn foreign_session_is_not_a_continuation() {
        let mut load = FakeLoad::default();
        let id = SessionId::new();
        load.sessions.insert(
            id,
            ActiveSessionInfo {
                peer_id: PeerId::new("someone-else").unwrap(),
                tier: "premium".into(),
            },
        );
        let mut req = request("premium");
        req.continuation = Some(id);
        let r = rejection(run(AdmissionMode::Emergency, &req, &load));
        assert_eq!(r.reason, RejectReason::ContinuationOnly);
    }

    #[test]
    fn shutdown_rejects_everything_but_health_checks() {
        let mut load = FakeLoad::default();
        let id = premium_session(&mut load);
        let mut req = request("premium");
        req.continuation = Some(id);
        let r = rejection(run(AdmissionMode::Shutdown, &req, &load));
        assert_eq!(r.reason, RejectReason::Shutdown);

        req.health_check = true;
        let g = grant(run(AdmissionMode::Shutdown, &req, &load));
        assert!(g.health_check);
        assert_eq!(g.bandwidth, 0);
    }

    #[test]
    fn top_tier_needs_premium_flag() {
        let mut req = request("premium");
        req.is_premium = false;
        let r = rejection(run(AdmissionMode::Normal, &req, &FakeLoad::default()));
        assert_eq!(r.reason, RejectReason::PremiumRequired);
    }

    #[test]
    fn unknown_tier_rejected() {
        let r = rejection(run(AdmissionMode::Normal, &request("gold"), &FakeLoad::default()));
        assert_eq!(r.reason, RejectReason::UnknownTier { tier: "gold".into() });
    }

    /// Every combination of request flags, checked across all mode pairs.
    #[test]
    fn decisions_are_monotonic_in_mode() {
        let mut load = FakeLoad::default();
        let premium_id = premium_session(&mut load);
        let free_id = SessionId::new();
        load.sessions.insert(
            free_id,
            ActiveSessionInfo {
                peer_id: peer(),
                tier: "free".into(),
            },
        );

        let mut requests = Vec::new();
        for tier in ["free", "standard", "premium"] {
            for p2p in [false, true] {
                for premium in [false, true] {
                    for cont in [None, Some(premium_id), Some(free_id)] {
                        for bw in [0, 3, 100_000] {
                            requests.push(AdmissionRequest {
                                peer_id: peer(),
                                tier: tier.into(),
                                requested_bandwidth: bw,
                                is_premium: premium,
                                p2p_attempted: p2p,
                                continuation: cont,
                                health_check: false,
                            });
                        }
                    }
                }
            }
        }

        for req in &requests {
            let outcomes: Vec<Decision> = AdmissionMode::ALL
                .iter()
                .map(|m| run(*m, req, &load))
                .collect();
            for pair in outcomes.windows(2) {
                match (&pair[0], &pair[1]) {
                    (Decision::Reject(_), Decision::Admit(g)) => {
                        panic!("stricter mode {} admitted {req:?}", g.mode)
                    }
                    (Decision::Admit(a), Decision::Admit(b)) => {
                        assert!(b.bandwidth <= a.bandwidth, "{req:?}");
                        assert!(b.max_duration_secs <= a.max_duration_secs, "{req:?}");
                    }
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn policy_validation() {
        assert!(AdmissionPolicy::default().validate().is_ok());
        let bad = AdmissionPolicy {
            emergency_bandwidth_ceiling: 1000,
            ..AdmissionPolicy::default()
        };
        assert!(bad.validate().is_err());
        let bad = AdmissionPolicy {
            warning_bandwidth_factor: 0.0,
            ..AdmissionPolicy::default()
        };
        assert!(bad.validate().is_err());
    }
}
