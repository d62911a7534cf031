//! Load accounting for peer-hosted relays.
//!
//! Each hand-off to a relay-capable peer adds its weight to that peer's
//! load. The weight comes off again exactly once: when the peer reports
//! `HostRelayDone`, when its grace timer fires, or when the peer goes
//! away. Removal from the assignment map decides who releases.

use dashmap::DashMap;
use hub_types::{AssignmentId, PeerId, SessionId};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Why an assignment's load was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// The relay peer reported completion.
    Completed,
    /// No completion arrived within the grace period.
    GraceExpired,
    /// The relay peer disconnected or deregistered.
    PeerGone,
    /// The hand-off message never reached the peer.
    Undelivered,
    /// Coordinator shut down.
    Shutdown,
}

/// A released assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Released {
    /// Assignment id.
    pub assignment_id: AssignmentId,
    /// Peer that hosted it.
    pub relay_peer: PeerId,
    /// Session admitted for the relay, if the coordinator owns it.
    pub session_id: Option<SessionId>,
    /// Load units returned.
    pub weight: f64,
    /// Why.
    pub reason: ReleaseReason,
}

struct Assignment {
    relay_peer: PeerId,
    session_id: Option<SessionId>,
    weight: f64,
    timer: Option<JoinHandle<()>>,
}

type ReleaseHook = Box<dyn Fn(Released) + Send + Sync>;

/// Per-peer hosted-relay load.
pub struct HostedLoad {
    loads: DashMap<PeerId, f64>,
    assignments: DashMap<AssignmentId, Assignment>,
    on_release: Option<ReleaseHook>,
}

impl std::fmt::Debug for HostedLoad {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostedLoad")
            .field("peers", &self.loads.len())
            .field("assignments", &self.assignments.len())
            .finish()
    }
}

impl HostedLoad {
    /// Create an empty tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            loads: DashMap::new(),
            assignments: DashMap::new(),
            on_release: None,
        })
    }

    /// Create a tracker that calls `hook` for every release.
    pub fn with_release_hook(hook: impl Fn(Released) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            loads: DashMap::new(),
            assignments: DashMap::new(),
            on_release: Some(Box::new(hook)),
        })
    }

    /// Current load units of a peer.
    pub fn load_of(&self, peer_id: &PeerId) -> f64 {
        self.loads.get(peer_id).map(|l| *l).unwrap_or(0.0)
    }

    /// Record a hand-off and arm its grace timer.
    ///
    /// Must be called within a tokio runtime.
    pub fn assign(
        self: &Arc<Self>,
        relay_peer: PeerId,
        weight: f64,
        session_id: Option<SessionId>,
        grace: Duration,
    ) -> AssignmentId {
        let assignment_id = AssignmentId::new();
        *self.loads.entry(relay_peer.clone()).or_insert(0.0) += weight;
        self.assignments.insert(
            assignment_id,
            Assignment {
                relay_peer,
                session_id,
                weight,
                timer: None,
            },
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(hosted) = weak.upgrade() {
                if hosted
                    .release(&assignment_id, ReleaseReason::GraceExpired)
                    .is_some()
                {
                    tracing::warn!(assignment = %assignment_id, "hosted relay never reported done, load released");
                }
            }
        });
        match self.assignments.get_mut(&assignment_id) {
            Some(mut a) => a.timer = Some(timer),
            None => timer.abort(),
        }
        assignment_id
    }

    /// Release an assignment's load. `None` if it was already released.
    pub fn release(&self, assignment_id: &AssignmentId, reason: ReleaseReason) -> Option<Released> {
        let (_, assignment) = self.assignments.remove(assignment_id)?;
        if let Some(timer) = assignment.timer {
            timer.abort();
        }

        let relay_peer = assignment.relay_peer;
        self.loads.remove_if_mut(&relay_peer, |_, load| {
            *load = (*load - assignment.weight).max(0.0);
            *load <= f64::EPSILON
        });

        let released = Released {
            assignment_id: *assignment_id,
            relay_peer,
            session_id: assignment.session_id,
            weight: assignment.weight,
            reason,
        };
        tracing::debug!(assignment = %assignment_id, peer = %released.relay_peer, ?reason, "hosted relay released");
        if let Some(hook) = &self.on_release {
            hook(released.clone());
        }
        Some(released)
    }

    /// Release a completion reported by `reporter`, which must be the
    /// assigned peer.
    pub fn complete(&self, assignment_id: &AssignmentId, reporter: &PeerId) -> Option<Released> {
        let assigned_here = self
            .assignments
            .get(assignment_id)
            .is_some_and(|a| &a.relay_peer == reporter);
        if !assigned_here {
            return None;
        }
        self.release(assignment_id, ReleaseReason::Completed)
    }

    /// Release everything a peer hosts.
    pub fn release_peer(&self, relay_peer: &PeerId, reason: ReleaseReason) -> Vec<Released> {
        let ids: Vec<AssignmentId> = self
            .assignments
            .iter()
            .filter(|a| &a.relay_peer == relay_peer)
            .map(|a| *a.key())
            .collect();
        ids.iter().filter_map(|id| self.release(id, reason)).collect()
    }

    /// Release every assignment.
    pub fn release_all(&self, reason: ReleaseReason) -> usize {
        let ids: Vec<AssignmentId> = self.assignments.iter().map(|a| *a.key()).collect();
        ids.iter()
            .filter(|id| self.release(id, reason).is_some())
            .count()
    }

    /// Number of live assignments.
    pub fn assignment_count(&self) -> usize {
        self.assignments.len()
    }
}
