//! Relay session tracking.
//!
//! Sessions are created on admission, fed byte counts while they relay,
//! and removed on completion, expiry, or forced termination when the
//! admission mode escalates. Each session is indexed by tier so quota
//! checks are O(1), and by peer so a peer's sessions can be listed.

use dashmap::DashMap;
use hub_core::{ActiveSessionInfo, AdmissionMode, Grant, LoadView, Priority};
use hub_types::{ContentId, PeerId, SessionId};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::SessionError;
use crate::unix_now;

/// An admitted relay session.
#[derive(Debug, Clone)]
pub struct RelaySession {
    /// Session id.
    pub id: SessionId,
    /// Owning peer.
    pub peer_id: PeerId,
    /// Tier it was admitted under.
    pub tier: String,
    /// Content being relayed, when known.
    pub content_id: Option<ContentId>,
    /// Creation time.
    pub started_at: Instant,
    /// Start of the current duration window (creation or last renewal).
    pub window_start: Instant,
    /// Creation time, Unix seconds.
    pub started_unix: u64,
    /// Bandwidth cap, KiB/s.
    pub max_bandwidth: u64,
    /// Duration cap, counted from `window_start`.
    pub max_duration: Duration,
    /// Bytes relayed so far.
    pub bytes_transferred: u64,
    /// False once the session overran its limits; swept next pass.
    pub active: bool,
    /// Priority label from the grant.
    pub priority: Priority,
    /// Mode the session was last admitted or renewed in.
    pub mode: AdmissionMode,
}

impl RelaySession {
    /// Whether the duration cap has elapsed.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) > self.max_duration
    }

    /// Bytes the bandwidth cap allows up to `now` (at least one second's worth).
    pub fn allowance_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.window_start).as_secs().max(1);
        self.max_bandwidth
            .saturating_mul(1024)
            .saturating_mul(elapsed)
    }

    /// Public view of the session.
    pub fn view(&self) -> SessionView {
        SessionView {
            session_id: self.id,
            peer_id: self.peer_id.clone(),
            tier: self.tier.clone(),
            max_bandwidth: self.max_bandwidth,
            max_duration_secs: self.max_duration.as_secs(),
            bytes_transferred: self.bytes_transferred,
            started_at: self.started_unix,
            priority: self.priority,
        }
    }
}

/// Session as reported by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    /// Session id.
    pub session_id: SessionId,
    /// Owning peer.
    pub peer_id: PeerId,
    /// Tier name.
    pub tier: String,
    /// Bandwidth cap, KiB/s.
    pub max_bandwidth: u64,
    /// Duration cap, seconds.
    pub max_duration_secs: u64,
    /// Bytes relayed so far.
    pub bytes_transferred: u64,
    /// Creation time, Unix seconds.
    pub started_at: u64,
    /// Priority label.
    pub priority: Priority,
}

/// Outcome of [`SessionTracker::record_bytes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteReport {
    /// Cumulative bytes for the session.
    pub bytes_transferred: u64,
    /// Whether the session is still within its bandwidth allowance.
    pub within_allowance: bool,
}

/// Tracks admitted relay sessions.
#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: DashMap<SessionId, RelaySession>,
    by_tier: DashMap<String, usize>,
    by_peer: DashMap<PeerId, HashSet<SessionId>>,
    bytes_relayed: AtomicU64,
}

impl SessionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session under a grant, or renew the one it continues.
    pub fn admit(
        &self,
        peer_id: &PeerId,
        grant: &Grant,
        content_id: Option<ContentId>,
    ) -> Result<SessionId, SessionError> {
        if grant.health_check {
            return Err(SessionError::HealthCheck);
        }
        if let Some(id) = grant.continuation {
            self.renew(&id, grant)?;
            return Ok(id);
        }

        let now = Instant::now();
        let session = RelaySession {
            id: SessionId::new(),
            peer_id: peer_id.clone(),
            tier: grant.tier.clone(),
            content_id,
            started_at: now,
            window_start: now,
            started_unix: unix_now(),
            max_bandwidth: grant.bandwidth,
            max_duration: grant.max_duration(),
            bytes_transferred: 0,
            active: true,
            priority: grant.priority,
            mode: grant.mode,
        };
        let id = session.id;
        self.insert(session);
        tracing::debug!(session = %id, peer = %peer_id, tier = %grant.tier, bandwidth = grant.bandwidth, "session admitted");
        Ok(id)
    }

    /// Apply a continuation grant's limits and restart the duration window.
    pub fn renew(&self, id: &SessionId, grant: &Grant) -> Result<(), SessionError> {
        let mut session = self
            .sessions
            .get_mut(id)
            .filter(|s| s.active)
            .ok_or(SessionError::NotFound(*id))?;
        session.window_start = Instant::now();
        session.max_bandwidth = grant.bandwidth;
        session.max_duration = grant.max_duration();
        session.priority = grant.priority;
        session.mode = grant.mode;
        tracing::debug!(session = %id, bandwidth = grant.bandwidth, mode = %grant.mode, "session renewed");
        Ok(())
    }

    /// Add relayed bytes to a session.
    ///
    /// Bytes always count towards the global total, even when the session
    /// has expired, since they were relayed regardless.
    pub fn record_bytes(&self, id: &SessionId, bytes: u64) -> Result<ByteReport, SessionError> {
        self.bytes_relayed.fetch_add(bytes, Ordering::Relaxed);

        let now = Instant::now();
        let mut session = self
            .sessions
            .get_mut(id)
            .filter(|s| s.active)
            .ok_or(SessionError::NotFound(*id))?;
        session.bytes_transferred = session.bytes_transferred.saturating_add(bytes);

        if session.is_expired_at(now) {
            session.active = false;
            return Err(SessionError::Expired(*id));
        }

        Ok(ByteReport {
            bytes_transferred: session.bytes_transferred,
            within_allowance: session.bytes_transferred <= session.allowance_at(now),
        })
    }

    /// End a session normally.
    pub fn complete(&self, id: &SessionId) -> Result<RelaySession, SessionError> {
        let session = self.remove(id).ok_or(SessionError::NotFound(*id))?;
        tracing::debug!(session = %id, bytes = session.bytes_transferred, "session completed");
        Ok(session)
    }

    /// Force-end every session matching a predicate. Returns the ended ids.
    pub fn terminate_where(&self, predicate: impl Fn(&RelaySession) -> bool) -> Vec<SessionId> {
        let doomed: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| predicate(s.value()))
            .map(|s| *s.key())
            .collect();

        doomed
            .into_iter()
            .filter(|id| self.remove(id).is_some())
            .collect()
    }

    /// Remove expired and inactive sessions. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let swept = self
            .terminate_where(|s| !s.active || s.is_expired_at(now))
            .len();
        if swept > 0 {
            tracing::info!(swept, remaining = self.sessions.len(), "swept relay sessions");
        }
        swept
    }

    /// A copy of a session.
    pub fn get(&self, id: &SessionId) -> Option<RelaySession> {
        self.sessions.get(id).map(|s| s.clone())
    }

    /// Sessions owned by a peer.
    pub fn sessions_of(&self, peer_id: &PeerId) -> Vec<SessionId> {
        self.by_peer
            .get(peer_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Active session counts keyed by tier name.
    pub fn counts_by_tier(&self) -> BTreeMap<String, usize> {
        self.by_tier
            .iter()
            .filter(|e| *e.value() > 0)
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    /// Number of tracked sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no sessions are tracked.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Total bytes relayed since startup.
    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    fn insert(&self, session: RelaySession) {
        *self.by_tier.entry(session.tier.clone()).or_insert(0) += 1;
        self.by_peer
            .entry(session.peer_id.clone())
            .or_default()
            .insert(session.id);
        self.sessions.insert(session.id, session);
    }

    /// Remove a session and its index entries. Only the caller whose
    /// `remove` succeeded touches the indexes, so they stay in step.
    fn remove(&self, id: &SessionId) -> Option<RelaySession> {
        let (_, session) = self.sessions.remove(id)?;
        if let Some(mut count) = self.by_tier.get_mut(&session.tier) {
            *count = count.saturating_sub(1);
        }
        self.by_peer.remove_if_mut(&session.peer_id, |_, ids| {
            ids.remove(id);
            ids.is_empty()
        });
        Some(session)
    }
}

impl LoadView for SessionTracker {
    fn active_in_tier(&self, tier: &str) -> usize {
        self.by_tier.get(tier).map(|c| *c).unwrap_or(0)
    }

    fn active_session(&self, id: &SessionId) -> Option<ActiveSessionInfo> {
        let now = Instant::now();
        self.sessions
            .get(id)
            .filter(|s| s.active && !s.is_expired_at(now))
            .map(|s| ActiveSessionInfo {
                peer_id: s.peer_id.clone(),
                tier: s.tier.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_core::CostSnapshot;

    fn grant(tier: &str, bandwidth: u64, secs: u64) -> Grant {
        Grant {
            tier: tier.into(),
            bandwidth,
            max_duration_secs: secs,
            priority: Priority::Normal,
            mode: AdmissionMode::Normal,
            continuation: None,
            health_check: false,
            cost: CostSnapshot::initial(100.0, 0),
        }
    }

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[tokio::test]
    async fn admit_indexes_by_tier_and_peer() {
        let tracker = SessionTracker::new();
        let a = tracker.admit(&peer("a"), &grant("free", 64, 600), None).unwrap();
        tracker.admit(&peer("a"), &grant("premium", 4096, 600), None).unwrap();
        tracker.admit(&peer("b"), &grant("free", 64, 600), None).unwrap();

        assert_eq!(tracker.active_in_tier("free"), 2);
        assert_eq!(tracker.active_in_tier("premium"), 1);
        assert_eq!(tracker.sessions_of(&peer("a")).len(), 2);
        assert_eq!(
            tracker.active_session(&a),
            Some(ActiveSessionInfo {
                peer_id: peer("a"),
                tier: "free".into()
            })
        );
    }

    #[tokio::test]
    async fn health_check_grant_creates_no_session() {
        let tracker = SessionTracker::new();
        let mut g = grant("free", 0, 0);
        g.health_check = true;
        assert!(matches!(
            tracker.admit(&peer("a"), &g, None),
            Err(SessionError::HealthCheck)
        ));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn continuation_renews_existing_session() {
        let tracker = SessionTracker::new();
        let id = tracker
            .admit(&peer("a"), &grant("premium", 4096, 7200), None)
            .unwrap();
        let mut cont = grant("premium", 5, 300);
        cont.continuation = Some(id);
        cont.mode = AdmissionMode::Emergency;

        assert_eq!(tracker.admit(&peer("a"), &cont, None).unwrap(), id);
        assert_eq!(tracker.len(), 1);
        let s = tracker.get(&id).unwrap();
        assert_eq!(s.max_bandwidth, 5);
        assert_eq!(s.max_duration, Duration::from_secs(300));
        assert_eq!(s.mode, AdmissionMode::Emergency);
    }

    #[tokio::test(start_paused = true)]
    async fn record_bytes_checks_allowance() {
        let tracker = SessionTracker::new();
        let id = tracker.admit(&peer("a"), &grant("free", 1, 600), None).unwrap();

        // 1 KiB/s, first second's worth is allowed immediately.
        let r = tracker.record_bytes(&id, 1024).unwrap();
        assert!(r.within_allowance);
        let r = tracker.record_bytes(&id, 1).unwrap();
        assert!(!r.within_allowance);

        tokio::time::advance(Duration::from_secs(10)).await;
        let r = tracker.record_bytes(&id, 0).unwrap();
        assert!(r.within_allowance);
        assert_eq!(r.bytes_transferred, 1025);
        assert_eq!(tracker.bytes_relayed(), 1025);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_sessions() {
        let tracker = SessionTracker::new();
        let short = tracker.admit(&peer("a"), &grant("free", 64, 60), None).unwrap();
        let long = tracker.admit(&peer("b"), &grant("free", 64, 600), None).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(tracker.active_session(&short).is_none());
        assert_eq!(tracker.sweep(), 1);
        assert!(tracker.get(&short).is_none());
        assert!(tracker.get(&long).is_some());
        assert_eq!(tracker.active_in_tier("free"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_goes_inactive_on_record() {
        let tracker = SessionTracker::new();
        let id = tracker.admit(&peer("a"), &grant("free", 64, 10), None).unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(matches!(
            tracker.record_bytes(&id, 100),
            Err(SessionError::Expired(_))
        ));
        assert!(!tracker.get(&id).unwrap().active);
        assert!(matches!(
            tracker.record_bytes(&id, 100),
            Err(SessionError::NotFound(_))
        ));
        assert_eq!(tracker.sweep(), 1);
        // Bytes relayed after expiry still count globally.
        assert_eq!(tracker.bytes_relayed(), 200);
    }

    #[tokio::test]
    async fn terminate_where_ends_matching_sessions() {
        let tracker = SessionTracker::new();
        tracker.admit(&peer("a"), &grant("free", 64, 600), None).unwrap();
        tracker.admit(&peer("b"), &grant("basic", 256, 600), None).unwrap();
        let keep = tracker
            .admit(&peer("c"), &grant("premium", 4096, 600), None)
            .unwrap();

        let ended = tracker.terminate_where(|s| s.tier != "premium");
        assert_eq!(ended.len(), 2);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(&keep).is_some());
        assert_eq!(
            tracker.counts_by_tier(),
            BTreeMap::from([("premium".to_string(), 1)])
        );
        assert!(tracker.sessions_of(&peer("a")).is_empty());
    }

    #[tokio::test]
    async fn complete_is_exactly_once() {
        let tracker = SessionTracker::new();
        let id = tracker.admit(&peer("a"), &grant("free", 64, 600), None).unwrap();
        assert!(tracker.complete(&id).is_ok());
        assert!(matches!(
            tracker.complete(&id),
            Err(SessionError::NotFound(_))
        ));
        assert_eq!(tracker.active_in_tier("free"), 0);
    }
}
