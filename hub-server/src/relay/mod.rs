//! Relay orchestration.
//!
//! A relay request is admitted by the [`CostAdmissionController`], then
//! handed to a relay-capable peer if one has spare capacity, and otherwise
//! mediated by the coordinator: a `Deliver` goes out on the source peer's
//! channel and the caller suspends on a [`PendingTable`] entry until the
//! correlated answer, the timer, or a disconnect settles it.

pub mod hosted;
pub mod pending;

pub use hosted::{HostedLoad, ReleaseReason, Released};
pub use pending::{PendingGuard, PendingInfo, PendingTable, Settlement, TransferKind};

use hub_core::{
    pick_least_loaded, AdmissionRequest, Decision, Grant, LoadPolicy, RelayCandidate,
};
use hub_types::{AssignmentId, ByteRange, ChannelMessage, ContentId, PeerId, RequestId, SessionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::admission::CostAdmissionController;
use crate::channel::ChannelRegistry;
use crate::config::RelayConfig;
use crate::error::{ChannelError, RelayError};
use crate::registry::PeerRegistry;
use crate::session::SessionTracker;

/// An admission query, as sent to the admission endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionQuery {
    /// Requesting peer.
    pub peer_id: PeerId,
    /// Declared tier.
    pub tier: String,
    /// Requested bandwidth in KiB/s; 0 for the tier default.
    pub requested_bandwidth: u64,
    /// Whether the peer holds a premium entitlement.
    pub is_premium: bool,
    /// Whether a direct connection was tried first.
    pub p2p_attempted: bool,
    /// Content the session is for.
    pub content_id: Option<ContentId>,
    /// Byte range the session is for.
    pub range: Option<ByteRange>,
    /// Session being continued.
    pub continuation: Option<SessionId>,
    /// Liveness probe; admitted without a session.
    pub health_check: bool,
}

impl AdmissionQuery {
    fn to_request(&self) -> AdmissionRequest {
        AdmissionRequest {
            peer_id: self.peer_id.clone(),
            tier: self.tier.clone(),
            requested_bandwidth: self.requested_bandwidth,
            is_premium: self.is_premium,
            p2p_attempted: self.p2p_attempted,
            continuation: self.continuation,
            health_check: self.health_check,
        }
    }
}

/// A granted admission.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// Session created or continued; `None` for health checks.
    pub session_id: Option<SessionId>,
    /// Limits granted.
    pub grant: Grant,
}

/// A relay execution request. The destination peer is the requester.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    /// Content to relay.
    pub content_id: ContentId,
    /// Peer holding the content.
    pub from: PeerId,
    /// Peer that wants it.
    pub to: PeerId,
    /// Optional byte range; whole object when absent.
    pub range: Option<ByteRange>,
    /// Requester's tier.
    pub tier: String,
    /// Requester's premium entitlement.
    pub is_premium: bool,
    /// Whether a direct connection was tried first.
    pub p2p_attempted: bool,
    /// Requested bandwidth in KiB/s.
    pub requested_bandwidth: u64,
    /// Session this relay continues.
    pub session_id: Option<SessionId>,
    /// Whole-object size, when the requester knows it.
    pub total_size: Option<u64>,
}

impl RelayRequest {
    /// Whole-object request in the lowest tier, after a failed direct attempt.
    pub fn new(content_id: ContentId, from: PeerId, to: PeerId) -> Self {
        Self {
            content_id,
            from,
            to,
            range: None,
            tier: "free".into(),
            is_premium: false,
            p2p_attempted: true,
            requested_bandwidth: 0,
            session_id: None,
            total_size: None,
        }
    }

    /// Restrict to a byte range.
    pub fn with_range(mut self, range: ByteRange, total_size: Option<u64>) -> Self {
        self.range = Some(range);
        self.total_size = total_size;
        self
    }

    /// Request under a given tier.
    pub fn with_tier(mut self, tier: impl Into<String>, is_premium: bool) -> Self {
        self.tier = tier.into();
        self.is_premium = is_premium;
        self
    }

    /// Continue an existing session.
    pub fn continuing(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    fn admission_query(&self) -> AdmissionQuery {
        AdmissionQuery {
            peer_id: self.to.clone(),
            tier: self.tier.clone(),
            requested_bandwidth: self.requested_bandwidth,
            is_premium: self.is_premium,
            p2p_attempted: self.p2p_attempted,
            content_id: Some(self.content_id.clone()),
            range: self.range,
            continuation: self.session_id,
            health_check: false,
        }
    }
}

/// How a relay was carried out.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    /// The coordinator fetched the content itself.
    Mediated {
        /// Correlation id used on the channel.
        request_id: RequestId,
        /// Session the bytes were charged to.
        session_id: SessionId,
        /// Content bytes.
        payload: Vec<u8>,
        /// Whole-object size, when the source reported it.
        total_size: Option<u64>,
    },
    /// A relay-capable peer took the job.
    Hosted {
        /// Hand-off id.
        assignment_id: AssignmentId,
        /// Peer carrying the relay.
        relay_peer: PeerId,
        /// Session admitted for it.
        session_id: SessionId,
    },
}

/// Relay outcome counters, monotonic since startup.
#[derive(Debug, Default)]
pub struct RelayCounters {
    /// Mediated relays that delivered.
    pub mediated_total: AtomicU64,
    /// Relays handed to relay-capable peers.
    pub hosted_total: AtomicU64,
    /// Mediated relays that timed out.
    pub timeouts_total: AtomicU64,
    /// Mediated relays cut short by a disconnect.
    pub connection_lost_total: AtomicU64,
    /// Payloads rejected as malformed or disguised errors.
    pub malformed_total: AtomicU64,
    /// Explicit delivery failures reported by sources.
    pub source_failed_total: AtomicU64,
    /// Bytes returned to callers by mediated relays.
    pub bytes_mediated: AtomicU64,
}

/// Orchestrates admission, hosted hand-off and mediated relay.
pub struct RelayCoordinator {
    config: RelayConfig,
    load_policy: LoadPolicy,
    registry: Arc<PeerRegistry>,
    sessions: Arc<SessionTracker>,
    admission: Arc<CostAdmissionController>,
    channels: Arc<ChannelRegistry>,
    pending: Arc<PendingTable>,
    hosted: Arc<HostedLoad>,
    counters: RelayCounters,
}

impl std::fmt::Debug for RelayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCoordinator")
            .field("pending", &self.pending.len())
            .field("hosted", &self.hosted.assignment_count())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl RelayCoordinator {
    /// Wire a coordinator to the shared components.
    pub fn new(
        config: &RelayConfig,
        registry: Arc<PeerRegistry>,
        sessions: Arc<SessionTracker>,
        admission: Arc<CostAdmissionController>,
        channels: Arc<ChannelRegistry>,
    ) -> Self {
        let hosted = {
            let sessions = sessions.clone();
            HostedLoad::with_release_hook(move |released: Released| {
                // A hand-off that never went out keeps its session for the
                // mediated fallback.
                if released.reason == ReleaseReason::Undelivered {
                    return;
                }
                if let Some(id) = released.session_id {
                    // Already gone if a mode transition terminated it.
                    let _ = sessions.complete(&id);
                }
            })
        };
        Self {
            config: config.clone(),
            load_policy: config.load_policy(),
            registry,
            sessions,
            admission,
            channels,
            pending: PendingTable::new(),
            hosted,
            counters: RelayCounters::default(),
        }
    }

    /// Decide an admission query and open (or renew) its session.
    pub fn admit(&self, query: &AdmissionQuery) -> Result<Admission, RelayError> {
        let request = query.to_request();
        // The session is recorded before a mode transition can run, so a
        // concurrent escalation always sees it.
        self.admission
            .decide_with(&request, self.sessions.as_ref(), |decision| match decision {
                Decision::Reject(rejection) => Err(rejection.into()),
                Decision::Admit(grant) if grant.health_check => Ok(Admission {
                    session_id: None,
                    grant,
                }),
                Decision::Admit(grant) => {
                    let session_id =
                        self.sessions
                            .admit(&query.peer_id, &grant, query.content_id.clone())?;
                    tracing::debug!(
                        session = %session_id,
                        peer = %query.peer_id,
                        content = ?query.content_id,
                        range = ?query.range,
                        "admission granted"
                    );
                    Ok(Admission {
                        session_id: Some(session_id),
                        grant,
                    })
                }
            })
    }

    /// Admit and carry out a relay.
    pub async fn execute(&self, request: RelayRequest) -> Result<RelayOutcome, RelayError> {
        self.validate(&request)?;

        let admission = self.admit(&request.admission_query())?;
        let Some(session_id) = admission.session_id else {
            return Err(RelayError::Invalid("health check grants carry no relay".into()));
        };
        let owned = request.session_id.is_none();

        if let Some(outcome) = self.try_hosted(&request, session_id, owned).await {
            return Ok(outcome);
        }

        let result = self.mediate(&request, session_id).await;
        if let Ok((request_id, payload, _)) = &result {
            self.charge(&session_id, payload.len() as u64);
            tracing::info!(
                request = %request_id,
                content = %request.content_id,
                from = %request.from,
                to = %request.to,
                bytes = payload.len(),
                "mediated relay delivered"
            );
        }
        if owned {
            // Sweep or a mode transition may already have removed it.
            let _ = self.sessions.complete(&session_id);
        }

        let (request_id, payload, total_size) = result?;
        Ok(RelayOutcome::Mediated {
            request_id,
            session_id,
            payload,
            total_size,
        })
    }

    /// Route an inbound channel message from `from`.
    pub async fn on_message(&self, from: &PeerId, message: ChannelMessage) {
        match message {
            ChannelMessage::Delivered {
                request_id,
                payload,
                total_size,
            } => {
                let settled = self.pending.settle_from(
                    &request_id,
                    from,
                    Settlement::Delivered {
                        payload,
                        total_size,
                    },
                );
                if !settled {
                    tracing::debug!(request = %request_id, peer = %from, "late or unknown delivery dropped");
                }
            }
            ChannelMessage::DeliverFailed { request_id, reason } => {
                if !self
                    .pending
                    .settle_from(&request_id, from, Settlement::Failed(reason))
                {
                    tracing::debug!(request = %request_id, peer = %from, "late or unknown failure dropped");
                }
            }
            ChannelMessage::HostRelayDone { assignment_id } => {
                if self.hosted.complete(&assignment_id, from).is_none() {
                    tracing::debug!(assignment = %assignment_id, peer = %from, "unknown or released assignment");
                }
            }
            ChannelMessage::Ping => {
                if let Err(e) = self.channels.send(from, ChannelMessage::Pong).await {
                    tracing::debug!(peer = %from, error = %e, "pong not sent");
                }
            }
            ChannelMessage::Pong => {}
            ChannelMessage::Deliver { .. } | ChannelMessage::HostRelay { .. } => {
                tracing::warn!(peer = %from, "peer sent a coordinator-only message");
            }
        }
    }

    /// Route a frame from `from` that did not decode. A recoverable
    /// correlation id fails that relay as malformed instead of leaving it
    /// to time out. Returns whether a pending relay was settled.
    pub fn on_undecodable(
        &self,
        from: &PeerId,
        request_id: Option<RequestId>,
        reason: impl Into<String>,
    ) -> bool {
        let reason = reason.into();
        let settled = request_id.is_some_and(|id| {
            self.pending
                .settle_from(&id, from, Settlement::Malformed(reason.clone()))
        });
        if !settled {
            tracing::warn!(peer = %from, request = ?request_id, %reason, "undecodable frame skipped");
        }
        settled
    }

    /// A peer's channel closed: fail its pending relays now and release
    /// the relays it hosted. Returns the number of relays failed.
    pub fn on_channel_closed(&self, peer_id: &PeerId) -> usize {
        let failed = self
            .pending
            .settle_source(peer_id, Settlement::ConnectionLost);
        let released = self.hosted.release_peer(peer_id, ReleaseReason::PeerGone);
        if failed > 0 || !released.is_empty() {
            tracing::info!(
                peer = %peer_id,
                failed,
                released = released.len(),
                "peer channel closed with relays in flight"
            );
        }
        failed
    }

    /// A peer deregistered: drop its channel as well.
    pub fn peer_gone(&self, peer_id: &PeerId) -> usize {
        self.channels.detach_any(peer_id);
        self.on_channel_closed(peer_id)
    }

    /// Settle everything in flight. Returns the number of relays abandoned.
    pub fn shutdown(&self) -> usize {
        let abandoned = self.pending.settle_all(Settlement::Abandoned);
        let released = self.hosted.release_all(ReleaseReason::Shutdown);
        tracing::info!(abandoned, released, "relay coordinator shut down");
        abandoned
    }

    /// Number of mediated relays awaiting an answer.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Pending-relay table.
    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    /// Hosted relay load.
    pub fn hosted(&self) -> &Arc<HostedLoad> {
        &self.hosted
    }

    /// Outcome counters.
    pub fn counters(&self) -> &RelayCounters {
        &self.counters
    }

    /// Timeout for a mediated transfer.
    pub fn timeout_for(&self, kind: TransferKind) -> Duration {
        match kind {
            TransferKind::Range(r) if r.len() <= self.config.small_range_bytes => {
                Duration::from_secs(self.config.range_timeout_secs)
            }
            _ => Duration::from_secs(self.config.object_timeout_secs),
        }
    }

    fn validate(&self, request: &RelayRequest) -> Result<(), RelayError> {
        if request.from == request.to {
            return Err(RelayError::SamePeer);
        }
        for peer in [&request.from, &request.to] {
            if !self.registry.is_live(peer) {
                return Err(RelayError::UnknownPeer(peer.clone()));
            }
        }
        if !self.registry.holds(&request.from, &request.content_id) {
            return Err(RelayError::ContentNotHeld {
                peer: request.from.clone(),
                content: request.content_id.to_string(),
            });
        }
        if let (Some(range), Some(total)) = (request.range, request.total_size) {
            if range.end > total {
                return Err(RelayError::Invalid(format!(
                    "range end {} beyond object size {total}",
                    range.end
                )));
            }
        }
        Ok(())
    }

    async fn try_hosted(
        &self,
        request: &RelayRequest,
        session_id: SessionId,
        owned: bool,
    ) -> Option<RelayOutcome> {
        let weight = self.load_policy.weight(request.range, request.total_size);
        let mut candidates: Vec<RelayCandidate<PeerId>> = self
            .registry
            .relay_candidates(&[&request.from, &request.to])
            .into_iter()
            .filter(|(peer, _)| self.channels.is_connected(peer))
            .map(|(key, capacity)| RelayCandidate {
                load: self.hosted.load_of(&key),
                capacity: f64::from(capacity),
                key,
            })
            .collect();

        let grace = Duration::from_secs(self.config.hosted_grace_secs);
        while let Some(relay_peer) = pick_least_loaded(candidates.clone(), weight) {
            let assignment_id =
                self.hosted
                    .assign(relay_peer.clone(), weight, owned.then_some(session_id), grace);
            let hand_off = ChannelMessage::HostRelay {
                assignment_id,
                content_id: request.content_id.clone(),
                from: request.from.clone(),
                to: request.to.clone(),
                range: request.range,
            };
            match self.channels.send(&relay_peer, hand_off).await {
                Ok(()) => {
                    self.counters.hosted_total.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        assignment = %assignment_id,
                        relay = %relay_peer,
                        content = %request.content_id,
                        weight,
                        "relay handed to peer"
                    );
                    return Some(RelayOutcome::Hosted {
                        assignment_id,
                        relay_peer,
                        session_id,
                    });
                }
                Err(e) => {
                    tracing::warn!(relay = %relay_peer, error = %e, "hand-off failed, trying next relay");
                    self.hosted
                        .release(&assignment_id, ReleaseReason::Undelivered);
                    candidates.retain(|c| c.key != relay_peer);
                }
            }
        }
        None
    }

    async fn mediate(
        &self,
        request: &RelayRequest,
        session_id: SessionId,
    ) -> Result<(RequestId, Vec<u8>, Option<u64>), RelayError> {
        let channel = self
            .channels
            .get(&request.from)
            .ok_or_else(|| ChannelError::NotConnected(request.from.clone()))?;

        let request_id = RequestId::new();
        let kind = TransferKind::from_range(request.range);
        let timeout = self.timeout_for(kind);
        let rx = self
            .pending
            .insert(request_id, request.from.clone(), kind, timeout);
        let _guard = PendingGuard::new(self.pending.clone(), request_id);

        let deliver = ChannelMessage::Deliver {
            request_id,
            content_id: request.content_id.clone(),
            range: request.range,
        };
        if let Err(e) = channel.send(deliver).await {
            self.pending.cancel(&request_id);
            return Err(e.into());
        }
        tracing::debug!(
            request = %request_id,
            session = %session_id,
            source = %request.from,
            ?timeout,
            "deliver signalled"
        );

        // A dropped sender means the table itself went away.
        let settlement = rx.await.unwrap_or(Settlement::Abandoned);
        match settlement {
            Settlement::Delivered {
                payload,
                total_size,
            } => {
                self.check_payload(request_id, kind, &payload)?;
                self.counters.mediated_total.fetch_add(1, Ordering::Relaxed);
                Ok((request_id, payload, total_size))
            }
            Settlement::Failed(reason) => {
                self.counters
                    .source_failed_total
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(request = %request_id, source = %request.from, %reason, "source could not deliver");
                Err(RelayError::SourceFailed { request_id, reason })
            }
            Settlement::Malformed(reason) => {
                self.counters.malformed_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(request = %request_id, source = %request.from, %reason, "undecodable relay response");
                Err(RelayError::MalformedPayload { request_id, reason })
            }
            Settlement::TimedOut => {
                self.counters.timeouts_total.fetch_add(1, Ordering::Relaxed);
                Err(RelayError::Timeout {
                    request_id,
                    after: timeout,
                })
            }
            Settlement::ConnectionLost => {
                self.counters
                    .connection_lost_total
                    .fetch_add(1, Ordering::Relaxed);
                Err(RelayError::ConnectionLost {
                    request_id,
                    peer: request.from.clone(),
                })
            }
            Settlement::Abandoned => Err(RelayError::ShuttingDown(request_id)),
        }
    }

    fn check_payload(
        &self,
        request_id: RequestId,
        kind: TransferKind,
        payload: &[u8],
    ) -> Result<(), RelayError> {
        let reason = if payload.len() > self.config.max_payload_bytes {
            Some(format!(
                "{} bytes exceeds the {} byte limit",
                payload.len(),
                self.config.max_payload_bytes
            ))
        } else if matches!(kind, TransferKind::Range(r) if payload.len() as u64 > r.len()) {
            Some(format!("{} bytes is longer than the requested range", payload.len()))
        } else if looks_like_error_body(payload, self.config.error_sniff_bytes) {
            Some("source answered with an error body".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => {
                self.counters.malformed_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(request = %request_id, %reason, "malformed relay payload");
                Err(RelayError::MalformedPayload { request_id, reason })
            }
            None => Ok(()),
        }
    }

    fn charge(&self, session_id: &SessionId, bytes: u64) {
        self.counters
            .bytes_mediated
            .fetch_add(bytes, Ordering::Relaxed);
        match self.sessions.record_bytes(session_id, bytes) {
            Ok(report) if !report.within_allowance => {
                tracing::warn!(session = %session_id, bytes = report.bytes_transferred, "session over its bandwidth allowance");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(session = %session_id, error = %e, "bytes charged to a closed session"),
        }
    }
}

/// Whether a short payload is really a structured error, i.e. a JSON
/// object carrying an `error` field.
pub fn looks_like_error_body(payload: &[u8], sniff_limit: usize) -> bool {
    if payload.is_empty() || payload.len() > sniff_limit {
        return false;
    }
    let first = payload.iter().find(|b| !b.is_ascii_whitespace());
    if first != Some(&b'{') {
        return false;
    }
    serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.as_object().map(|o| o.contains_key("error")))
        .unwrap_or(false)
}
