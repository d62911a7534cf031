//! Registry, admission and relay endpoints.

use axum::extract::{Path, Query};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use hub_core::{CostSnapshot, Grant, Priority};
use hub_types::{AssignmentId, ByteRange, ContentId, PeerId, SessionId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::error::ApiError;
use crate::error::{ErrorKind, HubError, RegistryError, SessionError};
use crate::registry::{Heartbeat, PeerDescriptor, PeerFilter, PeerInfo, Registration};
use crate::relay::{AdmissionQuery, RelayOutcome, RelayRequest};
use crate::server::CoordinatorState;
use crate::session::{ByteReport, SessionView};

/// Response header carrying the session a mediated relay was charged to.
pub const SESSION_HEADER: &str = "x-peerhub-session";
/// Response header carrying the whole-object size reported by the source.
pub const TOTAL_SIZE_HEADER: &str = "x-peerhub-total-size";

type ApiResult<T> = Result<T, ApiError>;

/// Count a failed request, then hand it to the response layer.
fn tracked<T>(state: &CoordinatorState, result: Result<T, HubError>) -> ApiResult<T> {
    result.map_err(|e| {
        let counter = match e.kind() {
            ErrorKind::AdmissionRejected => &state.metrics().rejections_total,
            // Already counted by the limiter check.
            ErrorKind::RateLimited => return ApiError(e),
            _ => &state.metrics().errors_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        ApiError(e)
    })
}

fn parse_peer(raw: &str) -> Result<PeerId, HubError> {
    Ok(PeerId::new(raw)?)
}

fn parse_session(raw: &str) -> Result<SessionId, HubError> {
    Ok(SessionId::from_str(raw)?)
}

fn parse_range(start: Option<u64>, end: Option<u64>) -> Result<Option<ByteRange>, HubError> {
    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) => Ok(Some(ByteRange::new(start, end)?)),
        _ => Err(HubError::Invalid(
            "range_start and range_end must be given together".into(),
        )),
    }
}

/// `POST /v1/peers`
pub async fn register(
    Extension(state): Extension<Arc<CoordinatorState>>,
    Json(descriptor): Json<PeerDescriptor>,
) -> ApiResult<Json<Registration>> {
    let result = state.register(descriptor);
    tracked(&state, result).map(Json)
}

/// `POST /v1/peers/:id/heartbeat`
pub async fn heartbeat(
    Extension(state): Extension<Arc<CoordinatorState>>,
    Path(peer_id): Path<String>,
) -> ApiResult<Json<Heartbeat>> {
    let result = parse_peer(&peer_id).and_then(|peer| state.heartbeat(&peer));
    tracked(&state, result).map(Json)
}

/// `DELETE /v1/peers/:id`
pub async fn deregister(
    Extension(state): Extension<Arc<CoordinatorState>>,
    Path(peer_id): Path<String>,
) -> ApiResult<StatusCode> {
    let result = parse_peer(&peer_id).and_then(|peer| {
        if state.deregister(&peer) {
            Ok(StatusCode::NO_CONTENT)
        } else {
            Err(RegistryError::NotFound(peer).into())
        }
    });
    tracked(&state, result)
}

/// Discovery response.
#[derive(Debug, Serialize)]
pub struct DiscoverResponse {
    /// Matching live peers; addresses are always pseudonymous.
    pub peers: Vec<PeerInfo>,
}

/// `GET /v1/peers?content_id=&capability=`
pub async fn discover(
    Extension(state): Extension<Arc<CoordinatorState>>,
    Query(filter): Query<PeerFilter>,
) -> Json<DiscoverResponse> {
    Json(DiscoverResponse {
        peers: state.registry().list(&filter),
    })
}

/// Private address resolution response.
#[derive(Debug, Serialize)]
pub struct PrivateAddresses {
    /// Peer resolved.
    pub peer_id: PeerId,
    /// Real transport locators.
    pub private_addresses: Vec<String>,
}

/// `POST /v1/peers/:id/private` with `Authorization: Bearer <token>`
pub async fn resolve_private(
    Extension(state): Extension<Arc<CoordinatorState>>,
    Path(peer_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<PrivateAddresses>> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    let result = parse_peer(&peer_id).and_then(|peer| {
        let private_addresses = state.registry().resolve_private(&peer, token)?;
        Ok(PrivateAddresses {
            peer_id: peer,
            private_addresses,
        })
    });
    tracked(&state, result).map(Json)
}

/// Admission request body.
#[derive(Debug, Deserialize)]
pub struct AdmissionBody {
    /// Requesting peer.
    pub peer_id: PeerId,
    /// Declared tier.
    pub tier: String,
    /// Requested bandwidth, KiB/s.
    #[serde(default)]
    pub requested_bandwidth: u64,
    /// Premium entitlement.
    #[serde(default)]
    pub is_premium: bool,
    /// Whether a direct connection was tried first.
    #[serde(default)]
    pub p2p_attempted: bool,
    /// Content the session is for.
    #[serde(default)]
    pub content_id: Option<ContentId>,
    /// Range start, inclusive.
    #[serde(default)]
    pub range_start: Option<u64>,
    /// Range end, exclusive.
    #[serde(default)]
    pub range_end: Option<u64>,
    /// Session being continued.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Liveness probe.
    #[serde(default)]
    pub health_check: bool,
}

/// Limits granted with an admission.
#[derive(Debug, Serialize)]
pub struct Limits {
    /// Tier granted.
    pub tier: String,
    /// Bandwidth cap, KiB/s.
    pub max_bandwidth: u64,
    /// Session duration cap, seconds.
    pub max_duration_secs: u64,
    /// Scheduling priority.
    pub priority: Priority,
}

/// Admission response.
#[derive(Debug, Serialize)]
pub struct AdmitResponse {
    /// Always true; rejections are errors.
    pub admitted: bool,
    /// Session created or continued; absent for health checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Limits granted.
    pub limits: Limits,
    /// Mode at decision time.
    pub mode: hub_core::AdmissionMode,
    /// Cost signal at decision time.
    pub cost: CostSnapshot,
}

impl AdmitResponse {
    fn new(session_id: Option<SessionId>, grant: Grant) -> Self {
        Self {
            admitted: true,
            session_id,
            limits: Limits {
                tier: grant.tier,
                max_bandwidth: grant.bandwidth,
                max_duration_secs: grant.max_duration_secs,
                priority: grant.priority,
            },
            mode: grant.mode,
            cost: grant.cost,
        }
    }
}

/// `POST /v1/relay/admission`
pub async fn admission(
    Extension(state): Extension<Arc<CoordinatorState>>,
    Json(body): Json<AdmissionBody>,
) -> ApiResult<Json<AdmitResponse>> {
    let result = state.check_rate(&body.peer_id).and_then(|()| {
        let query = AdmissionQuery {
            range: parse_range(body.range_start, body.range_end)?,
            peer_id: body.peer_id,
            tier: body.tier,
            requested_bandwidth: body.requested_bandwidth,
            is_premium: body.is_premium,
            p2p_attempted: body.p2p_attempted,
            content_id: body.content_id,
            continuation: body.session_id,
            health_check: body.health_check,
        };
        let admission = state.relay().admit(&query)?;
        state.metrics().admissions_total.fetch_add(1, Ordering::Relaxed);
        Ok(AdmitResponse::new(admission.session_id, admission.grant))
    });
    tracked(&state, result).map(Json)
}

/// Byte report body.
#[derive(Debug, Deserialize)]
pub struct BytesBody {
    /// Bytes transferred since the last report.
    pub bytes: u64,
}

/// `POST /v1/relay/sessions/:id/bytes`
pub async fn record_bytes(
    Extension(state): Extension<Arc<CoordinatorState>>,
    Path(session_id): Path<String>,
    Json(body): Json<BytesBody>,
) -> ApiResult<Json<ByteReport>> {
    let result = parse_session(&session_id)
        .and_then(|id| Ok(state.sessions().record_bytes(&id, body.bytes)?));
    tracked(&state, result).map(Json)
}

/// `DELETE /v1/relay/sessions/:id`
pub async fn complete_session(
    Extension(state): Extension<Arc<CoordinatorState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    let result = parse_session(&session_id).and_then(|id| {
        let session = state.sessions().complete(&id)?;
        Ok(session.view())
    });
    tracked(&state, result).map(Json)
}

/// `GET /v1/relay/sessions/:id`
pub async fn get_session(
    Extension(state): Extension<Arc<CoordinatorState>>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<SessionView>> {
    let result = parse_session(&session_id).and_then(|id| {
        state
            .sessions()
            .get(&id)
            .map(|s| s.view())
            .ok_or_else(|| SessionError::NotFound(id).into())
    });
    tracked(&state, result).map(Json)
}

/// Relay execution body.
#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    /// Content to relay.
    pub content_id: ContentId,
    /// Peer holding it.
    pub from_peer_id: PeerId,
    /// Requesting peer.
    pub to_peer_id: PeerId,
    /// Range start, inclusive.
    #[serde(default)]
    pub range_start: Option<u64>,
    /// Range end, exclusive.
    #[serde(default)]
    pub range_end: Option<u64>,
    /// Whole-object size, if known.
    #[serde(default)]
    pub total_size: Option<u64>,
    /// Requester's tier.
    #[serde(default = "default_tier")]
    pub tier: String,
    /// Premium entitlement.
    #[serde(default)]
    pub is_premium: bool,
    /// Whether a direct connection was tried first.
    #[serde(default = "default_true")]
    pub p2p_attempted: bool,
    /// Requested bandwidth, KiB/s.
    #[serde(default)]
    pub requested_bandwidth: u64,
    /// Session being continued.
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

fn default_tier() -> String {
    "free".to_string()
}

fn default_true() -> bool {
    true
}

/// Hosted relay response.
#[derive(Debug, Serialize)]
pub struct HostedResponse {
    /// Always "hosted".
    pub relay: &'static str,
    /// Hand-off id.
    pub assignment_id: AssignmentId,
    /// Peer carrying the relay.
    pub relay_peer_id: PeerId,
    /// Session admitted for it.
    pub session_id: SessionId,
}

/// `POST /v1/relay/execute`
///
/// Raw bytes on a mediated relay; `202` with JSON when a relay-capable
/// peer took the job.
pub async fn execute(
    Extension(state): Extension<Arc<CoordinatorState>>,
    Json(body): Json<ExecuteBody>,
) -> ApiResult<Response> {
    let checked = state.check_rate(&body.to_peer_id).and_then(|()| {
        let range = parse_range(body.range_start, body.range_end)?;
        let mut request = RelayRequest::new(body.content_id, body.from_peer_id, body.to_peer_id)
            .with_tier(body.tier, body.is_premium);
        if let Some(range) = range {
            request = request.with_range(range, body.total_size);
        } else {
            request.total_size = body.total_size;
        }
        request.p2p_attempted = body.p2p_attempted;
        request.requested_bandwidth = body.requested_bandwidth;
        request.session_id = body.session_id;
        Ok(request)
    });
    let request = tracked(&state, checked)?;

    let outcome = state.relay().execute(request).await.map_err(HubError::from);
    match tracked(&state, outcome)? {
        RelayOutcome::Mediated {
            session_id,
            payload,
            total_size,
            ..
        } => {
            let mut response = (StatusCode::OK, payload).into_response();
            let headers = response.headers_mut();
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            if let Ok(v) = HeaderValue::from_str(&session_id.to_string()) {
                headers.insert(SESSION_HEADER, v);
            }
            if let Some(size) = total_size {
                headers.insert(TOTAL_SIZE_HEADER, HeaderValue::from(size));
            }
            Ok(response)
        }
        RelayOutcome::Hosted {
            assignment_id,
            relay_peer,
            session_id,
        } => Ok((
            StatusCode::ACCEPTED,
            Json(HostedResponse {
                relay: "hosted",
                assignment_id,
                relay_peer_id: relay_peer,
                session_id,
            }),
        )
            .into_response()),
    }
}

/// `GET /v1/stats`
pub async fn stats(
    Extension(state): Extension<Arc<CoordinatorState>>,
) -> Json<crate::server::Stats> {
    Json(state.stats())
}
