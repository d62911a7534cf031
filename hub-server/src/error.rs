//! Error types for peerhub-server.
//!
//! Each layer has its own enum; [`HubError`] wraps them all. Every error
//! maps onto one [`ErrorKind`], which is what the HTTP layer renders and
//! what peers feed into their reconnection policy.

use hub_core::{FailureClass, Rejection};
use hub_types::{AddressError, AssignmentId, PeerId, RequestId, SessionId, WireError};
use std::time::Duration;

use crate::limits::RateLimitError;

/// Seconds a caller should wait after a relay timed out.
pub const RETRY_AFTER_TIMEOUT: u64 = 5;
/// Seconds a caller should wait when the source peer has no open channel.
pub const RETRY_AFTER_UNAVAILABLE: u64 = 30;
/// Seconds a caller should wait after the source peer disconnected mid-relay.
pub const RETRY_AFTER_CONNECTION_LOST: u64 = 5;
/// Seconds a caller should wait after a malformed or failed delivery.
pub const RETRY_AFTER_BAD_PAYLOAD: u64 = 30;
/// Seconds a caller should wait when the registry is full.
pub const RETRY_AFTER_REGISTRY_FULL: u64 = 60;

/// Error taxonomy shared by every layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input.
    Validation,
    /// Missing pseudonymous address or real-address leak.
    PrivacyViolation,
    /// Unknown peer, session, or content.
    NotFound,
    /// Budget, tier, or capacity gating.
    AdmissionRejected,
    /// Relay correlation expired.
    Timeout,
    /// No reachable channel to the source peer.
    ChannelUnavailable,
    /// Source answered with something that is not content.
    MalformedRelayPayload,
    /// Source channel closed while the relay was pending.
    ConnectionLost,
    /// Missing or wrong credentials.
    Unauthorized,
    /// Rate limit exceeded.
    RateLimited,
    /// Anything else.
    Internal,
}

impl ErrorKind {
    /// Machine-readable name used in API error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::PrivacyViolation => "privacy_violation",
            Self::NotFound => "not_found",
            Self::AdmissionRejected => "admission_rejected",
            Self::Timeout => "timeout",
            Self::ChannelUnavailable => "channel_unavailable",
            Self::MalformedRelayPayload => "malformed_relay_payload",
            Self::ConnectionLost => "connection_lost",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::Internal => "internal",
        }
    }

    /// How a peer should retry an error of this kind.
    pub fn failure_class(&self, retry_after: Option<u64>) -> FailureClass {
        if let Some(secs) = retry_after {
            if matches!(self, Self::AdmissionRejected | Self::RateLimited) {
                return FailureClass::RetryAfter(Duration::from_secs(secs));
            }
        }
        match self {
            Self::NotFound => FailureClass::NotRegistered,
            Self::Validation | Self::PrivacyViolation | Self::Unauthorized => {
                FailureClass::Permanent
            }
            _ => FailureClass::Transient,
        }
    }
}

/// Peer registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Address list breaks the pseudonymity rule.
    #[error("privacy violation: {0}")]
    Privacy(#[from] AddressError),

    /// No address at all was supplied.
    #[error("privacy violation: at least one pseudonymous address is required")]
    NoPseudonymousAddress,

    /// Descriptor failed validation.
    #[error("invalid peer descriptor: {0}")]
    Validation(String),

    /// Peer is unknown or expired.
    #[error("peer not found: {0}")]
    NotFound(PeerId),

    /// Registry is at capacity.
    #[error("registry full ({limit} peers)")]
    Full {
        /// Configured limit.
        limit: usize,
    },

    /// Resolver token missing, wrong, or resolution disabled.
    #[error("private address resolution not authorized")]
    Unauthorized,

    /// Channel token missing or wrong.
    #[error("channel token missing or invalid")]
    ChannelUnauthorized,

    /// No randomness available for a channel token.
    #[error("cannot issue channel token: {0}")]
    Entropy(String),
}

/// Session tracker errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No active session with this id.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Session outlived its duration cap.
    #[error("session expired: {0}")]
    Expired(SessionId),

    /// Health-check grants never create sessions.
    #[error("health-check admission has no session")]
    HealthCheck,
}

/// Cost provider errors.
#[derive(Debug, thiserror::Error)]
pub enum CostError {
    /// HTTP request failed.
    #[error("cost provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Reading had negative or non-finite values.
    #[error("invalid cost reading: {0}")]
    InvalidReading(String),

    /// No reading available.
    #[error("cost provider unavailable: {0}")]
    Unavailable(String),
}

/// Duplex channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Peer has no open channel.
    #[error("no channel to peer {0}")]
    NotConnected(PeerId),

    /// Channel closed underneath the sender.
    #[error("channel to peer {0} closed")]
    Closed(PeerId),

    /// Outbound queue is full.
    #[error("channel to peer {0} is backed up")]
    Full(PeerId),

    /// Message could not be encoded.
    #[error("channel encoding failed: {0}")]
    Encode(#[from] WireError),
}

/// Relay errors.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Admission controller said no.
    #[error("admission rejected: {}", describe_rejection(.0))]
    Rejected(Box<Rejection>),

    /// Source and destination are the same peer.
    #[error("source and destination must differ")]
    SamePeer,

    /// Peer is not registered or has expired.
    #[error("peer not found: {0}")]
    UnknownPeer(PeerId),

    /// Source does not claim the content.
    #[error("peer {peer} does not hold {content}")]
    ContentNotHeld {
        /// Source peer.
        peer: PeerId,
        /// Requested content.
        content: String,
    },

    /// Malformed request.
    #[error("invalid relay request: {0}")]
    Invalid(String),

    /// No response within the window.
    #[error("relay {request_id} timed out after {after:?}")]
    Timeout {
        /// Correlation id.
        request_id: RequestId,
        /// Window that elapsed.
        after: Duration,
    },

    /// Source peer has no reachable channel.
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(#[from] ChannelError),

    /// Source channel dropped while the relay was pending.
    #[error("connection to {peer} lost during relay {request_id}")]
    ConnectionLost {
        /// Correlation id.
        request_id: RequestId,
        /// Source peer.
        peer: PeerId,
    },

    /// Coordinator is shutting down.
    #[error("relay {0} abandoned: coordinator shutting down")]
    ShuttingDown(RequestId),

    /// Source answered with something that is not content.
    #[error("malformed relay payload for {request_id}: {reason}")]
    MalformedPayload {
        /// Correlation id.
        request_id: RequestId,
        /// What was wrong.
        reason: String,
    },

    /// Source explicitly reported it could not deliver.
    #[error("source failed relay {request_id}: {reason}")]
    SourceFailed {
        /// Correlation id.
        request_id: RequestId,
        /// Reason given by the source.
        reason: String,
    },

    /// Unknown hosted-relay assignment.
    #[error("unknown relay assignment: {0}")]
    UnknownAssignment(AssignmentId),

    /// Session bookkeeping failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}

fn describe_rejection(r: &Rejection) -> String {
    format!("{} ({} mode)", r.reason, r.mode)
}

impl From<Rejection> for RelayError {
    fn from(r: Rejection) -> Self {
        Self::Rejected(Box::new(r))
    }
}

/// Main error type for peerhub-server operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Registry error.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Session error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Relay error.
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// Cost provider error.
    #[error(transparent)]
    Cost(#[from] CostError),

    /// Channel error.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(#[from] RateLimitError),

    /// Malformed identifier, range, or message.
    #[error("invalid input: {0}")]
    Wire(#[from] WireError),

    /// Malformed request.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    /// Taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Privacy(_) | Self::NoPseudonymousAddress => ErrorKind::PrivacyViolation,
            Self::Validation(_) | Self::Full { .. } => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized | Self::ChannelUnauthorized => ErrorKind::Unauthorized,
            Self::Entropy(_) => ErrorKind::Internal,
        }
    }

    /// Retry hint in seconds.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Full { .. } => Some(RETRY_AFTER_REGISTRY_FULL),
            _ => None,
        }
    }
}

impl SessionError {
    /// Taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) | Self::Expired(_) => ErrorKind::NotFound,
            Self::HealthCheck => ErrorKind::Validation,
        }
    }
}

impl RelayError {
    /// Taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected(_) => ErrorKind::AdmissionRejected,
            Self::SamePeer | Self::Invalid(_) => ErrorKind::Validation,
            Self::UnknownPeer(_) | Self::ContentNotHeld { .. } | Self::UnknownAssignment(_) => {
                ErrorKind::NotFound
            }
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ChannelUnavailable(_) | Self::ShuttingDown(_) | Self::SourceFailed { .. } => {
                ErrorKind::ChannelUnavailable
            }
            Self::ConnectionLost { .. } => ErrorKind::ConnectionLost,
            Self::MalformedPayload { .. } => ErrorKind::MalformedRelayPayload,
            Self::Session(e) => e.kind(),
        }
    }

    /// Retry hint in seconds.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Rejected(r) => Some(r.retry_after_secs),
            Self::Timeout { .. } => Some(RETRY_AFTER_TIMEOUT),
            Self::ChannelUnavailable(_) | Self::ShuttingDown(_) => Some(RETRY_AFTER_UNAVAILABLE),
            Self::ConnectionLost { .. } => Some(RETRY_AFTER_CONNECTION_LOST),
            Self::MalformedPayload { .. } | Self::SourceFailed { .. } => {
                Some(RETRY_AFTER_BAD_PAYLOAD)
            }
            _ => None,
        }
    }
}

impl HubError {
    /// Taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Registry(e) => e.kind(),
            Self::Session(e) => e.kind(),
            Self::Relay(e) => e.kind(),
            Self::Channel(_) => ErrorKind::ChannelUnavailable,
            Self::RateLimited(_) => ErrorKind::RateLimited,
            Self::Wire(_) | Self::Invalid(_) => ErrorKind::Validation,
            Self::Config(_) | Self::Cost(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Retry hint in seconds, when the caller may retry.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Registry(e) => e.retry_after(),
            Self::Relay(e) => e.retry_after(),
            Self::Channel(_) => Some(RETRY_AFTER_UNAVAILABLE),
            Self::RateLimited(e) => Some(e.retry_after_secs()),
            _ => None,
        }
    }

    /// How a peer should retry this error.
    pub fn failure_class(&self) -> FailureClass {
        self.kind().failure_class(self.retry_after())
    }
}

/// Result type alias for peerhub-server operations.
pub type Result<T> = std::result::Result<T, HubError>;
