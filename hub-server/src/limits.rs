//! Rate limiting for peerhub-server.
//!
//! Register, heartbeat, and relay calls are limited per peer id, and all
//! requests together by a global limiter. Both use governor; the keyed
//! limiter is backed by a DashMap and shrunk by the registry sweep.

use crate::config::LimitsConfig;
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{NotUntil, Quota, RateLimiter};
use hub_types::PeerId;
use std::num::NonZeroU32;
use std::sync::Arc;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the coordinator.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits requests per peer id.
    peer_limiter: Arc<KeyedLimiter<PeerId>>,
    /// Caps aggregate load even if every peer stays within its own quota.
    global_limiter: Arc<DirectLimiter>,
    clock: DefaultClock,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("peer_limiter", &"KeyedLimiter<PeerId>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero quotas are clamped to one; `Config::validate` rejects them
    /// before this point.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        let global_rps =
            NonZeroU32::new(config.global_requests_per_second).unwrap_or(NonZeroU32::MIN);

        Self {
            peer_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            global_limiter: Arc::new(RateLimiter::direct(Quota::per_second(global_rps))),
            clock: DefaultClock::default(),
        }
    }

    /// Check whether a peer may make another request.
    pub fn check_peer(&self, peer_id: &PeerId) -> Result<(), RateLimitError> {
        self.peer_limiter
            .check_key(peer_id)
            .map_err(|not_until| RateLimitError::PeerLimitExceeded {
                retry_after_secs: self.wait_secs(&not_until),
            })
    }

    /// Check if the global request rate is within limits.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Check the global limiter, then the peer's own.
    pub fn check(&self, peer_id: &PeerId) -> Result<(), RateLimitError> {
        self.check_global()?;
        self.check_peer(peer_id)
    }

    /// Get the number of tracked peer keys (for metrics).
    pub fn peer_keys_count(&self) -> usize {
        self.peer_limiter.len()
    }

    /// Evict entries whose cells have fully recharged (idle peers).
    pub fn shrink(&self) {
        self.peer_limiter.retain_recent();
    }

    fn wait_secs(&self, not_until: &NotUntil<governor::clock::QuantaInstant>) -> u64 {
        let wait = not_until.wait_time_from(self.clock.now());
        wait.as_secs() + u64::from(wait.subsec_nanos() > 0)
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many requests from this peer.
    PeerLimitExceeded {
        /// Seconds until the next request would be allowed.
        retry_after_secs: u64,
    },
    /// Global request rate exceeded across all peers.
    GlobalLimitExceeded,
}

impl RateLimitError {
    /// Seconds the caller should wait.
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            Self::PeerLimitExceeded { retry_after_secs } => (*retry_after_secs).max(1),
            Self::GlobalLimitExceeded => 1,
        }
    }
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerLimitExceeded { .. } => write!(f, "peer rate limit exceeded"),
            Self::GlobalLimitExceeded => write!(f, "global rate limit exceeded"),
        }
    }
}

impl std::error::Error for RateLimitError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(per_minute: u32, global: u32) -> LimitsConfig {
        LimitsConfig {
            requests_per_minute: per_minute,
            global_requests_per_second: global,
        }
    }

    fn peer(id: &str) -> PeerId {
        PeerId::new(id).unwrap()
    }

    #[test]
    fn create_rate_limits() {
        let limits = RateLimits::new(&test_config(5, 100));
        assert_eq!(limits.peer_keys_count(), 0);
    }

    #[test]
    fn peer_limit_allows_within_quota() {
        let limits = RateLimits::new(&test_config(5, 1000));
        let a = peer("peer-a");

        for _ in 0..5 {
            assert!(limits.check_peer(&a).is_ok());
        }

        let err = limits.check_peer(&a).unwrap_err();
        assert!(matches!(err, RateLimitError::PeerLimitExceeded { .. }));
        assert!(err.retry_after_secs() >= 1);
    }

    #[test]
    fn peers_are_limited_independently() {
        let limits = RateLimits::new(&test_config(2, 1000));
        let a = peer("peer-a");
        let b = peer("peer-b");

        assert!(limits.check_peer(&a).is_ok());
        assert!(limits.check_peer(&a).is_ok());
        assert!(limits.check_peer(&a).is_err());

        assert!(limits.check_peer(&b).is_ok());
        assert_eq!(limits.peer_keys_count(), 2);
    }

    #[test]
    fn global_limit_applies_across_peers() {
        let limits = RateLimits::new(&test_config(1000, 3));
        for i in 0..3 {
            assert!(limits.check(&peer(&format!("p{i}"))).is_ok());
        }
        assert_eq!(
            limits.check(&peer("p9")),
            Err(RateLimitError::GlobalLimitExceeded)
        );
    }

    #[test]
    fn shrink_keeps_limiter_usable() {
        let limits = RateLimits::new(&test_config(10, 1000));
        limits.check_peer(&peer("a")).unwrap();
        limits.shrink();
        assert!(limits.check_peer(&peer("a")).is_ok());
    }

    #[test]
    fn rate_limit_error_display() {
        assert_eq!(
            RateLimitError::GlobalLimitExceeded.to_string(),
            "global rate limit exceeded"
        );
        assert_eq!(
            RateLimitError::PeerLimitExceeded {
                retry_after_secs: 3
            }
            .to_string(),
            "peer rate limit exceeded"
        );
    }
}
