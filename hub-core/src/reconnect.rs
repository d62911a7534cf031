//! Unified retry policy for peers talking to the coordinator.
//!
//! One rule for every failure a peer can see:
//! - the coordinator no longer knows the peer: re-register immediately
//! - transient or network failure: exponential backoff with jitter
//! - explicit retry-after hint (admission rejection): wait exactly that long
//! - permanent failure (validation, privacy): do not retry
//!
//! The coordinator never retries on a peer's behalf. It classifies each
//! error it returns (`HubError::failure_class` in peerhub-server) and peers
//! feed that class into [`ReconnectPolicy::delay`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a failure should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Peer unknown to the coordinator (expired or never registered).
    NotRegistered,
    /// Network error, timeout, or lost channel.
    Transient,
    /// The coordinator said when to come back.
    RetryAfter(Duration),
    /// Retrying the same request cannot succeed.
    Permanent,
}

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay for the first transient retry, milliseconds.
    pub base_ms: u64,
    /// Upper bound on the exponential part, milliseconds.
    pub cap_ms: u64,
    /// Upper bound on random jitter, milliseconds.
    pub max_jitter_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 30_000,
            max_jitter_ms: 5_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), or `None` to give up.
    pub fn delay(&self, attempt: u32, class: FailureClass) -> Option<Duration> {
        match class {
            FailureClass::NotRegistered => Some(Duration::ZERO),
            FailureClass::RetryAfter(hint) => Some(hint),
            FailureClass::Permanent => None,
            FailureClass::Transient => {
                Some(self.backoff(attempt).saturating_add(Duration::from_millis(self.jitter_ms())))
            }
        }
    }

    /// Exponential part without jitter: `min(cap, base * 2^(attempt-1))`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.base_ms.saturating_mul(1u64 << exp).min(self.cap_ms);
        Duration::from_millis(ms)
    }

    fn jitter_ms(&self) -> u64 {
        if self.max_jitter_ms == 0 {
            return 0;
        }
        let mut bytes = [0u8; 8];
        // no entropy: no jitter
        if getrandom::getrandom(&mut bytes).is_err() {
            return 0;
        }
        let raw = u64::from_le_bytes(bytes);
        match self.max_jitter_ms.checked_add(1) {
            Some(bound) => raw % bound,
            None => raw,
        }
    }
}
