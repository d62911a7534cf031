//! # peerhub-server
//!
//! Coordination server for peerhub.
//!
//! This crate implements the coordinator that:
//! - Keeps a liveness-tracked directory of peers and the content they hold
//! - Admits relay sessions against the live cost of running the relay
//! - Tracks admitted sessions and their byte counts
//! - Carries out relays, either handed to a relay-capable peer or mediated
//!   over the source peer's duplex channel
//!
//! ## Architecture
//!
//! ```text
//!  Peer A ──ws──┐                          ┌──ws── Relay peer R
//!               │   Deliver / Delivered    │   HostRelay / HostRelayDone
//!           ┌───┴──────────────────────────┴───┐
//!           │          peerhub-server          │
//!           │  registry · admission · relay    │
//!           └───────────────▲──────────────────┘
//!                           │ HTTP (register, admit, execute)
//!                        Peer B
//! ```
//!
//! Peers never learn each other's real addresses from open listings; only
//! pseudonymous locators are published.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admission;
pub mod channel;
pub mod cleanup;
pub mod config;
pub mod cost;
pub mod error;
pub mod http;
pub mod limits;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod sink;

pub use config::Config;
pub use error::{HubError, Result};
pub use server::CoordinatorState;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in Unix seconds; 0 if the clock is before 1970.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
