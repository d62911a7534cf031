//! # hub-core
//!
//! Pure policy logic for peerhub (no I/O, instant tests).
//!
//! This crate holds the decisions the coordinator makes on every relay
//! call, without any locks, clocks, or network access:
//! - [`AdmissionMode`] and its cost-ratio transitions (with hysteresis)
//! - [`decide`], the per-mode admission rule table
//! - [`TierCatalog`] of service tiers
//! - [`CostSnapshot`] arithmetic and the linear [`FallbackEstimator`]
//! - [`LoadPolicy`] for peer-hosted relay load weighting
//! - [`ReconnectPolicy`], the single retry rule peers follow
//!
//! The coordinator crate supplies current state (session counts, cost
//! readings) through plain values and the [`LoadView`] trait, then acts on
//! the returned decisions.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod admission;
pub mod cost;
pub mod load;
pub mod mode;
pub mod reconnect;
pub mod tier;

pub use admission::{
    decide, ActiveSessionInfo, AdmissionPolicy, AdmissionRequest, Decision, Grant, LoadView,
    Priority, RejectReason, Rejection, RetryAfter,
};
pub use cost::{CostReading, CostSnapshot, FallbackEstimator};
pub use load::{pick_least_loaded, LoadPolicy, RelayCandidate};
pub use mode::{AdmissionMode, ModeTransition, Termination, Thresholds};
pub use reconnect::{FailureClass, ReconnectPolicy};
pub use tier::{PolicyError, Tier, TierCatalog};
