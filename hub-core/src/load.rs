//! Peer-hosted relay load accounting.
//!
//! Each relay-capable peer has a capacity (in whole-object units) and a
//! current load. A whole-object relay costs one unit; a byte-range relay
//! costs its share of the object, clamped below by `min_range_weight` so
//! tiny ranges still register. The weighting is a tunable heuristic.

use hub_types::ByteRange;
use serde::{Deserialize, Serialize};

/// Load weighting parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadPolicy {
    /// Smallest weight a range relay may carry.
    pub min_range_weight: f64,
}

impl Default for LoadPolicy {
    fn default() -> Self {
        Self {
            min_range_weight: 0.05,
        }
    }
}

impl LoadPolicy {
    /// Load units a relay of `range` out of `total_size` bytes adds.
    pub fn weight(&self, range: Option<ByteRange>, total_size: Option<u64>) -> f64 {
        match (range, total_size) {
            (Some(r), Some(total)) if total > 0 => {
                let share = r.len() as f64 / total as f64;
                let floor = self.min_range_weight.max(0.0).min(1.0);
                share.max(floor).min(1.0)
            }
            _ => 1.0,
        }
    }
}

/// A relay-capable peer considered for a hand-off.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayCandidate<K> {
    /// Candidate key (usually a peer id).
    pub key: K,
    /// Current load units.
    pub load: f64,
    /// Capacity in load units.
    pub capacity: f64,
}

/// Pick the least-loaded candidate that can absorb `weight` more units.
///
/// Candidates are compared by utilisation (`load / capacity`); ties go to
/// the smaller key so the choice is deterministic.
pub fn pick_least_loaded<K: Ord + Clone>(
    candidates: impl IntoIterator<Item = RelayCandidate<K>>,
    weight: f64,
) -> Option<K> {
    candidates
        .into_iter()
        .filter(|c| c.capacity > 0.0 && c.load + weight <= c.capacity + f64::EPSILON)
        .min_by(|a, b| {
            let ua = a.load / a.capacity;
            let ub = b.load / b.capacity;
            ua.total_cmp(&ub).then_with(|| a.key.cmp(&b.key))
        })
        .map(|c| c.key)
}
