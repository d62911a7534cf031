//! Cost snapshots and the fallback accrual estimate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// A raw reading from the cost provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostReading {
    /// Spend so far in the billing period.
    pub current_spend: f64,
    /// Projected spend at the end of the billing period.
    pub projected_spend: f64,
}

/// The cost signal the admission controller acts on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostSnapshot {
    /// Spend so far in the billing period.
    pub current_spend: f64,
    /// Projected spend at the end of the billing period.
    pub projected_spend: f64,
    /// Budget for the billing period.
    pub budget_limit: f64,
    /// `projected_spend / budget_limit`.
    pub ratio: f64,
    /// Unix seconds of the reading (or estimate).
    pub last_updated: u64,
    /// True when derived from the fallback estimate instead of a reading.
    pub estimated: bool,
}

impl CostSnapshot {
    /// Snapshot from a provider reading.
    pub fn from_reading(reading: CostReading, budget_limit: f64, now_unix: u64) -> Self {
        Self::build(
            reading.current_spend,
            reading.projected_spend,
            budget_limit,
            now_unix,
            false,
        )
    }

    /// Snapshot used before the first reading arrives.
    pub fn initial(budget_limit: f64, now_unix: u64) -> Self {
        Self::build(0.0, 0.0, budget_limit, now_unix, true)
    }

    fn build(current: f64, projected: f64, budget: f64, now_unix: u64, estimated: bool) -> Self {
        let current = current.max(0.0);
        let projected = projected.max(current);
        Self {
            current_spend: current,
            projected_spend: projected,
            budget_limit: budget,
            ratio: ratio(projected, budget),
            last_updated: now_unix,
            estimated,
        }
    }
}

fn ratio(projected: f64, budget: f64) -> f64 {
    if budget > 0.0 {
        projected / budget
    } else {
        // no budget means any spend is over budget
        f64::MAX
    }
}

/// Conservative linear accrual used when the provider cannot be reached.
///
/// Spend grows by `hourly_rate` per elapsed hour plus `cost_per_gib` for
/// every GiB relayed since the last snapshot. The estimate only ever
/// grows, so a flaky provider can tighten admission but never loosen it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FallbackEstimator {
    /// Assumed baseline spend per hour.
    pub hourly_rate: f64,
    /// Assumed spend per GiB relayed.
    pub cost_per_gib: f64,
}

impl FallbackEstimator {
    /// Extrapolate a new snapshot from the last one.
    pub fn estimate(
        &self,
        last: &CostSnapshot,
        elapsed: Duration,
        bytes_relayed: u64,
        now_unix: u64,
    ) -> CostSnapshot {
        let hours = elapsed.as_secs_f64() / 3600.0;
        let accrued = self.hourly_rate.max(0.0) * hours
            + self.cost_per_gib.max(0.0) * (bytes_relayed as f64 / BYTES_PER_GIB);

        CostSnapshot::build(
            last.current_spend + accrued,
            last.projected_spend + accrued,
            last.budget_limit,
            now_unix,
            true,
        )
    }
}
