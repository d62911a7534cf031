//! Admission modes and cost-ratio transitions.
//!
//! Modes are ordered by severity. The raw mode for a ratio is the highest
//! mode whose threshold the ratio reaches. Leaving Emergency or Shutdown
//! for anything milder than Emergency additionally requires the ratio to
//! fall below the Warning threshold, so the coordinator does not flap
//! around the Emergency boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::PolicyError;

/// Operating mode of the admission controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Cost well within budget.
    Normal,
    /// Cost approaching budget; direct connections preferred.
    Warning,
    /// Only the top tier is served.
    Throttle,
    /// Only continuing top-tier sessions are served.
    Emergency,
    /// Nothing but health checks.
    Shutdown,
}

impl AdmissionMode {
    /// All modes, mildest first.
    pub const ALL: [AdmissionMode; 5] = [
        Self::Normal,
        Self::Warning,
        Self::Throttle,
        Self::Emergency,
        Self::Shutdown,
    ];

    /// Lowercase name, as used in logs and responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Throttle => "throttle",
            Self::Emergency => "emergency",
            Self::Shutdown => "shutdown",
        }
    }

    /// Compute the next mode for a freshly observed cost ratio.
    pub fn next(self, ratio: f64, thresholds: &Thresholds) -> AdmissionMode {
        let raw = thresholds.raw_mode(ratio);
        if self >= Self::Emergency && raw < Self::Emergency && ratio >= thresholds.warning {
            Self::Emergency
        } else {
            raw
        }
    }
}

impl fmt::Display for AdmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cost-ratio thresholds at which each mode begins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Ratio entering Warning.
    #[serde(default = "default_warning")]
    pub warning: f64,
    /// Ratio entering Throttle.
    #[serde(default = "default_throttle")]
    pub throttle: f64,
    /// Ratio entering Emergency.
    #[serde(default = "default_emergency")]
    pub emergency: f64,
    /// Ratio entering Shutdown.
    #[serde(default = "default_shutdown")]
    pub shutdown: f64,
}

fn default_warning() -> f64 {
    0.70
}

fn default_throttle() -> f64 {
    0.85
}

fn default_emergency() -> f64 {
    0.95
}

fn default_shutdown() -> f64 {
    0.98
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            warning: default_warning(),
            throttle: default_throttle(),
            emergency: default_emergency(),
            shutdown: default_shutdown(),
        }
    }
}

impl Thresholds {
    /// Check the thresholds are positive and strictly increasing.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let ordered = self.warning > 0.0
            && self.warning < self.throttle
            && self.throttle < self.emergency
            && self.emergency < self.shutdown;
        if ordered {
            Ok(())
        } else {
            Err(PolicyError::ThresholdOrder)
        }
    }

    /// Mode for a ratio, ignoring history.
    pub fn raw_mode(&self, ratio: f64) -> AdmissionMode {
        if ratio.is_nan() {
            // An unusable ratio is treated as the worst case.
            AdmissionMode::Shutdown
        } else if ratio >= self.shutdown {
            AdmissionMode::Shutdown
        } else if ratio >= self.emergency {
            AdmissionMode::Emergency
        } else if ratio >= self.throttle {
            AdmissionMode::Throttle
        } else if ratio >= self.warning {
            AdmissionMode::Warning
        } else {
            AdmissionMode::Normal
        }
    }
}

/// Sessions that must be force-terminated on a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Nothing to terminate.
    None,
    /// Every session outside the top tier.
    NonTopTier,
    /// Every session.
    All,
}

/// A change of admission mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeTransition {
    /// Mode before.
    pub from: AdmissionMode,
    /// Mode after.
    pub to: AdmissionMode,
}

impl ModeTransition {
    /// Build a transition, or `None` if the mode did not change.
    pub fn between(from: AdmissionMode, to: AdmissionMode) -> Option<Self> {
        (from != to).then_some(Self { from, to })
    }

    /// Whether the transition moves to a stricter mode.
    pub fn is_escalation(&self) -> bool {
        self.to > self.from
    }

    /// Sessions to terminate as a side effect of this transition.
    pub fn termination(&self) -> Termination {
        match (self.from, self.to) {
            (from, AdmissionMode::Shutdown) if from != AdmissionMode::Shutdown => Termination::All,
            (from, AdmissionMode::Emergency) if from < AdmissionMode::Emergency => {
                Termination::NonTopTier
            }
            _ => Termination::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_mode_follows_thresholds() {
        let t = Thresholds::default();
        assert_eq!(t.raw_mode(0.0), AdmissionMode::Normal);
        assert_eq!(t.raw_mode(0.69), AdmissionMode::Normal);
        assert_eq!(t.raw_mode(0.70), AdmissionMode::Warning);
        assert_eq!(t.raw_mode(0.85), AdmissionMode::Throttle);
        assert_eq!(t.raw_mode(0.96), AdmissionMode::Emergency);
        assert_eq!(t.raw_mode(0.98), AdmissionMode::Shutdown);
        assert_eq!(t.raw_mode(3.0), AdmissionMode::Shutdown);
        assert_eq!(t.raw_mode(f64::NAN), AdmissionMode::Shutdown);
    }

    #[test]
    fn escalation_is_immediate() {
        let t = Thresholds::default();
        assert_eq!(AdmissionMode::Normal.next(0.99, &t), AdmissionMode::Shutdown);
        assert_eq!(AdmissionMode::Warning.next(0.90, &t), AdmissionMode::Throttle);
    }

    #[test]
    fn emergency_holds_until_below_warning() {
        let t = Thresholds::default();
        let mode = AdmissionMode::Emergency;
        assert_eq!(mode.next(0.90, &t), AdmissionMode::Emergency);
        assert_eq!(mode.next(0.75, &t), AdmissionMode::Emergency);
        assert_eq!(mode.next(0.70, &t), AdmissionMode::Emergency);
        assert_eq!(mode.next(0.69, &t), AdmissionMode::Normal);
    }

    #[test]
    fn shutdown_steps_down_through_emergency_hold() {
        let t = Thresholds::default();
        assert_eq!(AdmissionMode::Shutdown.next(0.96, &t), AdmissionMode::Emergency);
        assert_eq!(AdmissionMode::Shutdown.next(0.80, &t), AdmissionMode::Emergency);
        assert_eq!(AdmissionMode::Shutdown.next(0.10, &t), AdmissionMode::Normal);
    }

    #[test]
    fn throttle_has_no_hysteresis() {
        let t = Thresholds::default();
        assert_eq!(AdmissionMode::Throttle.next(0.80, &t), AdmissionMode::Warning);
    }

    #[test]
    fn thresholds_validation() {
        assert!(Thresholds::default().validate().is_ok());
        let bad = Thresholds {
            warning: 0.9,
            throttle: 0.8,
            ..Thresholds::default()
        };
        assert_eq!(bad.validate(), Err(PolicyError::ThresholdOrder));
    }

    #[test]
    fn termination_side_effects() {
        use AdmissionMode::*;
        let t = |a, b| ModeTransition::between(a, b).unwrap().termination();
        assert_eq!(t(Normal, Emergency), Termination::NonTopTier);
        assert_eq!(t(Throttle, Emergency), Termination::NonTopTier);
        assert_eq!(t(Emergency, Shutdown), Termination::All);
        assert_eq!(t(Normal, Shutdown), Termination::All);
        assert_eq!(t(Shutdown, Emergency), Termination::None);
        assert_eq!(t(Normal, Warning), Termination::None);
        assert_eq!(t(Emergency, Normal), Termination::None);
        assert!(ModeTransition::between(Normal, Normal).is_none());
    }

    #[test]
    fn modes_are_ordered_by_severity() {
        let mut sorted = AdmissionMode::ALL;
        sorted.sort();
        assert_eq!(sorted, AdmissionMode::ALL);
    }

    #[test]
    fn mode_serializes_lowercase() {
        let json = serde_json::to_string(&AdmissionMode::Emergency).unwrap();
        assert_eq!(json, "\"emergency\"");
    }
}
