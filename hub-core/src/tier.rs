//! Service tiers.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Invalid policy configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    /// No tiers configured.
    #[error("tier catalogue is empty")]
    NoTiers,

    /// Two tiers share a name.
    #[error("duplicate tier name: {0}")]
    DuplicateTier(String),

    /// More than one tier holds the highest priority rank.
    #[error("ambiguous top tier: {0} and {1} share the highest priority rank")]
    AmbiguousTopTier(String, String),

    /// Thresholds are not strictly increasing within (0, ∞).
    #[error("admission thresholds must be positive and strictly increasing")]
    ThresholdOrder,

    /// A numeric policy parameter is out of range.
    #[error("invalid policy value for {field}: {reason}")]
    InvalidValue {
        /// Offending field.
        field: &'static str,
        /// Why it is invalid.
        reason: String,
    },
}

/// A named service class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Tier name, e.g. `"free"` or `"premium"`.
    pub name: String,
    /// Higher rank wins scarce capacity.
    pub priority_rank: u8,
    /// Default bandwidth ceiling in KiB/s.
    pub max_bandwidth: u64,
    /// Concurrent relay sessions allowed across all peers of this tier.
    pub max_concurrent_sessions: usize,
    /// Relative cost weight when attributing relay spend.
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    /// Maximum session lifetime in seconds.
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
}

fn default_cost_weight() -> f64 {
    1.0
}

fn default_max_duration_secs() -> u64 {
    3600
}

impl Tier {
    /// Maximum session lifetime.
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

/// The validated set of tiers, ordered by descending priority.
#[derive(Debug, Clone, PartialEq)]
pub struct TierCatalog {
    tiers: Vec<Tier>,
}

impl TierCatalog {
    /// Build a catalogue, checking for unique names and a unique top tier.
    pub fn new(mut tiers: Vec<Tier>) -> Result<Self, PolicyError> {
        if tiers.is_empty() {
            return Err(PolicyError::NoTiers);
        }

        let mut seen = HashSet::new();
        for tier in &tiers {
            if !seen.insert(tier.name.as_str()) {
                return Err(PolicyError::DuplicateTier(tier.name.clone()));
            }
            if tier.max_bandwidth == 0 {
                return Err(PolicyError::InvalidValue {
                    field: "max_bandwidth",
                    reason: format!("tier {} has zero bandwidth", tier.name),
                });
            }
        }

        tiers.sort_by(|a, b| b.priority_rank.cmp(&a.priority_rank));
        if tiers.len() > 1 && tiers[0].priority_rank == tiers[1].priority_rank {
            return Err(PolicyError::AmbiguousTopTier(
                tiers[0].name.clone(),
                tiers[1].name.clone(),
            ));
        }

        Ok(Self { tiers })
    }

    /// The default four-tier catalogue: free, basic, standard, premium.
    pub fn standard() -> Self {
        let tier = |name: &str, rank, bw, sessions, weight, secs| Tier {
            name: name.to_string(),
            priority_rank: rank,
            max_bandwidth: bw,
            max_concurrent_sessions: sessions,
            cost_weight: weight,
            max_duration_secs: secs,
        };
        Self {
            tiers: vec![
                tier("premium", 3, 4096, 500, 0.4, 7200),
                tier("standard", 2, 1024, 200, 0.6, 3600),
                tier("basic", 1, 256, 100, 0.8, 1800),
                tier("free", 0, 64, 50, 1.0, 600),
            ],
        }
    }

    /// Look up a tier by name.
    pub fn get(&self, name: &str) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    /// The highest-priority tier.
    pub fn top(&self) -> &Tier {
        // non-empty by construction
        &self.tiers[0]
    }

    /// Whether `name` is the top tier.
    pub fn is_top(&self, name: &str) -> bool {
        self.top().name == name
    }

    /// All tiers, highest priority first.
    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter()
    }
}

impl Default for TierCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(name: &str, rank: u8) -> Tier {
        Tier {
            name: name.into(),
            priority_rank: rank,
            max_bandwidth: 100,
            max_concurrent_sessions: 10,
            cost_weight: 1.0,
            max_duration_secs: 60,
        }
    }

    #[test]
    fn standard_catalogue_has_premium_on_top() {
        let catalog = TierCatalog::standard();
        assert_eq!(catalog.top().name, "premium");
        assert!(catalog.is_top("premium"));
        assert!(!catalog.is_top("free"));
        assert_eq!(catalog.iter().count(), 4);
    }

    #[test]
    fn catalogue_sorts_by_rank() {
        let catalog = TierCatalog::new(vec![tier("low", 0), tier("high", 9)]).unwrap();
        assert_eq!(catalog.top().name, "high");
    }

    #[test]
    fn empty_catalogue_rejected() {
        assert_eq!(TierCatalog::new(vec![]), Err(PolicyError::NoTiers));
    }

    #[test]
    fn duplicate_names_rejected() {
        let result = TierCatalog::new(vec![tier("a", 1), tier("a", 2)]);
        assert_eq!(result, Err(PolicyError::DuplicateTier("a".into())));
    }

    #[test]
    fn shared_top_rank_rejected() {
        let result = TierCatalog::new(vec![tier("a", 5), tier("b", 5), tier("c", 1)]);
        assert!(matches!(result, Err(PolicyError::AmbiguousTopTier(_, _))));
    }

    #[test]
    fn tier_deserializes_with_defaults() {
        let json = r#"{"name":"free","priority_rank":0,"max_bandwidth":64,"max_concurrent_sessions":5}"#;
        let t: Tier = serde_json::from_str(json).unwrap();
        assert_eq!(t.cost_weight, 1.0);
        assert_eq!(t.max_duration(), Duration::from_secs(3600));
    }
}
