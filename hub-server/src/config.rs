//! Configuration loading for peerhub-server.
//!
//! Configuration is loaded from a TOML file (default: `hub.toml`).
//! Every section and field has a default, so an empty file is valid.

use hub_core::{
    AdmissionPolicy, FallbackEstimator, LoadPolicy, PolicyError, RetryAfter, Thresholds, Tier,
    TierCatalog,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for peerhub-server.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Peer registry configuration.
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Cost-driven admission configuration.
    #[serde(default)]
    pub admission: AdmissionConfig,
    /// Service tiers.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<Tier>,
    /// Relay session tracking configuration.
    #[serde(default)]
    pub sessions: SessionsConfig,
    /// Relay execution configuration.
    #[serde(default)]
    pub relay: RelayConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Cost provider configuration.
    #[serde(default)]
    pub cost: CostConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Maximum request body size in bytes (default: 1MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Peer registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Seconds of silence after which a peer expires (default: 600).
    #[serde(default = "default_peer_ttl")]
    pub peer_ttl_secs: u64,
    /// Interval between background sweeps in seconds (default: 120).
    #[serde(default = "default_registry_sweep")]
    pub sweep_interval_secs: u64,
    /// Maximum number of registered peers (default: 100000).
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Bearer token for private address resolution. Disabled when unset.
    pub resolver_token: Option<String>,
}

/// Cost-driven admission configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Cost-ratio thresholds for each mode.
    #[serde(default)]
    pub thresholds: Thresholds,
    /// Retry-after hints per mode.
    #[serde(default)]
    pub retry_after: RetryAfter,
    /// Seconds between cost refreshes (default: 300).
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Budget for the billing period (default: 1000.0).
    #[serde(default = "default_budget_limit")]
    pub budget_limit: f64,
    /// Fallback spend accrual per hour when the provider fails (default: 2.0).
    #[serde(default = "default_fallback_hourly_rate")]
    pub fallback_hourly_rate: f64,
    /// Fallback spend per GiB relayed (default: 0.09).
    #[serde(default = "default_cost_per_gib")]
    pub cost_per_gib: f64,
    /// Fraction of tier bandwidth granted in Warning mode (default: 0.5).
    #[serde(default = "default_warning_factor")]
    pub warning_bandwidth_factor: f64,
    /// Bandwidth ceiling in Throttle mode, KiB/s (default: 512).
    #[serde(default = "default_throttle_ceiling")]
    pub throttle_bandwidth_ceiling: u64,
    /// Concurrent top-tier sessions allowed in Throttle mode (default: 100).
    #[serde(default = "default_throttle_max_top")]
    pub throttle_max_top_sessions: usize,
    /// Bandwidth ceiling in Emergency mode, KiB/s (default: 5).
    #[serde(default = "default_emergency_ceiling")]
    pub emergency_bandwidth_ceiling: u64,
    /// Session duration cap in Emergency mode, seconds (default: 300).
    #[serde(default = "default_emergency_duration")]
    pub emergency_max_duration_secs: u64,
}

/// Relay session tracking configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    /// Seconds between session sweeps (default: 60).
    #[serde(default = "default_session_sweep")]
    pub sweep_interval_secs: u64,
}

/// Relay execution configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Timeout for whole-object mediated relays, seconds (default: 30).
    #[serde(default = "default_object_timeout")]
    pub object_timeout_secs: u64,
    /// Timeout for small-range mediated relays, seconds (default: 10).
    #[serde(default = "default_range_timeout")]
    pub range_timeout_secs: u64,
    /// Ranges up to this many bytes use the short timeout (default: 1MiB).
    #[serde(default = "default_small_range")]
    pub small_range_bytes: u64,
    /// Seconds before an unacknowledged hosted relay releases its load (default: 120).
    #[serde(default = "default_hosted_grace")]
    pub hosted_grace_secs: u64,
    /// Capacity assumed for relay-capable peers that do not declare one (default: 8).
    #[serde(default = "default_relay_capacity")]
    pub default_relay_capacity: u32,
    /// Smallest load weight of a byte-range relay (default: 0.05).
    #[serde(default = "default_min_range_weight")]
    pub min_range_weight: f64,
    /// Largest payload accepted from a source peer, bytes (default: 64MiB).
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
    /// Payloads up to this size are checked for disguised error bodies (default: 4096).
    #[serde(default = "default_error_sniff")]
    pub error_sniff_bytes: usize,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Requests per peer per minute across register/heartbeat/relay (default: 600).
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Requests per second across all peers (default: 2000).
    #[serde(default = "default_global_rps")]
    pub global_requests_per_second: u32,
}

/// Cost provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CostConfig {
    /// URL returning `{"current_spend": f64, "projected_spend": f64}`.
    /// When unset, a static provider pinned at zero spend is used.
    pub provider_url: Option<String>,
    /// HTTP timeout for the provider, seconds (default: 10).
    #[serde(default = "default_cost_timeout")]
    pub timeout_secs: u64,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024 // 1MB
}

fn default_peer_ttl() -> u64 {
    600 // 10 minutes
}

fn default_registry_sweep() -> u64 {
    120 // TTL / 5
}

fn default_max_peers() -> usize {
    100_000
}

fn default_refresh_interval() -> u64 {
    300 // 5 minutes
}

fn default_budget_limit() -> f64 {
    1000.0
}

fn default_fallback_hourly_rate() -> f64 {
    2.0
}

fn default_cost_per_gib() -> f64 {
    0.09
}

fn default_warning_factor() -> f64 {
    0.5
}

fn default_throttle_ceiling() -> u64 {
    512
}

fn default_throttle_max_top() -> usize {
    100
}

fn default_emergency_ceiling() -> u64 {
    5
}

fn default_emergency_duration() -> u64 {
    300
}

fn default_session_sweep() -> u64 {
    60
}

fn default_object_timeout() -> u64 {
    30
}

fn default_range_timeout() -> u64 {
    10
}

fn default_small_range() -> u64 {
    1024 * 1024 // 1MiB
}

fn default_hosted_grace() -> u64 {
    120
}

fn default_relay_capacity() -> u32 {
    8
}

fn default_min_range_weight() -> f64 {
    0.05
}

fn default_max_payload() -> usize {
    64 * 1024 * 1024 // 64MiB
}

fn default_error_sniff() -> usize {
    4096
}

fn default_requests_per_minute() -> u32 {
    600
}

fn default_global_rps() -> u32 {
    2000
}

fn default_cost_timeout() -> u64 {
    10
}

fn default_tiers() -> Vec<Tier> {
    TierCatalog::standard().iter().cloned().collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            admission: AdmissionConfig::default(),
            tiers: default_tiers(),
            sessions: SessionsConfig::default(),
            relay: RelayConfig::default(),
            limits: LimitsConfig::default(),
            cost: CostConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            peer_ttl_secs: default_peer_ttl(),
            sweep_interval_secs: default_registry_sweep(),
            max_peers: default_max_peers(),
            resolver_token: None,
        }
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            retry_after: RetryAfter::default(),
            refresh_interval_secs: default_refresh_interval(),
            budget_limit: default_budget_limit(),
            fallback_hourly_rate: default_fallback_hourly_rate(),
            cost_per_gib: default_cost_per_gib(),
            warning_bandwidth_factor: default_warning_factor(),
            throttle_bandwidth_ceiling: default_throttle_ceiling(),
            throttle_max_top_sessions: default_throttle_max_top(),
            emergency_bandwidth_ceiling: default_emergency_ceiling(),
            emergency_max_duration_secs: default_emergency_duration(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_session_sweep(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            object_timeout_secs: default_object_timeout(),
            range_timeout_secs: default_range_timeout(),
            small_range_bytes: default_small_range(),
            hosted_grace_secs: default_hosted_grace(),
            default_relay_capacity: default_relay_capacity(),
            min_range_weight: default_min_range_weight(),
            max_payload_bytes: default_max_payload(),
            error_sniff_bytes: default_error_sniff(),
        }
    }
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            provider_url: None,
            timeout_secs: default_cost_timeout(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            global_requests_per_second: default_global_rps(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.admission.thresholds.validate()?;
        self.admission.policy().validate()?;
        self.tier_catalog()?;

        let nonzero = [
            ("registry.peer_ttl_secs", self.registry.peer_ttl_secs),
            ("registry.sweep_interval_secs", self.registry.sweep_interval_secs),
            ("admission.refresh_interval_secs", self.admission.refresh_interval_secs),
            ("sessions.sweep_interval_secs", self.sessions.sweep_interval_secs),
            ("relay.object_timeout_secs", self.relay.object_timeout_secs),
            ("relay.range_timeout_secs", self.relay.range_timeout_secs),
            ("limits.requests_per_minute", u64::from(self.limits.requests_per_minute)),
            (
                "limits.global_requests_per_second",
                u64::from(self.limits.global_requests_per_second),
            ),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{field} must be > 0")));
            }
        }

        if !(self.admission.budget_limit > 0.0) {
            return Err(ConfigError::Invalid(
                "admission.budget_limit must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.relay.min_range_weight) {
            return Err(ConfigError::Invalid(
                "relay.min_range_weight must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }

    /// Validated tier catalogue.
    pub fn tier_catalog(&self) -> Result<TierCatalog, ConfigError> {
        Ok(TierCatalog::new(self.tiers.clone())?)
    }

    /// Peer time-to-live.
    pub fn peer_ttl(&self) -> Duration {
        Duration::from_secs(self.registry.peer_ttl_secs)
    }
}

impl AdmissionConfig {
    /// Mode-specific limits for the rule table.
    pub fn policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            warning_bandwidth_factor: self.warning_bandwidth_factor,
            throttle_bandwidth_ceiling: self.throttle_bandwidth_ceiling,
            throttle_max_top_sessions: self.throttle_max_top_sessions,
            emergency_bandwidth_ceiling: self.emergency_bandwidth_ceiling,
            emergency_max_duration_secs: self.emergency_max_duration_secs,
            retry_after: self.retry_after,
        }
    }

    /// Fallback estimator parameters.
    pub fn fallback(&self) -> FallbackEstimator {
        FallbackEstimator {
            hourly_rate: self.fallback_hourly_rate,
            cost_per_gib: self.cost_per_gib,
        }
    }
}

impl RelayConfig {
    /// Load weighting for peer-hosted relays.
    pub fn load_policy(&self) -> LoadPolicy {
        LoadPolicy {
            min_range_weight: self.min_range_weight,
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// Admission policy or tier catalogue is inconsistent.
    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),
    /// Any other invalid value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
