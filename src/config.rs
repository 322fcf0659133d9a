//! Configuration module for the execution engine
//!
//! Configuration is loaded from TOML with environment overrides and then
//! handed to each component as an explicit struct. Nothing reads
//! configuration from global state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub fees: FeeConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub market: MarketConfig,

    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub signing: SigningConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Attempts per intent, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Bid multiplier per attempt number
    #[serde(default = "default_escalation_factor")]
    pub escalation_factor: f64,

    /// Upper bound of the attempt multiplier
    #[serde(default = "default_max_escalation")]
    pub max_escalation: f64,

    #[serde(default = "default_build_timeout_ms")]
    pub build_timeout_ms: u64,

    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,

    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,

    /// Backoff base; the delay before retry n is base * 2^n, jittered
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Widest validity slot range a bundle may carry
    #[serde(default = "default_max_validity_slots")]
    pub max_validity_slots: u64,

    /// Overall deadline per intent; none means attempts and timeouts bound it
    #[serde(default)]
    pub intent_deadline_ms: Option<u64>,

    /// Capacity of the observer event channel
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Name of the routing target the breaker guards (persistence key)
    #[serde(default = "default_breaker_target")]
    pub target: String,

    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// A failure streak older than this restarts from one
    #[serde(default = "default_failure_window_ms")]
    pub failure_window_ms: u64,

    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Bid used while no paid fee has been recorded
    #[serde(default = "default_base_fee")]
    pub base_fee: u64,

    #[serde(default = "default_fee_floor")]
    pub floor: u64,

    #[serde(default = "default_fee_ceiling")]
    pub ceiling: u64,

    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Weight of the newest sample in the moving average
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,

    /// Quiet period after which bids start to rise
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,

    /// Multiplier growth per additional idle threshold
    #[serde(default = "default_idle_boost")]
    pub idle_boost_per_threshold: f64,

    #[serde(default = "default_max_idle_multiplier")]
    pub max_idle_multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Ids per generation before a forced rotation
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,

    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,

    /// Lifetime of a generation; ids stay live between ttl and 2*ttl
    #[serde(default = "default_dedup_ttl_ms")]
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// How long a fetched volatility stays valid
    #[serde(default = "default_volatility_ttl_ms")]
    pub volatility_ttl_ms: u64,

    #[serde(default = "default_price_timeout_ms")]
    pub price_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Block engine base URL
    #[serde(default = "default_relay_url")]
    pub url: String,

    /// Submission rate limit (requests per second)
    #[serde(default = "default_rate_limit")]
    pub rate_limit_rps: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Path to a JSON keypair file
    #[serde(default = "default_keypair_path")]
    pub keypair_path: String,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Sled database directory
    #[serde(default = "default_store_path")]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

// Default value functions
fn default_max_attempts() -> u32 { 3 }
fn default_escalation_factor() -> f64 { 1.0 }
fn default_max_escalation() -> f64 { 4.0 }
fn default_build_timeout_ms() -> u64 { 2_000 }
fn default_submit_timeout_ms() -> u64 { 2_000 }
fn default_confirm_timeout_ms() -> u64 { 10_000 }
fn default_backoff_base_ms() -> u64 { 100 }
fn default_backoff_max_ms() -> u64 { 5_000 }
fn default_jitter_factor() -> f64 { 0.2 }
fn default_max_validity_slots() -> u64 { 150 }
fn default_event_capacity() -> usize { 1024 }
fn default_breaker_target() -> String { "block-engine".to_string() }
fn default_failure_threshold() -> u32 { 5 }
fn default_failure_window_ms() -> u64 { 60_000 }
fn default_cooldown_ms() -> u64 { 30_000 }
fn default_base_fee() -> u64 { 10_000 }
fn default_fee_floor() -> u64 { 1_000 }
fn default_fee_ceiling() -> u64 { 1_000_000 }
fn default_history_capacity() -> usize { 100 }
fn default_ema_alpha() -> f64 { 0.2 }
fn default_idle_threshold_ms() -> u64 { 30_000 }
fn default_idle_boost() -> f64 { 0.25 }
fn default_max_idle_multiplier() -> f64 { 2.0 }
fn default_dedup_capacity() -> usize { 100_000 }
fn default_false_positive_rate() -> f64 { 0.0001 }
fn default_dedup_ttl_ms() -> u64 { 600_000 }
fn default_volatility_ttl_ms() -> u64 { 5_000 }
fn default_price_timeout_ms() -> u64 { 1_000 }
fn default_relay_url() -> String { "https://mainnet.block-engine.jito.wtf".to_string() }
fn default_rate_limit() -> u32 { 5 }
fn default_poll_interval_ms() -> u64 { 400 }
fn default_http_timeout_ms() -> u64 { 3_000 }
fn default_keypair_path() -> String { "~/.config/solana/id.json".to_string() }
fn default_max_sessions() -> usize { 4 }
fn default_acquire_timeout_ms() -> u64 { 500 }
fn default_store_path() -> String { "./engine-state".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            escalation_factor: default_escalation_factor(),
            max_escalation: default_max_escalation(),
            build_timeout_ms: default_build_timeout_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            confirm_timeout_ms: default_confirm_timeout_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_factor: default_jitter_factor(),
            max_validity_slots: default_max_validity_slots(),
            intent_deadline_ms: None,
            event_channel_capacity: default_event_capacity(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            target: default_breaker_target(),
            failure_threshold: default_failure_threshold(),
            failure_window_ms: default_failure_window_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            base_fee: default_base_fee(),
            floor: default_fee_floor(),
            ceiling: default_fee_ceiling(),
            history_capacity: default_history_capacity(),
            ema_alpha: default_ema_alpha(),
            idle_threshold_ms: default_idle_threshold_ms(),
            idle_boost_per_threshold: default_idle_boost(),
            max_idle_multiplier: default_max_idle_multiplier(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: default_dedup_capacity(),
            false_positive_rate: default_false_positive_rate(),
            ttl_ms: default_dedup_ttl_ms(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            volatility_ttl_ms: default_volatility_ttl_ms(),
            price_timeout_ms: default_price_timeout_ms(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            rate_limit_rps: default_rate_limit(),
            poll_interval_ms: default_poll_interval_ms(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            keypair_path: default_keypair_path(),
            max_sessions: default_max_sessions(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_metrics: default_true(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl RouterConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_millis(self.build_timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn intent_deadline(&self) -> Option<Duration> {
        self.intent_deadline_ms.map(Duration::from_millis)
    }
}

/// Environment variables that override file values
pub const ENV_RELAY_URL: &str = "BUNDLE_ENGINE_RELAY_URL";
pub const ENV_STORE_PATH: &str = "BUNDLE_ENGINE_STORE_PATH";
pub const ENV_KEYPAIR_PATH: &str = "BUNDLE_ENGINE_KEYPAIR_PATH";
pub const ENV_METRICS_PORT: &str = "BUNDLE_ENGINE_METRICS_PORT";

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with `.env` and environment overrides applied
    pub fn from_file_with_env(path: &str) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_RELAY_URL) {
            self.relay.url = url;
        }
        if let Some(path) = lookup(ENV_STORE_PATH) {
            self.storage.path = path;
        }
        if let Some(path) = lookup(ENV_KEYPAIR_PATH) {
            self.signing.keypair_path = path;
        }
        if let Some(port) = lookup(ENV_METRICS_PORT) {
            self.monitoring.metrics_port = port
                .parse()
                .map_err(|_| ConfigError::invalid("monitoring.metrics_port", port))?;
        }
        Ok(())
    }

    /// Reject configurations the components cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.router;
        if r.max_attempts == 0 {
            return Err(ConfigError::invalid("router.max_attempts", "must be at least 1"));
        }
        if !(r.escalation_factor.is_finite() && r.escalation_factor > 0.0) {
            return Err(ConfigError::invalid("router.escalation_factor", "must be positive"));
        }
        if !(r.max_escalation.is_finite() && r.max_escalation >= r.escalation_factor) {
            return Err(ConfigError::invalid(
                "router.max_escalation",
                "must be finite and >= escalation_factor",
            ));
        }
        if r.confirm_timeout_ms == 0 || r.submit_timeout_ms == 0 || r.build_timeout_ms == 0 {
            return Err(ConfigError::invalid("router.*_timeout_ms", "timeouts must be non-zero"));
        }
        if r.backoff_max_ms < r.backoff_base_ms {
            return Err(ConfigError::invalid("router.backoff_max_ms", "must be >= backoff_base_ms"));
        }
        if !(0.0..=1.0).contains(&r.jitter_factor) {
            return Err(ConfigError::invalid("router.jitter_factor", "must be within [0, 1]"));
        }
        if r.max_validity_slots == 0 {
            return Err(ConfigError::invalid("router.max_validity_slots", "must be non-zero"));
        }
        if r.event_channel_capacity == 0 {
            return Err(ConfigError::invalid("router.event_channel_capacity", "must be non-zero"));
        }

        let b = &self.breaker;
        if b.failure_threshold == 0 {
            return Err(ConfigError::invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if b.target.is_empty() {
            return Err(ConfigError::invalid("breaker.target", "must not be empty"));
        }

        let f = &self.fees;
        if f.floor > f.ceiling {
            return Err(ConfigError::invalid(
                "fees.floor",
                format!("floor {} exceeds ceiling {}", f.floor, f.ceiling),
            ));
        }
        if f.history_capacity == 0 {
            return Err(ConfigError::invalid("fees.history_capacity", "must be non-zero"));
        }
        if !(f.ema_alpha > 0.0 && f.ema_alpha <= 1.0) {
            return Err(ConfigError::invalid("fees.ema_alpha", "must be within (0, 1]"));
        }
        if f.idle_threshold_ms == 0 {
            return Err(ConfigError::invalid("fees.idle_threshold_ms", "must be non-zero"));
        }
        if !(f.max_idle_multiplier.is_finite() && f.max_idle_multiplier >= 1.0) {
            return Err(ConfigError::invalid("fees.max_idle_multiplier", "must be >= 1.0"));
        }
        if !(f.idle_boost_per_threshold.is_finite() && f.idle_boost_per_threshold >= 0.0) {
            return Err(ConfigError::invalid("fees.idle_boost_per_threshold", "must be >= 0"));
        }

        let d = &self.dedup;
        if d.capacity == 0 {
            return Err(ConfigError::invalid("dedup.capacity", "must be non-zero"));
        }
        if !(d.false_positive_rate > 0.0 && d.false_positive_rate < 1.0) {
            return Err(ConfigError::invalid("dedup.false_positive_rate", "must be within (0, 1)"));
        }
        if d.ttl_ms == 0 {
            return Err(ConfigError::invalid("dedup.ttl_ms", "must be non-zero"));
        }

        if self.relay.rate_limit_rps == 0 {
            return Err(ConfigError::invalid("relay.rate_limit_rps", "must be non-zero"));
        }
        if self.signing.max_sessions == 0 {
            return Err(ConfigError::invalid("signing.max_sessions", "must be non-zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.router.max_attempts, 3);
        assert_eq!(config.fees.ema_alpha, 0.2);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = Config::from_toml_str(
            r#"
            [router]
            max_attempts = 5

            [breaker]
            failure_threshold = 7
            "#,
        )
        .unwrap();

        assert_eq!(config.router.max_attempts, 5);
        assert_eq!(config.router.confirm_timeout_ms, 10_000);
        assert_eq!(config.breaker.failure_threshold, 7);
        assert_eq!(config.fees.ceiling, 1_000_000);
    }

    #[test]
    fn test_invalid_fee_bounds_rejected() {
        let err = Config::from_toml_str(
            r#"
            [fees]
            floor = 10
            ceiling = 5
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "fees.floor", .. }));
    }

    #[test]
    fn test_invalid_fp_rate_rejected() {
        let mut config = Config::default();
        config.dedup.false_positive_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(|key| match key {
                ENV_RELAY_URL => Some("http://localhost:8899".to_string()),
                ENV_METRICS_PORT => Some("9191".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.relay.url, "http://localhost:8899");
        assert_eq!(config.monitoring.metrics_port, 9191);

        let bad = config.apply_env_overrides(|key| {
            (key == ENV_METRICS_PORT).then(|| "not-a-port".to_string())
        });
        assert!(bad.is_err());
    }
}
