//! tidepool.toml configuration parser.
//!
//! Every section has defaults, so a minimal file only lists `[[endpoints]]`.
//! Durations are written as human strings ("500ms", "30s", "5m").

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::serde_str;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TidepoolConfig {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub balancer: BalancerConfig,
    pub health: HealthConfig,
    pub monitor: MonitorConfig,
    pub sizer: SizerConfig,
    pub driver: DriverConfig,
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the `/health` and `/metrics` endpoints.
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9187".to_string(),
        }
    }
}

/// Sizing, timeout, and resize-policy knobs for every pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    /// Starting target size; defaults to `max_size`.
    pub initial_size: Option<usize>,
    #[serde(with = "serde_str")]
    pub acquire_timeout: Duration,
    #[serde(with = "serde_str")]
    pub idle_timeout: Duration,
    #[serde(with = "serde_str")]
    pub max_connection_lifetime: Duration,
    pub grow_threshold: f64,
    pub shrink_threshold: f64,
    pub grow_step: usize,
    pub shrink_step: usize,
    /// Minimum time between two resize decisions for the same pool.
    #[serde(with = "serde_str")]
    pub adjustment_interval: Duration,
    /// Average acquire latency that must be exceeded before growing.
    #[serde(with = "serde_str")]
    pub acquire_latency_threshold: Duration,
    /// Consecutive sizer ticks a condition must hold before acting.
    pub sustain_windows: u32,
    /// Concurrent connection attempts allowed per pool.
    pub max_concurrent_creates: usize,
    /// Fail with `PoolExhausted` instead of queueing.
    pub zero_wait: bool,
    /// Consecutive creation failures that mark the pool degraded.
    pub degraded_after_failures: u32,
    #[serde(with = "serde_str")]
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            initial_size: None,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_connection_lifetime: Duration::from_secs(1800),
            grow_threshold: 0.8,
            shrink_threshold: 0.3,
            grow_step: 2,
            shrink_step: 1,
            adjustment_interval: Duration::from_secs(60),
            acquire_latency_threshold: Duration::from_millis(100),
            sustain_windows: 3,
            max_concurrent_creates: 2,
            zero_wait: false,
            degraded_after_failures: 3,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Clamp a requested target into `[min_size, max_size]`.
    pub fn clamp_target(&self, target: usize) -> usize {
        target.clamp(self.min_size, self.max_size)
    }

    pub fn initial_target(&self) -> usize {
        self.clamp_target(self.initial_size.unwrap_or(self.max_size))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Total size budget in bytes.
    pub max_size: usize,
    #[serde(with = "serde_str")]
    pub default_ttl: Duration,
    /// Values larger than this are never cached.
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 64 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            max_entry_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    Weighted,
}

impl std::fmt::Display for BalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalanceStrategy::RoundRobin => write!(f, "round_robin"),
            BalanceStrategy::LeastConnections => write!(f, "least_connections"),
            BalanceStrategy::Weighted => write!(f, "weighted"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerConfig {
    pub strategy: BalanceStrategy,
    /// Query latency at or under which a success raises a pool's weight.
    #[serde(with = "serde_str")]
    pub latency_target: Duration,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: BalanceStrategy::default(),
            latency_target: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    /// Idle connections validated per pool per tick.
    pub validation_batch: usize,
    /// Failure ratio within `window` that marks a pool unhealthy.
    pub failure_ratio: f64,
    /// Validations required in the window before the ratio is judged.
    pub min_validations: usize,
    #[serde(with = "serde_str")]
    pub window: Duration,
    /// Consecutive successful probes that re-admit a pool.
    pub recovery_successes: u32,
    #[serde(with = "serde_str")]
    pub ping_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            validation_batch: 3,
            failure_ratio: 0.5,
            min_validations: 3,
            window: Duration::from_secs(300),
            recovery_successes: 3,
            ping_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Samples retained per pool.
    pub window_size: usize,
    pub utilization_alert: f64,
    pub acquire_latency_alert_ms: f64,
    pub queue_length_alert: usize,
    pub error_rate_alert: f64,
    #[serde(with = "serde_str")]
    pub alert_cooldown: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 1000,
            utilization_alert: 0.9,
            acquire_latency_alert_ms: 1000.0,
            queue_length_alert: 10,
            error_rate_alert: 0.05,
            alert_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SizerConfig {
    #[serde(with = "serde_str")]
    pub interval: Duration,
}

impl Default for SizerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    #[serde(with = "serde_str")]
    pub connect_timeout: Duration,
    /// Statement sent by `ping()`.
    pub validation_query: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            validation_query: "SELECT 1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub id: String,
    /// `host:port` of the database or its gateway.
    pub address: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl TidepoolConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: TidepoolConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool = &self.pool;
        if pool.max_size == 0 {
            return Err(ConfigError::Invalid("pool.max_size must be > 0".into()));
        }
        if pool.min_size > pool.max_size {
            return Err(ConfigError::Invalid(format!(
                "pool.min_size ({}) exceeds pool.max_size ({})",
                pool.min_size, pool.max_size
            )));
        }
        for (name, v) in [
            ("pool.grow_threshold", pool.grow_threshold),
            ("pool.shrink_threshold", pool.shrink_threshold),
            ("health.failure_ratio", self.health.failure_ratio),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1]")));
            }
        }
        if pool.shrink_threshold >= pool.grow_threshold {
            return Err(ConfigError::Invalid(
                "pool.shrink_threshold must be below pool.grow_threshold".into(),
            ));
        }
        if pool.max_concurrent_creates == 0 {
            return Err(ConfigError::Invalid(
                "pool.max_concurrent_creates must be > 0".into(),
            ));
        }
        if self.endpoints.is_empty() {
            return Err(ConfigError::Invalid("at least one [[endpoints]] entry is required".into()));
        }
        let mut seen = HashSet::new();
        for ep in &self.endpoints {
            if !seen.insert(ep.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate endpoint id {:?}", ep.id)));
            }
            if ep.weight <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "endpoint {:?} weight must be positive",
                    ep.id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[[endpoints]]
id = "primary"
address = "127.0.0.1:7400"
"#;

    #[test]
    fn parse_minimal_uses_defaults() {
        let config = TidepoolConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].weight, 1.0);
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.balancer.strategy, BalanceStrategy::RoundRobin);
        assert_eq!(config.server.listen, "127.0.0.1:9187");
    }

    #[test]
    fn parse_full_sections() {
        let toml_str = r#"
[pool]
min_size = 1
max_size = 4
acquire_timeout = "250ms"
adjustment_interval = "2m"

[cache]
max_size = 1024
default_ttl = "10s"

[balancer]
strategy = "least_connections"

[[endpoints]]
id = "a"
address = "10.0.0.1:7400"
weight = 2.0

[[endpoints]]
id = "b"
address = "10.0.0.2:7400"
"#;
        let config = TidepoolConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.acquire_timeout, Duration::from_millis(250));
        assert_eq!(config.pool.adjustment_interval, Duration::from_secs(120));
        assert_eq!(config.cache.default_ttl, Duration::from_secs(10));
        assert_eq!(config.balancer.strategy, BalanceStrategy::LeastConnections);
        assert_eq!(config.endpoints[0].weight, 2.0);
    }

    #[test]
    fn rejects_min_above_max() {
        let toml_str = format!("[pool]\nmin_size = 5\nmax_size = 2\n{MINIMAL}");
        let err = TidepoolConfig::from_toml(&toml_str).unwrap_err();
        assert!(err.to_string().contains("min_size"));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let toml_str = format!("[pool]\ngrow_threshold = 0.2\nshrink_threshold = 0.5\n{MINIMAL}");
        assert!(TidepoolConfig::from_toml(&toml_str).is_err());
    }

    #[test]
    fn rejects_duplicate_endpoint_ids() {
        let toml_str = format!("{MINIMAL}{MINIMAL}");
        let err = TidepoolConfig::from_toml(&toml_str).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn rejects_missing_endpoints() {
        assert!(TidepoolConfig::from_toml("").is_err());
    }

    #[test]
    fn rejects_bad_duration() {
        let toml_str = format!("[pool]\nacquire_timeout = \"soon\"\n{MINIMAL}");
        assert!(matches!(
            TidepoolConfig::from_toml(&toml_str),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn initial_target_defaults_to_max_and_clamps() {
        let mut pool = PoolConfig {
            min_size: 2,
            max_size: 5,
            ..PoolConfig::default()
        };
        assert_eq!(pool.initial_target(), 5);
        pool.initial_size = Some(1);
        assert_eq!(pool.initial_target(), 2);
        pool.initial_size = Some(9);
        assert_eq!(pool.initial_target(), 5);
    }

    #[test]
    fn toml_round_trip_keeps_durations() {
        let config = TidepoolConfig::from_toml(MINIMAL).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("acquire_timeout = \"5s\""));
        let again = TidepoolConfig::from_toml(&rendered).unwrap();
        assert_eq!(again.pool, config.pool);
    }
}
