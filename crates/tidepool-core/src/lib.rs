//! tidepool-core — shared types and configuration for Tidepool crates.
//!
//! Holds the data model that crosses crate boundaries (metric samples,
//! pool health, query results, alerts) and the `tidepool.toml` parser.

pub mod config;
pub mod duration;
pub mod types;

pub use config::{
    BalanceStrategy, BalancerConfig, CacheConfig, ConfigError, DriverConfig, EndpointConfig,
    HealthConfig, MonitorConfig, PoolConfig, ServerConfig, SizerConfig, TidepoolConfig,
};
pub use duration::parse_duration;
pub use types::*;
