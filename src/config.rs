//! Configuration
//!
//! The full startup configuration for the gateway. Loaded from a JSON file,
//! then overridden by the small set of environment knobs (`SOCKET_TIMEOUT`,
//! `MUSKIE_DATA_TIMEOUT`, `LOG_LEVEL`). Every duration default here matches
//! the values the rest of the crate assumes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen port
    pub port: u16,

    /// Requests older than this (by Date header) are rejected
    pub max_request_age_s: u64,

    /// Admission control
    pub throttle: ThrottleConfig,

    /// Object storage knobs
    pub storage: StorageConfig,

    /// Placement selector knobs
    pub placement: PlacementConfig,

    /// Storage-node client knobs
    pub shark: SharkConfig,

    /// Upper bound for the Durability-Level header
    pub max_object_copies: u32,

    /// Accept multipart-upload configuration (routes are not mounted yet)
    pub enable_mpu: bool,

    /// When true, snaplink creation is refused globally
    pub snaplink_cleanup_required: bool,

    /// Accounts for which snaplinks are disabled
    pub accounts_snaplinks_disabled: Vec<String>,

    /// Multipart upload layout
    pub multipart_upload: MpuConfig,

    /// Socket-level inactivity timeout, seconds (`SOCKET_TIMEOUT` env)
    pub socket_timeout_s: u64,

    /// Upload idle timeout, milliseconds (`MUSKIE_DATA_TIMEOUT` env)
    pub data_timeout_ms: u64,

    /// Tracing filter (`LOG_LEVEL` env)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            max_request_age_s: 600,
            throttle: ThrottleConfig::default(),
            storage: StorageConfig::default(),
            placement: PlacementConfig::default(),
            shark: SharkConfig::default(),
            max_object_copies: 9,
            enable_mpu: false,
            snaplink_cleanup_required: false,
            accounts_snaplinks_disabled: Vec::new(),
            multipart_upload: MpuConfig::default(),
            socket_timeout_s: 120,
            data_timeout_ms: 45_000,
            log_level: "info".to_string(),
        }
    }
}

/// Admission controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Whether admission control is active at all
    pub enabled: bool,

    /// Maximum requests in flight
    pub concurrency: usize,

    /// Maximum waiters before shedding
    pub queue_tolerance: usize,

    /// How often the stale-slot reaper runs
    pub reap_interval_ms: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: 50,
            queue_tolerance: 25,
            reap_interval_ms: 5_000,
        }
    }
}

impl ThrottleConfig {
    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

/// Object storage knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Size assumed for chunked uploads that carry no Max-Content-Length
    pub default_max_streaming_size_mb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_max_streaming_size_mb: 5_120,
        }
    }
}

impl StorageConfig {
    pub fn default_max_streaming_size(&self) -> u64 {
        self.default_max_streaming_size_mb * 1024 * 1024
    }
}

/// Placement selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Node directory base URL
    pub directory_url: String,

    /// How often the node view is refreshed
    pub refresh_interval_ms: u64,

    /// Extra allowance for directory lag when judging heartbeat staleness
    pub lag_ms: u64,

    /// Heartbeats older than this disqualify a node
    pub staleness_window_s: u64,

    /// Utilization ceiling for ordinary writes (percent)
    pub utilization_pct: u32,

    /// Utilization ceiling for operator writes (percent)
    pub operator_utilization_pct: u32,

    /// Require tuples to span at least two datacenters
    pub multi_dc: bool,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            directory_url: "http://localhost:2020".to_string(),
            refresh_interval_ms: 30_000,
            lag_ms: 0,
            staleness_window_s: 3_600,
            utilization_pct: 90,
            operator_utilization_pct: 96,
            multi_dc: true,
        }
    }
}

impl PlacementConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_s) + Duration::from_millis(self.lag_ms)
    }
}

/// Storage-node client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharkConfig {
    /// Port the storage nodes listen on
    pub port: u16,

    /// Time from request issuance until the node must prove liveness
    pub connect_timeout_ms: u64,

    /// Connect-phase retry policy
    pub retry: SharkRetryConfig,
}

impl Default for SharkConfig {
    fn default() -> Self {
        Self {
            port: 80,
            connect_timeout_ms: 2_000,
            retry: SharkRetryConfig::default(),
        }
    }
}

impl SharkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Retry policy for shark connection setup. Streaming is never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharkRetryConfig {
    pub retries: u32,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for SharkRetryConfig {
    fn default() -> Self {
        Self {
            retries: 2,
            min_timeout_ms: 100,
            max_timeout_ms: 10_000,
        }
    }
}

/// Multipart upload layout knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MpuConfig {
    /// Length of the hashed prefix directory for upload records
    pub prefix_dir_len: u32,
}

impl Default for MpuConfig {
    fn default() -> Self {
        Self { prefix_dir_len: 1 }
    }
}

impl Config {
    /// Load from a JSON file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment knobs win over the file
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("SOCKET_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                self.socket_timeout_s = secs;
            } else {
                tracing::warn!(value = %v, "ignoring unparseable SOCKET_TIMEOUT");
            }
        }
        if let Ok(v) = std::env::var("MUSKIE_DATA_TIMEOUT") {
            if let Ok(ms) = v.parse::<u64>() {
                self.data_timeout_ms = ms;
            } else {
                tracing::warn!(value = %v, "ignoring unparseable MUSKIE_DATA_TIMEOUT");
            }
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.log_level = v;
        }
    }

    /// Reject configurations the rest of the crate cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be nonzero".into()));
        }
        if self.max_object_copies == 0 {
            return Err(ConfigError::Invalid("max_object_copies must be >= 1".into()));
        }
        if self.throttle.enabled && self.throttle.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "throttle.concurrency must be >= 1 when enabled".into(),
            ));
        }
        if self.placement.utilization_pct > 100 || self.placement.operator_utilization_pct > 100 {
            return Err(ConfigError::Invalid(
                "utilization ceilings are percentages".into(),
            ));
        }
        if self.placement.operator_utilization_pct < self.placement.utilization_pct {
            return Err(ConfigError::Invalid(
                "operator_utilization_pct must be >= utilization_pct".into(),
            ));
        }
        if self.data_timeout_ms == 0 {
            return Err(ConfigError::Invalid("data_timeout_ms must be nonzero".into()));
        }
        Ok(())
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_millis(self.data_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_object_copies, 9);
        assert_eq!(config.data_timeout_ms, 45_000);
        assert_eq!(config.socket_timeout_s, 120);
        assert_eq!(config.placement.refresh_interval_ms, 30_000);
        assert_eq!(config.shark.connect_timeout_ms, 2_000);
        assert_eq!(config.throttle.reap_interval_ms, 5_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_round_trip() {
        let raw = r#"{
            "port": 9090,
            "throttle": { "enabled": true, "concurrency": 4, "queue_tolerance": 2 },
            "placement": { "multi_dc": false }
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.port, 9090);
        assert!(config.throttle.enabled);
        assert_eq!(config.throttle.concurrency, 4);
        // untouched sections keep their defaults
        assert_eq!(config.throttle.reap_interval_ms, 5_000);
        assert!(!config.placement.multi_dc);
        assert_eq!(config.placement.utilization_pct, 90);
    }

    #[test]
    fn test_validate_rejects_inverted_ceilings() {
        let mut config = Config::default();
        config.placement.utilization_pct = 95;
        config.placement.operator_utilization_pct = 90;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.throttle.enabled = true;
        config.throttle.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_streaming_size_conversion() {
        let storage = StorageConfig {
            default_max_streaming_size_mb: 2,
        };
        assert_eq!(storage.default_max_streaming_size(), 2 * 1024 * 1024);
    }
}
