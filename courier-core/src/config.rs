//! Dispatcher configuration
//!
//! Loaded from environment variables with defaults suitable for development.

use crate::error::ConfigError;
use crate::{
    DEFAULT_ATTEMPT_HISTORY_LIMIT, DEFAULT_BATCH_SIZE, DEFAULT_FINISHED_LOG_RETENTION,
    DEFAULT_MAX_RETRIES, DEFAULT_TICK_INTERVAL_MS, DEFAULT_TIMEOUT_MS, DEFAULT_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Where webhooks and pending deliveries live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    /// Process memory only; pending deliveries are lost on restart.
    Memory,
    /// LMDB environment at `path`, sized to `map_size_mb`.
    Lmdb { path: PathBuf, map_size_mb: usize },
}

/// Master configuration for the delivery subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierConfig {
    /// Scheduler tick period.
    pub tick_interval: Duration,
    /// Maximum concurrent deliveries per tick.
    pub batch_size: usize,
    /// Attempts after which a delivery is exhausted.
    pub max_retries: u32,
    /// Per-call timeout for webhooks registered without one.
    pub default_timeout_ms: u64,
    /// Attempts kept per delivery for diagnostics.
    pub attempt_history_limit: usize,
    /// Attempt logs of delivered, exhausted or cancelled deliveries kept
    /// before the oldest are pruned.
    pub finished_log_retention: usize,
    /// `User-Agent` sent on every delivery.
    pub user_agent: String,
    pub storage: StorageBackend,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            attempt_history_limit: DEFAULT_ATTEMPT_HISTORY_LIMIT,
            finished_log_retention: DEFAULT_FINISHED_LOG_RETENTION,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            storage: StorageBackend::Memory,
        }
    }
}

impl CourierConfig {
    /// Create CourierConfig from environment variables.
    ///
    /// Environment variables:
    /// - `COURIER_TICK_INTERVAL_MS`: Scheduler tick period (default: 1000)
    /// - `COURIER_BATCH_SIZE`: Concurrent deliveries per tick (default: 10)
    /// - `COURIER_MAX_RETRIES`: Attempts before exhaustion (default: 3)
    /// - `COURIER_DEFAULT_TIMEOUT_MS`: Per-call timeout (default: 30000)
    /// - `COURIER_ATTEMPT_HISTORY_LIMIT`: Attempts kept per delivery (default: 10)
    /// - `COURIER_FINISHED_LOG_RETENTION`: Finished attempt logs kept (default: 1000)
    /// - `COURIER_USER_AGENT`: User-Agent header (default: "Courier-Webhook/1.0")
    /// - `COURIER_STORAGE`: "memory" or "lmdb" (default: memory)
    /// - `COURIER_LMDB_PATH`: LMDB directory (default: "./courier-data")
    /// - `COURIER_LMDB_MAP_SIZE_MB`: LMDB map size (default: 256)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let storage = match std::env::var("COURIER_STORAGE")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Ok("lmdb") => StorageBackend::Lmdb {
                path: std::env::var("COURIER_LMDB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("./courier-data")),
                map_size_mb: std::env::var("COURIER_LMDB_MAP_SIZE_MB")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(256),
            },
            _ => StorageBackend::Memory,
        };

        Self {
            tick_interval: std::env::var("COURIER_TICK_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick_interval),
            batch_size: std::env::var("COURIER_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.batch_size),
            max_retries: std::env::var("COURIER_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            default_timeout_ms: std::env::var("COURIER_DEFAULT_TIMEOUT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.default_timeout_ms),
            attempt_history_limit: std::env::var("COURIER_ATTEMPT_HISTORY_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.attempt_history_limit),
            finished_log_retention: std::env::var("COURIER_FINISHED_LOG_RETENTION")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.finished_log_retention),
            user_agent: std::env::var("COURIER_USER_AGENT").unwrap_or(defaults.user_agent),
            storage,
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - tick_interval, default_timeout_ms are positive
    /// - batch_size, max_retries, attempt_history_limit are at least 1
    /// - user_agent is non-empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "tick_interval".to_string(),
                value: format!("{:?}", self.tick_interval),
                reason: "tick_interval must be positive".to_string(),
            });
        }

        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size".to_string(),
                value: self.batch_size.to_string(),
                reason: "batch_size must be at least 1".to_string(),
            });
        }

        if self.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_retries".to_string(),
                value: self.max_retries.to_string(),
                reason: "max_retries must be at least 1".to_string(),
            });
        }

        if self.default_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "default_timeout_ms".to_string(),
                value: self.default_timeout_ms.to_string(),
                reason: "default_timeout_ms must be positive".to_string(),
            });
        }

        if self.attempt_history_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "attempt_history_limit".to_string(),
                value: self.attempt_history_limit.to_string(),
                reason: "attempt_history_limit must be at least 1".to_string(),
            });
        }

        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "user_agent".to_string(),
            });
        }

        if let StorageBackend::Lmdb { map_size_mb, .. } = &self.storage {
            if *map_size_mb == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "map_size_mb".to_string(),
                    value: map_size_mb.to_string(),
                    reason: "map_size_mb must be positive".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Configuration for tests: fast ticks, in-memory storage.
    pub fn development() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CourierConfig::default();
        assert_eq!(config.tick_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.default_timeout_ms, 30_000);
        assert_eq!(config.attempt_history_limit, 10);
        assert_eq!(config.finished_log_retention, 1_000);
        assert_eq!(config.storage, StorageBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = CourierConfig {
            batch_size: 0,
            ..CourierConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let config = CourierConfig {
            max_retries: 0,
            ..CourierConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_user_agent() {
        let config = CourierConfig {
            user_agent: "  ".to_string(),
            ..CourierConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_zero_map_size() {
        let config = CourierConfig {
            storage: StorageBackend::Lmdb {
                path: PathBuf::from("/tmp/courier"),
                map_size_mb: 0,
            },
            ..CourierConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_development_is_valid() {
        assert!(CourierConfig::development().validate().is_ok());
    }
}
