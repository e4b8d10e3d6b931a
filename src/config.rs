//! Configuration module for the telemetry node.
//!
//! This module provides environment-based configuration for the sampling
//! pipeline, local log storage and collector delivery settings.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Default collector base URL
const DEFAULT_COLLECTOR_URL: &str = "http://localhost:3000";

/// Default sampling tick period in milliseconds
const DEFAULT_SAMPLE_PERIOD_MS: u64 = 2_000;

/// Default sampling session duration in seconds (one bounded sampling run)
const DEFAULT_SESSION_DURATION_SECS: u64 = 300;

/// Default capacity of the persistence and delivery channels
const DEFAULT_CHANNEL_CAPACITY: usize = 10;

/// Minimum sample period to keep the sensor bus responsive
const MIN_SAMPLE_PERIOD_MS: u64 = 100;

/// Maximum sample period to ensure reasonable data freshness
const MAX_SAMPLE_PERIOD_MS: u64 = 60_000;

/// Minimum session duration
const MIN_SESSION_DURATION_SECS: u64 = 1;

/// Maximum session duration (one day)
const MAX_SESSION_DURATION_SECS: u64 = 86_400;

/// Configuration for the telemetry node.
///
/// All settings can be configured via environment variables:
/// - `ENOSE_COLLECTOR_URL`: collector base URL (default: http://localhost:3000)
/// - `ENOSE_SAMPLE_PERIOD_MS`: tick period in ms (default: 2000)
/// - `ENOSE_SESSION_DURATION_SECS`: sampling window length (default: 300)
/// - `ENOSE_CHANNEL_CAPACITY`: bounded channel depth (default: 10)
/// - `ENOSE_DATA_DIR`: directory for local log files (default: ./data)
/// - `ENOSE_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 10)
/// - `ENOSE_MAX_CONNECT_RETRIES`: wireless connect budget (default: 5)
/// - `ENOSE_BACKOFF_UNIT_MS`: linear backoff unit (default: 1000)
/// - `ENOSE_PROVISIONING_TIMEOUT_SECS`: provisioning window (default: 60)
/// - `ENOSE_DELIVERY_ENABLED`: enable collector delivery (default: true)
/// - `ENOSE_AUTO_RESTART`: start the next session automatically (default: false)
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the remote collector
    pub collector_url: String,

    /// Full URL for telemetry ingestion
    pub ingest_url: String,

    /// Full URL for device registration
    pub register_url: String,

    /// Period between sampling ticks
    pub sample_period: Duration,

    /// Length of one sampling session
    pub session_duration: Duration,

    /// Capacity of the persistence and delivery channels
    pub channel_capacity: usize,

    /// Directory holding the local log files
    pub data_dir: PathBuf,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Bounded wait on the delivery channel before re-checking connectivity
    pub delivery_poll: Duration,

    /// Wireless connect attempts before falling back to provisioning
    pub max_connect_retries: u32,

    /// Linear backoff unit between wireless connect attempts
    pub backoff_unit: Duration,

    /// Time window for out-of-band provisioning before giving up
    pub provisioning_timeout: Duration,

    /// Whether samples are relayed to the collector at all
    pub delivery_enabled: bool,

    /// Whether a new session starts automatically when one ends
    pub auto_restart: bool,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Returns a new `Config` instance with values from environment variables,
    /// falling back to sensible defaults where appropriate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `ENOSE_SAMPLE_PERIOD_MS` or
    /// `ENOSE_SESSION_DURATION_SECS` is not a valid number or falls outside
    /// its allowed range.
    pub fn from_env() -> Result<Self, ConfigError> {
        let collector_url = env::var("ENOSE_COLLECTOR_URL")
            .unwrap_or_else(|_| DEFAULT_COLLECTOR_URL.to_string());
        let collector_url = collector_url.trim_end_matches('/').to_string();

        let ingest_url = format!("{}/api/v1/telemetry", collector_url);
        let register_url = format!("{}/api/v1/register", collector_url);

        let sample_period = Duration::from_millis(Self::parse_sample_period()?);
        let session_duration = Duration::from_secs(Self::parse_session_duration()?);

        let channel_capacity: usize = env::var("ENOSE_CHANNEL_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&c| c > 0)
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY);

        let data_dir = env::var("ENOSE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let request_timeout_secs: u64 = env::var("ENOSE_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let max_connect_retries: u32 = env::var("ENOSE_MAX_CONNECT_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let backoff_unit_ms: u64 = env::var("ENOSE_BACKOFF_UNIT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_000);

        let provisioning_timeout_secs: u64 = env::var("ENOSE_PROVISIONING_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let delivery_enabled = env::var("ENOSE_DELIVERY_ENABLED")
            .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
            .unwrap_or(true);

        let auto_restart = env::var("ENOSE_AUTO_RESTART")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            collector_url,
            ingest_url,
            register_url,
            sample_period,
            session_duration,
            channel_capacity,
            data_dir,
            request_timeout: Duration::from_secs(request_timeout_secs),
            delivery_poll: Duration::from_secs(1),
            max_connect_retries,
            backoff_unit: Duration::from_millis(backoff_unit_ms),
            provisioning_timeout: Duration::from_secs(provisioning_timeout_secs),
            delivery_enabled,
            auto_restart,
        })
    }

    /// Parse the sample period from its environment variable with validation.
    fn parse_sample_period() -> Result<u64, ConfigError> {
        let env_var = "ENOSE_SAMPLE_PERIOD_MS";

        match env::var(env_var) {
            Ok(value) => {
                let period_ms: u64 = value.parse().map_err(|_| ConfigError {
                    message: format!("'{}' is not a valid number", value),
                    env_var: Some(env_var.to_string()),
                })?;

                if period_ms < MIN_SAMPLE_PERIOD_MS {
                    return Err(ConfigError {
                        message: format!(
                            "sample period {}ms is below minimum ({}ms)",
                            period_ms, MIN_SAMPLE_PERIOD_MS
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                if period_ms > MAX_SAMPLE_PERIOD_MS {
                    return Err(ConfigError {
                        message: format!(
                            "sample period {}ms exceeds maximum ({}ms)",
                            period_ms, MAX_SAMPLE_PERIOD_MS
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                Ok(period_ms)
            }
            Err(_) => Ok(DEFAULT_SAMPLE_PERIOD_MS),
        }
    }

    /// Parse the session duration from its environment variable with validation.
    fn parse_session_duration() -> Result<u64, ConfigError> {
        let env_var = "ENOSE_SESSION_DURATION_SECS";

        match env::var(env_var) {
            Ok(value) => {
                let duration: u64 = value.parse().map_err(|_| ConfigError {
                    message: format!("'{}' is not a valid number", value),
                    env_var: Some(env_var.to_string()),
                })?;

                if duration < MIN_SESSION_DURATION_SECS {
                    return Err(ConfigError {
                        message: format!(
                            "session duration {}s is below minimum ({}s)",
                            duration, MIN_SESSION_DURATION_SECS
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                if duration > MAX_SESSION_DURATION_SECS {
                    return Err(ConfigError {
                        message: format!(
                            "session duration {}s exceeds maximum ({}s)",
                            duration, MAX_SESSION_DURATION_SECS
                        ),
                        env_var: Some(env_var.to_string()),
                    });
                }

                Ok(duration)
            }
            Err(_) => Ok(DEFAULT_SESSION_DURATION_SECS),
        }
    }
}

impl Default for Config {
    /// Create a default configuration using default values.
    ///
    /// This is useful for testing or when environment variables are not set.
    fn default() -> Self {
        Self {
            collector_url: DEFAULT_COLLECTOR_URL.to_string(),
            ingest_url: format!("{}/api/v1/telemetry", DEFAULT_COLLECTOR_URL),
            register_url: format!("{}/api/v1/register", DEFAULT_COLLECTOR_URL),
            sample_period: Duration::from_millis(DEFAULT_SAMPLE_PERIOD_MS),
            session_duration: Duration::from_secs(DEFAULT_SESSION_DURATION_SECS),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            data_dir: PathBuf::from("./data"),
            request_timeout: Duration::from_secs(10),
            delivery_poll: Duration::from_secs(1),
            max_connect_retries: 5,
            backoff_unit: Duration::from_millis(1_000),
            provisioning_timeout: Duration::from_secs(60),
            delivery_enabled: true,
            auto_restart: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.collector_url, "http://localhost:3000");
        assert_eq!(config.sample_period, Duration::from_millis(2_000));
        assert_eq!(config.session_duration, Duration::from_secs(300));
        assert_eq!(config.channel_capacity, 10);
        assert_eq!(config.max_connect_retries, 5);
        assert!(config.delivery_enabled);
        assert!(!config.auto_restart);
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _guard1 = EnvGuard::remove("ENOSE_COLLECTOR_URL");
        let _guard2 = EnvGuard::remove("ENOSE_SAMPLE_PERIOD_MS");
        let _guard3 = EnvGuard::remove("ENOSE_SESSION_DURATION_SECS");

        let config = Config::from_env().expect("Should load with defaults");
        assert_eq!(config.collector_url, "http://localhost:3000");
        assert_eq!(config.sample_period, Duration::from_millis(2_000));
        assert_eq!(config.session_duration, Duration::from_secs(300));
    }

    #[test]
    fn test_config_from_env_custom_values() {
        let _guard1 = EnvGuard::set("ENOSE_COLLECTOR_URL", "http://collector:9000/");
        let _guard2 = EnvGuard::set("ENOSE_SAMPLE_PERIOD_MS", "500");
        let _guard3 = EnvGuard::set("ENOSE_SESSION_DURATION_SECS", "60");

        let config = Config::from_env().expect("Should load custom values");
        assert_eq!(config.collector_url, "http://collector:9000"); // Trailing slash removed
        assert_eq!(config.ingest_url, "http://collector:9000/api/v1/telemetry");
        assert_eq!(config.register_url, "http://collector:9000/api/v1/register");
        assert_eq!(config.sample_period, Duration::from_millis(500));
        assert_eq!(config.session_duration, Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_sample_period() {
        let _guard = EnvGuard::set("ENOSE_SAMPLE_PERIOD_MS", "not_a_number");

        let result = Config::from_env();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.message.contains("not a valid number"));
    }

    #[test]
    fn test_sample_period_below_min() {
        let _guard = EnvGuard::set("ENOSE_SAMPLE_PERIOD_MS", "10");

        let result = Config::from_env();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_sample_period_exceeds_max() {
        let _guard = EnvGuard::set("ENOSE_SAMPLE_PERIOD_MS", "120000");

        let result = Config::from_env();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.message.contains("exceeds maximum"));
    }

    #[test]
    fn test_session_duration_below_min() {
        let _guard = EnvGuard::set("ENOSE_SESSION_DURATION_SECS", "0");

        let result = Config::from_env();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.message.contains("below minimum"));
    }

    #[test]
    fn test_delivery_disabled() {
        let _guard = EnvGuard::set("ENOSE_DELIVERY_ENABLED", "false");

        let config = Config::from_env().expect("Should load");
        assert!(!config.delivery_enabled);
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError {
            message: "test error".to_string(),
            env_var: Some("TEST_VAR".to_string()),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for TEST_VAR: test error"
        );

        let error_no_var = ConfigError {
            message: "general error".to_string(),
            env_var: None,
        };
        assert_eq!(
            format!("{}", error_no_var),
            "Configuration error: general error"
        );
    }
}
