//! Configuration handling for the query engine.
//!
//! All policy values (pool sizing, timeouts, metadata freshness, row caps) are
//! exposed here with defaults, parsed from CLI arguments or `DBQ_*` environment
//! variables.

use clap::Args;
use std::time::Duration;

pub const DEFAULT_STORE_URL: &str = "sqlite:db-query-engine.db";
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;
pub const MAX_QUERY_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_INTROSPECTION_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_METADATA_FRESHNESS_SECS: u64 = 300;
pub const DEFAULT_MAX_ROWS: usize = 10_000;

// Pool configuration defaults
pub const DEFAULT_MAX_SESSIONS_PER_CONNECTION: u32 = 5;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;

/// Pool Manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolOptions {
    /// Maximum live sessions per registered connection.
    pub max_sessions_per_connection: u32,
    /// How long a checkout waits for a free slot before `PoolExhausted`.
    pub acquire_timeout: Duration,
    /// Idle sessions older than this are closed.
    pub idle_timeout: Duration,
    /// Interval of the background idle reaper.
    pub cleanup_interval: Duration,
    /// Deadline for establishing a new session.
    pub connect_timeout: Duration,
    /// Ping idle sessions before handing them out.
    pub test_before_checkout: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_sessions_per_connection: DEFAULT_MAX_SESSIONS_PER_CONNECTION,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            test_before_checkout: true,
        }
    }
}

impl PoolOptions {
    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_sessions_per_connection == 0 {
            return Err("max_sessions_per_connection must be greater than 0".to_string());
        }
        if self.cleanup_interval.is_zero() {
            return Err("cleanup_interval must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// Store holding the connection registry, metadata snapshots and execution history
    #[arg(long, default_value = DEFAULT_STORE_URL, env = "DBQ_STORE_URL")]
    pub store_url: String,

    /// Default query timeout in seconds
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_SECS, env = "DBQ_QUERY_TIMEOUT")]
    pub query_timeout: u64,

    /// Upper bound for caller-supplied query timeouts, in seconds
    #[arg(long, default_value_t = MAX_QUERY_TIMEOUT_SECS, env = "DBQ_MAX_QUERY_TIMEOUT")]
    pub max_query_timeout: u64,

    /// Session connect timeout in seconds
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS, env = "DBQ_CONNECT_TIMEOUT")]
    pub connect_timeout: u64,

    /// Schema introspection timeout in seconds
    #[arg(
        long,
        default_value_t = DEFAULT_INTROSPECTION_TIMEOUT_SECS,
        env = "DBQ_INTROSPECTION_TIMEOUT"
    )]
    pub introspection_timeout: u64,

    /// Metadata snapshots younger than this many seconds are served from the store
    #[arg(
        long,
        default_value_t = DEFAULT_METADATA_FRESHNESS_SECS,
        env = "DBQ_METADATA_FRESHNESS"
    )]
    pub metadata_freshness: u64,

    /// Maximum rows returned by a single execution
    #[arg(long, default_value_t = DEFAULT_MAX_ROWS, env = "DBQ_MAX_ROWS")]
    pub max_rows: usize,

    /// Maximum live sessions per registered connection
    #[arg(
        long,
        default_value_t = DEFAULT_MAX_SESSIONS_PER_CONNECTION,
        env = "DBQ_MAX_SESSIONS"
    )]
    pub max_sessions_per_connection: u32,

    /// Seconds a checkout waits for a free session slot
    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_SECS, env = "DBQ_ACQUIRE_TIMEOUT")]
    pub acquire_timeout: u64,

    /// Seconds an idle session may stay pooled
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, env = "DBQ_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    /// Seconds between idle session sweeps
    #[arg(long, default_value_t = DEFAULT_CLEANUP_INTERVAL_SECS, env = "DBQ_CLEANUP_INTERVAL")]
    pub cleanup_interval: u64,

    /// Only allow read-only statements (SELECT, SHOW, EXPLAIN, ...)
    #[arg(long, env = "DBQ_READ_ONLY")]
    pub read_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DBQ_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBQ_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            store_url: DEFAULT_STORE_URL.to_string(),
            query_timeout: DEFAULT_QUERY_TIMEOUT_SECS,
            max_query_timeout: MAX_QUERY_TIMEOUT_SECS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
            introspection_timeout: DEFAULT_INTROSPECTION_TIMEOUT_SECS,
            metadata_freshness: DEFAULT_METADATA_FRESHNESS_SECS,
            max_rows: DEFAULT_MAX_ROWS,
            max_sessions_per_connection: DEFAULT_MAX_SESSIONS_PER_CONNECTION,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT_SECS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT_SECS,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL_SECS,
            read_only: false,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Build the Pool Manager settings.
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            max_sessions_per_connection: self.max_sessions_per_connection,
            acquire_timeout: Duration::from_secs(self.acquire_timeout),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            cleanup_interval: Duration::from_secs(self.cleanup_interval),
            connect_timeout: self.connect_timeout_duration(),
            test_before_checkout: true,
        }
    }

    /// Get the default query timeout as a Duration.
    pub fn query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.query_timeout)
    }

    /// Get the maximum query timeout as a Duration.
    pub fn max_query_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.max_query_timeout)
    }

    /// Get the connection timeout as a Duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Get the introspection timeout as a Duration.
    pub fn introspection_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.introspection_timeout)
    }

    /// Get the metadata freshness window as a Duration.
    pub fn metadata_freshness_duration(&self) -> Duration {
        Duration::from_secs(self.metadata_freshness)
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.query_timeout == 0 {
            return Err("query_timeout must be greater than 0".to_string());
        }
        if self.query_timeout > self.max_query_timeout {
            return Err(format!(
                "query_timeout ({}) cannot exceed max_query_timeout ({})",
                self.query_timeout, self.max_query_timeout
            ));
        }
        if self.max_rows == 0 {
            return Err("max_rows must be greater than 0".to_string());
        }
        self.pool_options().validate()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.store_url, DEFAULT_STORE_URL);
        assert_eq!(config.max_sessions_per_connection, 5);
        assert_eq!(config.metadata_freshness_duration(), Duration::from_secs(300));
        assert!(!config.read_only);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_durations() {
        let config = Config {
            query_timeout: 60,
            connect_timeout: 15,
            introspection_timeout: 90,
            ..Config::default()
        };
        assert_eq!(config.query_timeout_duration(), Duration::from_secs(60));
        assert_eq!(config.connect_timeout_duration(), Duration::from_secs(15));
        assert_eq!(
            config.introspection_timeout_duration(),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn test_pool_options_from_config() {
        let config = Config {
            max_sessions_per_connection: 2,
            acquire_timeout: 3,
            idle_timeout: 120,
            ..Config::default()
        };
        let opts = config.pool_options();
        assert_eq!(opts.max_sessions_per_connection, 2);
        assert_eq!(opts.acquire_timeout, Duration::from_secs(3));
        assert_eq!(opts.idle_timeout, Duration::from_secs(120));
        assert_eq!(opts.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_pool_options_defaults() {
        let opts = PoolOptions::default();
        assert_eq!(opts.max_sessions_per_connection, 5);
        assert_eq!(opts.acquire_timeout, Duration::from_secs(10));
        assert!(opts.test_before_checkout);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_sessions() {
        let config = Config {
            max_sessions_per_connection: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("max_sessions_per_connection"));
    }

    #[test]
    fn test_validation_rejects_timeout_above_max() {
        let config = Config {
            query_timeout: 600,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("cannot exceed"));
    }

    #[test]
    fn test_validation_rejects_zero_rows() {
        let config = Config {
            max_rows: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
