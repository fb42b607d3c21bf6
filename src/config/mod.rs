/// Configuration management for the failover router

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::Endpoint;
use crate::routing::PolicyKind;

/// Upper bound for retry and redirect budgets
pub const MAX_BOUND: u8 = 5;

/// Main router configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Deployment endpoints and host-list acquisition
    pub client: ClientConfig,
    /// Endpoint selection policy
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Connection pool sizing and timeouts
    #[serde(default)]
    pub pool: PoolSettings,
    /// Retry and redirect budgets
    #[serde(default)]
    pub failover: FailoverConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Initial endpoints, `host:port` with an optional `tcp://` scheme
    pub hosts: Vec<String>,
    /// Replace the host list with the deployment's own endpoint list
    #[serde(default)]
    pub acquire_host_list: bool,
    /// Seconds between background host-list refreshes
    #[serde(default = "default_acquire_interval")]
    pub acquire_host_list_interval_sec: u64,
}

fn default_acquire_interval() -> u64 {
    60
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:8529".to_string()],
            acquire_host_list: false,
            acquire_host_list_interval_sec: default_acquire_interval(),
        }
    }
}

/// Routing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// `round_robin` or `fixed_list`
    #[serde(default)]
    pub policy: PolicyKind,
    /// Start the round-robin cursor at a random endpoint
    #[serde(default)]
    pub randomize_start: bool,
}

/// Pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Number of connection slots
    pub max_connections: usize,
    /// Connection lifetime in milliseconds, unlimited when absent
    pub connection_ttl_ms: Option<u64>,
    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Per-request response timeout in milliseconds
    pub request_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 1,
            connection_ttl_ms: None,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl PoolSettings {
    pub fn connection_ttl(&self) -> Option<Duration> {
        self.connection_ttl_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Retries on a different endpoint after a connection failure
    pub max_connect_retries: u8,
    /// Redirect hops followed per request
    pub max_redirects: u8,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_connect_retries: 1,
            max_redirects: 1,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (pretty, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Parsed client hosts
    pub fn endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.client
            .hosts
            .iter()
            .map(|host| {
                Endpoint::parse(host).map_err(|e| {
                    ConfigError::ValidationError(format!("Invalid host '{}': {}", host, e))
                })
            })
            .collect()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.hosts.is_empty() {
            return Err(ConfigError::ValidationError(
                "client.hosts cannot be empty".to_string(),
            ));
        }
        self.endpoints()?;

        if self.client.acquire_host_list_interval_sec == 0 {
            return Err(ConfigError::ValidationError(
                "acquire_host_list_interval_sec must be greater than 0".to_string(),
            ));
        }

        if self.pool.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.pool.connection_ttl_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "connection_ttl_ms must be greater than 0 when set".to_string(),
            ));
        }
        if self.pool.connect_timeout_ms == 0 || self.pool.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "pool timeouts must be greater than 0".to_string(),
            ));
        }

        if self.failover.max_connect_retries > MAX_BOUND {
            return Err(ConfigError::ValidationError(format!(
                "max_connect_retries must be at most {}",
                MAX_BOUND
            )));
        }
        if self.failover.max_redirects > MAX_BOUND {
            return Err(ConfigError::ValidationError(format!(
                "max_redirects must be at most {}",
                MAX_BOUND
            )));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, profile: &str) -> Result<(), ConfigError> {
        let config = match profile {
            "cluster" => Config {
                client: ClientConfig {
                    hosts: vec![
                        "tcp://10.0.1.10:8529".to_string(),
                        "tcp://10.0.1.11:8529".to_string(),
                        "tcp://10.0.1.12:8529".to_string(),
                    ],
                    acquire_host_list: true,
                    acquire_host_list_interval_sec: 60,
                },
                routing: RoutingConfig {
                    policy: PolicyKind::RoundRobin,
                    randomize_start: true,
                },
                pool: PoolSettings {
                    max_connections: 3,
                    connection_ttl_ms: Some(300_000),
                    ..Default::default()
                },
                ..Default::default()
            },
            "single" => Config {
                client: ClientConfig {
                    hosts: vec![
                        "tcp://10.0.2.10:8529".to_string(),
                        "tcp://10.0.2.11:8529".to_string(),
                    ],
                    ..Default::default()
                },
                routing: RoutingConfig {
                    policy: PolicyKind::FixedList,
                    randomize_start: false,
                },
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Profile must be 'cluster' or 'single'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.routing.policy, PolicyKind::RoundRobin);
        assert_eq!(config.pool.connection_ttl(), None);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.pool.max_connections = 0;
        assert!(config.validate().is_err());
        config.pool.max_connections = 3;
        assert!(config.validate().is_ok());

        config.failover.max_redirects = 6;
        assert!(config.validate().is_err());
        config.failover.max_redirects = 5;
        assert!(config.validate().is_ok());

        config.client.hosts = vec!["no-port".to_string()];
        assert!(config.validate().is_err());
        config.client.hosts.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_logging_validation() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            hosts = ["tcp://127.0.0.1:8529", "127.0.0.1:8530"]

            [routing]
            policy = "fixed_list"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.routing.policy, PolicyKind::FixedList);
        assert_eq!(config.failover.max_connect_retries, 1);
        assert_eq!(config.client.acquire_host_list_interval_sec, 60);
        assert_eq!(config.endpoints().unwrap()[1], Endpoint::new("127.0.0.1", 8530));
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config.client.hosts, config.client.hosts);
    }

    #[test]
    fn test_example_profiles() {
        for profile in ["cluster", "single"] {
            let temp_file = NamedTempFile::new().unwrap();
            Config::create_example_config(temp_file.path(), profile).unwrap();
            assert!(Config::load_from_file(temp_file.path()).is_ok());
        }

        let temp_file = NamedTempFile::new().unwrap();
        assert!(Config::create_example_config(temp_file.path(), "sharded").is_err());
    }
}
