//! WolfKeeper Configuration
//!
//! This module provides configuration structures for a WolfKeeper
//! participant and for the development coordinator server.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::coord::validate_path;

/// Main WolfKeeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfKeeperConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Coordinator connection configuration
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    /// Election and registry namespaces
    #[serde(default)]
    pub election: ElectionConfig,

    /// Development coordinator server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier (used in logs only)
    pub id: String,

    /// Service port published to the registry when no advertise address is set
    #[serde(default = "default_service_port")]
    pub port: u16,

    /// Address other processes should use to reach this worker
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Coordinator connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Coordinator address (host:port)
    #[serde(default = "default_coordinator_address")]
    pub address: String,

    /// Session timeout in milliseconds; the coordinator expires the
    /// session and its ephemeral nodes after this much silence
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Delay before opening a new session after the previous one was lost
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

/// Election and registry namespaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Parent of the election candidate nodes
    #[serde(default = "default_election_path")]
    pub election_path: String,

    /// Parent of the worker registry entries
    #[serde(default = "default_registry_path")]
    pub registry_path: String,
}

/// Development coordinator server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the coordinator on
    #[serde(default = "default_server_bind_address")]
    pub bind_address: String,

    /// Largest session timeout clients may negotiate, in milliseconds
    #[serde(default = "default_max_session_timeout_ms")]
    pub max_session_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_service_port() -> u16 {
    8081
}

fn default_coordinator_address() -> String {
    "127.0.0.1:2181".to_string()
}

fn default_session_timeout_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_election_path() -> String {
    crate::cluster::DEFAULT_ELECTION_PATH.to_string()
}

fn default_registry_path() -> String {
    crate::cluster::DEFAULT_REGISTRY_PATH.to_string()
}

fn default_server_bind_address() -> String {
    "0.0.0.0:2181".to_string()
}

fn default_max_session_timeout_ms() -> u64 {
    40000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            address: default_coordinator_address(),
            session_timeout_ms: default_session_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            election_path: default_election_path(),
            registry_path: default_registry_path(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_server_bind_address(),
            max_session_timeout_ms: default_max_session_timeout_ms(),
        }
    }
}

/// Output style of the log layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human-oriented output
    Pretty,
    /// One line per event
    Compact,
}

impl LoggingConfig {
    /// The configured format
    pub fn log_format(&self) -> crate::Result<LogFormat> {
        match self.format.as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            other => Err(crate::Error::Config(format!(
                "logging.format must be pretty or compact, got {}",
                other
            ))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfKeeperConfig {
    /// Build a configuration with defaults for everything but the node id
    pub fn for_node(id: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                id: id.into(),
                port: default_service_port(),
                advertise_address: None,
            },
            coordinator: CoordinatorConfig::default(),
            election: ElectionConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfKeeperConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfKeeperConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("cannot serialize configuration: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.coordinator.address.is_empty() {
            return Err(crate::Error::Config("coordinator.address cannot be empty".into()));
        }

        if self.coordinator.session_timeout_ms == 0 {
            return Err(crate::Error::Config("coordinator.session_timeout_ms must be positive".into()));
        }

        validate_path(&self.election.election_path)
            .map_err(|e| crate::Error::Config(format!("election.election_path: {}", e)))?;
        validate_path(&self.election.registry_path)
            .map_err(|e| crate::Error::Config(format!("election.registry_path: {}", e)))?;

        if self.election.election_path == self.election.registry_path {
            return Err(crate::Error::Config(
                "election.election_path and election.registry_path must differ".into(),
            ));
        }

        self.logging.log_format()?;

        Ok(())
    }

    /// Address published to the service registry when this node is a worker
    pub fn advertise_address(&self) -> String {
        match &self.node.advertise_address {
            Some(address) => address.clone(),
            None => format!("http://{}:{}", local_hostname(), self.node.port),
        }
    }

    /// Get session timeout as Duration
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.coordinator.session_timeout_ms)
    }

    /// Get reconnect delay as Duration
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.coordinator.reconnect_delay_ms)
    }

    /// Get the server's session timeout ceiling as Duration
    pub fn max_session_timeout(&self) -> Duration {
        Duration::from_millis(self.server.max_session_timeout_ms)
    }
}

/// Host name of this machine, falling back to localhost
fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Default config file location
pub fn default_config_path() -> PathBuf {
    PathBuf::from("wolfkeeper.toml")
}
