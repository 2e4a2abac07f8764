//! Proxy configuration.
//!
//! Loaded from a TOML file; the hot-restart identity (`--base-id`,
//! `--restart-epoch`) comes from the command line, not the file, so a
//! restarted process can reuse the file unchanged.

use crate::address::Address;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("listener {listener} routes to unknown cluster '{route}'")]
    UnknownRoute { listener: Address, route: String },
    #[error("duplicate cluster name '{0}'")]
    DuplicateCluster(String),
    #[error("at least one listener is required")]
    NoListeners,
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(rename = "listener", default)]
    pub listeners: Vec<ListenerConfig>,

    #[serde(rename = "cluster", default)]
    pub clusters: Vec<ClusterConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.listeners.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        let mut names: Vec<&str> = Vec::new();
        for cluster in &self.clusters {
            if names.contains(&cluster.name.as_str()) {
                return Err(ConfigError::DuplicateCluster(cluster.name.clone()));
            }
            names.push(&cluster.name);
        }

        for listener in &self.listeners {
            if !names.contains(&listener.route.as_str()) {
                return Err(ConfigError::UnknownRoute {
                    listener: listener.address,
                    route: listener.route.clone(),
                });
            }
        }
        Ok(())
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.threads.unwrap_or_else(num_cpus::get)
    }

    /// CPU pin list, if configured.
    pub fn cpu_affinity(&self) -> Option<Vec<usize>> {
        self.workers.cpu_affinity.as_ref().map(|s| parse_cpu_list(s))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Seconds after startup at which the previous generation is told to
    /// terminate.
    #[serde(default = "ServerConfig::default_parent_shutdown_secs")]
    pub parent_shutdown_secs: u64,
}

impl ServerConfig {
    fn default_parent_shutdown_secs() -> u64 {
        15
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            parent_shutdown_secs: Self::default_parent_shutdown_secs(),
        }
    }
}

/// Worker thread configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Number of worker threads (default: number of CPUs).
    pub threads: Option<usize>,

    /// CPU cores to pin workers to, Linux-style (e.g., "0-3,6-8").
    pub cpu_affinity: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Address to listen on, `tcp://<ip>:<port>`.
    pub address: Address,

    /// Cluster the built-in TCP proxy routes to.
    pub route: String,

    #[serde(default = "default_true")]
    pub bind_to_port: bool,

    #[serde(default)]
    pub use_proxy_proto: bool,

    #[serde(default)]
    pub use_original_dst: bool,

    #[serde(default = "default_buffer_limit")]
    pub per_connection_buffer_limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,

    /// Upstream address, `tcp://<ip>:<port>`.
    pub address: Address,

    #[serde(default = "ClusterConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "ClusterConfig::default_max_connections")]
    pub max_connections: u64,

    #[serde(default = "ClusterConfig::default_max_pending_requests")]
    pub max_pending_requests: u64,

    #[serde(default = "ClusterConfig::default_max_requests")]
    pub max_requests: u64,

    #[serde(default = "ClusterConfig::default_max_retries")]
    pub max_retries: u64,

    /// Zero means unlimited.
    #[serde(default)]
    pub max_requests_per_connection: u64,

    #[serde(default = "default_buffer_limit")]
    pub per_connection_buffer_limit: usize,
}

impl ClusterConfig {
    fn default_connect_timeout_ms() -> u64 {
        250
    }
    fn default_max_connections() -> u64 {
        1024
    }
    fn default_max_pending_requests() -> u64 {
        1024
    }
    fn default_max_requests() -> u64 {
        1024
    }
    fn default_max_retries() -> u64 {
        3
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Include the log target (module path).
    #[serde(default)]
    pub target: bool,

    /// Include thread names.
    #[serde(default = "default_true")]
    pub thread_names: bool,

    #[serde(default = "default_true")]
    pub timestamps: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Self::default_level(),
            format: LogFormat::default(),
            target: false,
            thread_names: true,
            timestamps: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

fn default_true() -> bool {
    true
}

fn default_buffer_limit() -> usize {
    1024 * 1024
}

/// Parse a Linux-style CPU list ("0-3,6-8").
fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.trim().parse::<usize>(), end.trim().parse::<usize>())
            {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}
