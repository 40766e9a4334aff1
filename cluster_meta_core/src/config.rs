//! Configuration management for the cluster metadata server
//!
//! This module provides structured configuration using TOML/YAML files with
//! serde, plus `CLUSTER_META_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MetaError, Result};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "CLUSTER_META_";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaServerConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Sentinel quorum configuration
    pub sentinel: SentinelConfig,
    /// Persisted snapshot location
    pub meta_store: MetaStoreConfig,
    /// Periodic reconciliation
    pub reconcile: ReconcileConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address
    pub bind_address: String,
    /// Server port
    pub port: u16,
    /// Enable graceful shutdown
    pub graceful_shutdown: bool,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout: u64,
    /// Process id file
    pub pid: PidConfig,
}

/// Process id file written at startup and removed on exit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PidConfig {
    pub enabled: bool,
    pub path: PathBuf,
    /// Replace a pid file left behind instead of refusing to start
    #[serde(rename = "override")]
    pub override_existing: bool,
}

/// Sentinel quorum configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Sentinel endpoints (host:port)
    pub addresses: Vec<String>,
    /// IPs handed to sentinel discovery; peers on these IPs are not recorded
    pub discovery_seeds: Vec<String>,
    /// Quorum used when monitoring a newly added instance
    pub quorum: u32,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    /// Delay before an event subscription reconnects
    pub reconnect_delay_ms: u64,
    /// Capacity of each watcher's event queue
    pub event_queue_capacity: usize,
}

/// Where and how the snapshot is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaStoreConfig {
    /// Name of the instance that hosts the snapshot
    pub instance_name: String,
    /// Canonical hash key
    pub hash_key: String,
    /// Field holding the version counter
    pub version_field: String,
    /// Field holding the list of instance names
    pub instance_names_field: String,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

/// Periodic reconciliation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Seconds between passes, 0 disables the loop
    pub interval_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log file path (optional, rotated daily)
    pub file_path: Option<String>,
    /// Enable console output
    pub console: bool,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Simple text format
    Simple,
    /// JSON format
    Json,
    /// Pretty format with colors
    Pretty,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder
    pub enabled: bool,
}

impl MetaServerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| MetaError::Config(e.to_string()))
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| MetaError::Config(e.to_string()))
    }

    /// Load by extension: `.yml`/`.yaml` as YAML, anything else as TOML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let is_yaml = path
            .as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml"))
            .unwrap_or(false);
        if is_yaml {
            Self::from_yaml_file(path)
        } else {
            Self::from_file(path)
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| MetaError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overlay `CLUSTER_META_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| env::var(format!("{}{}", ENV_PREFIX, name)).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| MetaError::Config(format!("invalid SERVER_PORT {:?}", port)))?;
        }
        if let Some(bind_address) = lookup("SERVER_BIND_ADDRESS") {
            self.server.bind_address = bind_address;
        }
        if let Some(sentinels) = lookup("SENTINELS") {
            self.sentinel.addresses = sentinels
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(name) = lookup("META_INSTANCE") {
            self.meta_store.instance_name = name;
        }
        if let Some(key) = lookup("META_HASH_KEY") {
            self.meta_store.hash_key = key;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = match level.to_ascii_lowercase().as_str() {
                "error" => LogLevel::Error,
                "warn" => LogLevel::Warn,
                "info" => LogLevel::Info,
                "debug" => LogLevel::Debug,
                "trace" => LogLevel::Trace,
                other => return Err(MetaError::Config(format!("invalid LOG_LEVEL {:?}", other))),
            };
        }
        if let Some(interval) = lookup("RECONCILE_INTERVAL_SECS") {
            self.reconcile.interval_secs = interval
                .parse()
                .map_err(|_| MetaError::Config(format!("invalid RECONCILE_INTERVAL_SECS {:?}", interval)))?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("Server port cannot be 0".to_string());
        }

        if self.server.pid.enabled && self.server.pid.path.as_os_str().is_empty() {
            errors.push("Pid file path cannot be empty when the pid file is enabled".to_string());
        }

        if self.sentinel.addresses.is_empty() {
            errors.push("At least one sentinel address is required".to_string());
        }
        for addr in &self.sentinel.addresses {
            if addr.rsplit_once(':').and_then(|(_, p)| p.parse::<u16>().ok()).is_none() {
                errors.push(format!("Sentinel address {:?} is not host:port", addr));
            }
        }
        if self.sentinel.quorum == 0 {
            errors.push("Sentinel quorum cannot be 0".to_string());
        }
        if self.sentinel.event_queue_capacity == 0 {
            errors.push("Event queue capacity cannot be 0".to_string());
        }

        if self.meta_store.instance_name.is_empty() {
            errors.push("Metadata store instance name cannot be empty".to_string());
        }
        if self.meta_store.hash_key.is_empty() {
            errors.push("Metadata hash key cannot be empty".to_string());
        }
        if self.meta_store.version_field.is_empty() || self.meta_store.instance_names_field.is_empty() {
            errors.push("Metadata field names cannot be empty".to_string());
        }
        if self.meta_store.version_field == self.meta_store.instance_names_field {
            errors.push("Version field and instance names field must differ".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn shutdown_duration(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout)
    }

    /// `None` when periodic reconciliation is disabled.
    pub fn reconcile_interval(&self) -> Option<Duration> {
        match self.reconcile.interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl SentinelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl MetaStoreConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Whether `name` collides with one of the bookkeeping fields.
    pub fn is_reserved_field(&self, name: &str) -> bool {
        name == self.version_field || name == self.instance_names_field
    }
}

impl Default for MetaServerConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            sentinel: SentinelConfig::default(),
            meta_store: MetaStoreConfig::default(),
            reconcile: ReconcileConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 10080,
            graceful_shutdown: true,
            shutdown_timeout: 30,
            pid: PidConfig::default(),
        }
    }
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("cluster-meta-server.pid"),
            override_existing: false,
        }
    }
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            addresses: vec!["127.0.0.1:26379".to_string()],
            discovery_seeds: vec!["127.0.0.1".to_string()],
            quorum: 2,
            connect_timeout_ms: 3000,
            command_timeout_ms: 5000,
            reconnect_delay_ms: 1000,
            event_queue_capacity: 256,
        }
    }
}

impl Default for MetaStoreConfig {
    fn default() -> Self {
        Self {
            instance_name: "meta".to_string(),
            hash_key: "cluster_meta".to_string(),
            version_field: "version".to_string(),
            instance_names_field: "instance_name_list".to_string(),
            connect_timeout_ms: 3000,
            command_timeout_ms: 5000,
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Simple,
            file_path: None,
            console: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = MetaServerConfig::default();
        assert_eq!(config.server.port, 10080);
        assert_eq!(config.meta_store.hash_key, "cluster_meta");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = MetaServerConfig::default();
        config.server.port = 0;
        config.sentinel.addresses = vec!["no-port".to_string()];
        config.meta_store.instance_names_field = config.meta_store.version_field.clone();

        let errors = config.validate().unwrap_err();
        assert!(errors.contains(&"Server port cannot be 0".to_string()));
        assert!(errors.iter().any(|e| e.contains("no-port")));
        assert!(errors.contains(&"Version field and instance names field must differ".to_string()));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: MetaServerConfig = toml::from_str(
            r#"
            [sentinel]
            addresses = ["10.0.0.1:26380", "10.0.0.2:26380"]

            [meta_store]
            instance_name = "meta_db"
            "#,
        )
        .unwrap();
        assert_eq!(config.sentinel.addresses.len(), 2);
        assert_eq!(config.sentinel.quorum, 2);
        assert_eq!(config.meta_store.instance_name, "meta_db");
        assert_eq!(config.meta_store.version_field, "version");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SERVER_PORT", "18080"),
            ("SENTINELS", "10.0.0.1:26379, 10.0.0.2:26379"),
            ("LOG_LEVEL", "debug"),
            ("RECONCILE_INTERVAL_SECS", "0"),
        ]
        .into_iter()
        .collect();

        let mut config = MetaServerConfig::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.server.port, 18080);
        assert_eq!(config.sentinel.addresses, vec!["10.0.0.1:26379", "10.0.0.2:26379"]);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.reconcile_interval(), None);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = MetaServerConfig::default();
        let result = config.apply_overrides(|name| (name == "SERVER_PORT").then(|| "abc".to_string()));
        assert!(matches!(result, Err(MetaError::Config(_))));
    }

    #[test]
    fn test_reserved_fields() {
        let config = MetaStoreConfig::default();
        assert!(config.is_reserved_field("version"));
        assert!(config.is_reserved_field("instance_name_list"));
        assert!(!config.is_reserved_field("cache1"));
    }
}
