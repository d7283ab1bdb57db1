//! Coordinator configuration.
//!
//! Loaded from a TOML file when one is present, then overridden by
//! `AETHER_*` environment variables. `grpc_port` is the historical name of
//! the client/worker-plane port, kept so existing config files and worker
//! SDK defaults keep working.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoreResult};
use crate::persistence::PersistenceMode;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub persistence: PersistenceConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for every listener.
    pub host: String,
    /// Client/worker-plane port.
    pub grpc_port: u16,
    /// Monitor-plane port.
    pub http_port: u16,
    /// Root of durable state for the snapshot and action-log tiers.
    pub db_path: PathBuf,
    /// Worker heartbeat timeout, seconds.
    pub heartbeat_timeout_secs: u64,
    /// Task visibility timeout, seconds.
    pub visibility_timeout_secs: u64,
    /// How long a cancel waits for the worker, seconds.
    pub cancellation_deadline_secs: u64,
    /// Snapshot-tier flush interval, seconds.
    pub snapshot_interval_secs: u64,
    /// Terminal workflows older than this are removed; absent means keep
    /// forever.
    pub retention_hours: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            grpc_port: 7233,
            http_port: 7234,
            db_path: PathBuf::from("./data/aether"),
            heartbeat_timeout_secs: 30,
            visibility_timeout_secs: 60,
            cancellation_deadline_secs: 10,
            snapshot_interval_secs: 30,
            retention_hours: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// memory | snapshot | state-action-log
    pub mode: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            mode: "memory".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 7236,
        }
    }
}

impl Config {
    /// Read the TOML file at `path` when given (missing explicit paths are
    /// an error; the default path is optional), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    CoordinatorError::Validation(format!(
                        "cannot read config file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                toml::from_str(&raw).map_err(|e| {
                    CoordinatorError::Validation(format!(
                        "invalid config file {}: {}",
                        path.display(),
                        e
                    ))
                })?
            }
            None => {
                let default_path = Path::new("aether.toml");
                if default_path.exists() {
                    let raw = std::fs::read_to_string(default_path)
                        .map_err(|e| CoordinatorError::Validation(e.to_string()))?;
                    toml::from_str(&raw)
                        .map_err(|e| CoordinatorError::Validation(format!("invalid aether.toml: {}", e)))?
                } else {
                    Config::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("AETHER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("AETHER_GRPC_PORT") {
            self.server.grpc_port = port;
        }
        if let Some(port) = env_parse("AETHER_HTTP_PORT") {
            self.server.http_port = port;
        }
        if let Ok(path) = std::env::var("AETHER_DB_PATH") {
            self.server.db_path = PathBuf::from(path);
        }
        if let Ok(mode) = std::env::var("AETHER_PERSISTENCE") {
            self.persistence.mode = mode;
        }
        if let Some(enabled) = env_parse::<bool>("AETHER_METRICS_ENABLED") {
            self.metrics.enabled = enabled;
        }
        if let Some(port) = env_parse("AETHER_METRICS_PORT") {
            self.metrics.port = port;
        }
    }

    pub fn persistence_mode(&self) -> CoreResult<PersistenceMode> {
        self.persistence.mode.parse()
    }

    pub fn grpc_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.grpc_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    pub fn metrics_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.metrics.port)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.server.heartbeat_timeout_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.server.visibility_timeout_secs)
    }

    pub fn cancellation_deadline(&self) -> Duration {
        Duration::from_secs(self.server.cancellation_deadline_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.server.snapshot_interval_secs)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.server
            .retention_hours
            .map(|hours| Duration::from_secs(hours * 3600))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.grpc_port, 7233);
        assert_eq!(config.server.http_port, 7234);
        assert_eq!(config.persistence.mode, "memory");
        assert!(!config.metrics.enabled);
        assert_eq!(config.grpc_addr(), "0.0.0.0:7233");
        assert!(config.retention().is_none());
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
            [server]
            grpc_port = 9233
            http_port = 9234
            db_path = "/var/lib/aether"
            retention_hours = 48

            [persistence]
            mode = "state-action-log"

            [metrics]
            enabled = true
            port = 9236
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.grpc_port, 9233);
        assert_eq!(config.server.db_path, PathBuf::from("/var/lib/aether"));
        assert_eq!(
            config.persistence_mode().unwrap(),
            PersistenceMode::StateActionLog
        );
        assert!(config.metrics.enabled);
        assert_eq!(config.retention(), Some(Duration::from_secs(48 * 3600)));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str("[server]\ngrpc_port = 1234\n").unwrap();
        assert_eq!(config.server.grpc_port, 1234);
        assert_eq!(config.server.http_port, 7234);
        assert_eq!(config.persistence.mode, "memory");
    }

    #[test]
    fn test_invalid_mode_rejected() {
        let config: Config = toml::from_str("[persistence]\nmode = \"postgres\"\n").unwrap();
        assert!(config.persistence_mode().is_err());
    }
}
