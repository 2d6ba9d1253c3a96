//! Node configuration.
//!
//! One TOML file configures both roles: the master reads every section;
//! a worker spawned by the master reads the same file (its path travels
//! through the environment) so the profession catalog and socket layout
//! agree across the process boundary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::profession::{DriverDetail, Profession};

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Could not read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was read.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but describes an unusable deployment.
    #[error("invalid config: {reason}")]
    Invalid {
        /// What failed validation.
        reason: String,
    },

    /// Serialization back to TOML failed.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NodeConfig {
    /// Node name used in logs and the status endpoint.
    pub node_name: String,
    /// Pid file for the master process.
    pub pid_file: PathBuf,
    /// Directory holding per-worker RPC sockets.
    pub socket_dir: PathBuf,
    /// Optional log file; stderr only when unset.
    pub log_file: Option<PathBuf>,
    /// Default log filter, overridden by `RUST_LOG` and the CLI.
    pub log_level: String,
    /// Admin listener pool.
    pub admin: AdminConfig,
    /// Gateway listener pool.
    pub gateway: GatewayConfig,
    /// Worker pool sizing and timeouts.
    pub workers: WorkerPoolConfig,
    /// Profession catalog seeded into both roles.
    pub professions: Vec<Profession>,
}

/// Admin (control) listener pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AdminConfig {
    /// Addresses the admin surface listens on.
    pub listen: Vec<String>,
    /// Bounded wait for in-flight admin requests at shutdown.
    #[serde(with = "duration_serde")]
    pub shutdown_grace: Duration,
}

/// Gateway (data) listener pool, held warm across generations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GatewayConfig {
    /// Public addresses the gateway owns.
    pub listen: Vec<String>,
}

/// Worker pool sizing and timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerPoolConfig {
    /// Number of worker processes.
    pub count: u32,
    /// First worker port; worker `i` is assigned `base_port + i`.
    pub base_port: u16,
    /// Interval between reconcile passes (ping + refresh).
    #[serde(with = "duration_serde")]
    pub ping_interval: Duration,
    /// Per-ping deadline.
    #[serde(with = "duration_serde")]
    pub ping_timeout: Duration,
    /// Per-call deadline for check and commit pushes.
    #[serde(with = "duration_serde")]
    pub push_timeout: Duration,
    /// How long a fresh worker may take to answer its first ping.
    #[serde(with = "duration_serde")]
    pub start_deadline: Duration,
    /// SIGTERM-to-SIGKILL window at shutdown.
    #[serde(with = "duration_serde")]
    pub stop_deadline: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            pid_file: default_pid_file(),
            socket_dir: default_socket_dir(),
            log_file: None,
            log_level: default_log_level(),
            admin: AdminConfig::default(),
            gateway: GatewayConfig::default(),
            workers: WorkerPoolConfig::default(),
            professions: default_professions(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            listen: vec!["127.0.0.1:9400".to_string()],
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:8080".to_string()],
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            count: 1,
            base_port: 8081,
            ping_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
            push_timeout: Duration::from_secs(10),
            start_deadline: Duration::from_secs(10),
            stop_deadline: Duration::from_secs(5),
        }
    }
}

fn default_node_name() -> String {
    "gatehouse".to_string()
}

fn default_pid_file() -> PathBuf {
    std::env::temp_dir().join("gatehoused.pid")
}

fn default_socket_dir() -> PathBuf {
    std::env::temp_dir().join("gatehouse")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_professions() -> Vec<Profession> {
    vec![
        Profession {
            name: "auth".to_string(),
            drivers: vec![DriverDetail {
                name: "basic".to_string(),
                label: "Basic credential check".to_string(),
                description: String::new(),
                required: vec!["users".to_string()],
            }],
        },
        Profession {
            name: "router".to_string(),
            drivers: vec![DriverDetail {
                name: "http".to_string(),
                label: "HTTP route table".to_string(),
                description: String::new(),
                required: vec!["listen".to_string()],
            }],
        },
    ]
}

impl NodeConfig {
    /// Loads and validates configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parses and validates configuration from TOML text.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Rejects configurations that cannot describe a running deployment.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin.listen.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "admin.listen must name at least one address".to_string(),
            });
        }
        for address in self.admin.listen.iter().chain(&self.gateway.listen) {
            if address.parse::<std::net::SocketAddr>().is_err() {
                return Err(ConfigError::Invalid {
                    reason: format!("listen address {address:?} is not a socket address"),
                });
            }
        }

        if self.workers.count == 0 {
            return Err(ConfigError::Invalid {
                reason: "workers.count must be at least 1".to_string(),
            });
        }
        if self.workers.count > 256 {
            return Err(ConfigError::Invalid {
                reason: format!("workers.count {} exceeds the supported maximum 256", self.workers.count),
            });
        }
        let highest = u32::from(self.workers.base_port) + self.workers.count - 1;
        if highest > u32::from(u16::MAX) {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "workers.base_port {} with count {} overflows the port range",
                    self.workers.base_port, self.workers.count
                ),
            });
        }

        for profession in &self.professions {
            if profession.name.is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "profession names must be non-empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Ports assigned to worker `index`.
    #[must_use]
    pub fn worker_ports(&self, index: u32) -> Vec<u16> {
        vec![(u32::from(self.workers.base_port) + index) as u16]
    }

    /// RPC socket path for worker `id` of process generation
    /// `generation`. The generation segment keeps a succeeding master
    /// from crossing wires with its predecessor's workers while both
    /// are briefly alive.
    #[must_use]
    pub fn worker_socket_path(&self, generation: u64, id: u32) -> PathBuf {
        self.socket_dir
            .join(format!("gatehouse-worker-{generation}-{id}.sock"))
    }
}

/// Serde adapter storing durations as humantime strings ("5s", "250ms").
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NodeConfig::default();
        config.validate().expect("default config must validate");
        assert_eq!(config.workers.count, 1);
        assert!(!config.professions.is_empty());
    }

    #[test]
    fn test_from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatehouse.toml");
        std::fs::write(&path, "node_name = \"from-disk\"\n").unwrap();

        let config = NodeConfig::from_file(&path).unwrap();
        assert_eq!(config.node_name, "from-disk");

        let missing = NodeConfig::from_file(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = NodeConfig::default();
        let raw = config.to_toml().unwrap();
        let parsed = NodeConfig::from_toml(&raw).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_parses_durations_and_sections() {
        let raw = r#"
            node_name = "edge-1"
            log_level = "debug"

            [admin]
            listen = ["127.0.0.1:9500"]
            shutdown_grace = "1s 500ms"

            [gateway]
            listen = ["0.0.0.0:80", "0.0.0.0:443"]

            [workers]
            count = 3
            base_port = 9100
            ping_interval = "250ms"
        "#;

        let config = NodeConfig::from_toml(raw).unwrap();
        assert_eq!(config.node_name, "edge-1");
        assert_eq!(config.admin.shutdown_grace, Duration::from_millis(1500));
        assert_eq!(config.workers.count, 3);
        assert_eq!(config.workers.ping_interval, Duration::from_millis(250));
        // Unspecified fields keep their defaults.
        assert_eq!(config.workers.ping_timeout, Duration::from_secs(2));
        assert_eq!(config.gateway.listen.len(), 2);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let raw = r#"
            nodename = "typo"
        "#;
        assert!(matches!(
            NodeConfig::from_toml(raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_unparseable_listen_address() {
        let raw = r#"
            [admin]
            listen = ["not-an-address"]
        "#;
        let err = NodeConfig::from_toml(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_rejects_zero_workers() {
        let raw = r#"
            [workers]
            count = 0
        "#;
        let err = NodeConfig::from_toml(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_rejects_port_range_overflow() {
        let raw = r#"
            [workers]
            count = 10
            base_port = 65530
        "#;
        let err = NodeConfig::from_toml(raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_worker_port_assignment() {
        let config = NodeConfig::default();
        assert_eq!(config.worker_ports(0), vec![8081]);
        assert_eq!(config.worker_ports(2), vec![8083]);
    }

    #[test]
    fn test_worker_socket_path_is_per_generation_and_id() {
        let config = NodeConfig::default();
        let path = config.worker_socket_path(3, 2);
        assert!(path
            .to_string_lossy()
            .ends_with("gatehouse-worker-3-2.sock"));
        assert_ne!(path, config.worker_socket_path(4, 2));
    }
}
