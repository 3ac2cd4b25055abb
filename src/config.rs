//! # Node Configuration
//!
//! TOML-backed configuration for a cluster node. Every node in the cluster
//! ships the same static `[nodes]` map; membership never changes at runtime.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::types::{OrchestratorError, OrchestratorResult};

/// Configuration for a single orchestrator node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name of this node. Must be a key in `nodes`. May be overridden by the
    /// `NODE_NAME` environment variable.
    pub node_name: String,

    /// Address the HTTP server binds to, e.g. `0.0.0.0:8080`.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path to the embedded SQLite database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Static cluster membership: node name -> base URL.
    /// An empty map means single-node operation.
    #[serde(default)]
    pub nodes: BTreeMap<String, String>,

    /// Seconds between health probes of peer nodes.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Timeout in seconds for node-to-node HTTP calls (probes and proxying).
    #[serde(default = "default_internal_timeout_secs")]
    pub internal_timeout_secs: u64,

    /// Consecutive probe failures before a peer is marked unhealthy.
    #[serde(default = "default_health_fail_threshold")]
    pub health_fail_threshold: u32,

    /// Number of worker OS processes this node supervises.
    #[serde(default = "default_worker_processes")]
    pub worker_processes: usize,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Seconds a job may sit in `processing` without updates before the
    /// watchdog requeues it.
    #[serde(default = "default_stale_job_timeout_secs")]
    pub stale_job_timeout_secs: u64,

    /// Seconds between watchdog sweeps.
    #[serde(default = "default_stale_check_interval_secs")]
    pub stale_check_interval_secs: u64,

    /// Seconds to wait after SIGTERM before force-killing a worker.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Maximum accepted upload size, in megabytes.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,

    /// Directory uploaded files are written to.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
}

fn default_node_name() -> String {
    "node-1".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> String {
    "classd.db".to_string()
}

fn default_health_check_interval_secs() -> u64 {
    5
}

fn default_internal_timeout_secs() -> u64 {
    5
}

fn default_health_fail_threshold() -> u32 {
    1
}

fn default_worker_processes() -> usize {
    1
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_stale_job_timeout_secs() -> u64 {
    600
}

fn default_stale_check_interval_secs() -> u64 {
    60
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_max_upload_mb() -> usize {
    500
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

impl NodeConfig {
    /// Load configuration from a TOML file, apply environment overrides and
    /// validate it.
    ///
    /// A missing file is not an error: the node comes up single-node with
    /// defaults, matching a fresh install with no cluster to join.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str::<NodeConfig>(&raw)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %path.display(),
                    "config file not found, starting single-node with defaults"
                );
                Self::defaults(default_node_name(), default_database_path())
            }
            Err(err) => return Err(err.into()),
        };
        if let Ok(name) = std::env::var("NODE_NAME") {
            if !name.is_empty() {
                if name != config.node_name {
                    warn!(
                        configured = %config.node_name,
                        env = %name,
                        "NODE_NAME environment variable overrides configured node name"
                    );
                }
                config.node_name = name;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate cluster membership and numeric bounds.
    ///
    /// With an empty `[nodes]` map the node runs single-node: it is inserted
    /// into its own membership map with a loopback URL so the dispatcher and
    /// proxy never need a special case. A membership map carrying invalid
    /// peer URLs is dropped with an error log and the node degrades to
    /// single-node rather than refusing to start.
    pub fn validate(&mut self) -> OrchestratorResult<()> {
        if self.node_name.is_empty() {
            return Err(OrchestratorError::Configuration(
                "node_name must not be empty".to_string(),
            ));
        }
        if self.node_name.contains('/') || self.node_name.contains(char::is_whitespace) {
            return Err(OrchestratorError::Configuration(format!(
                "node_name {:?} contains invalid characters",
                self.node_name
            )));
        }
        if self.worker_processes == 0 {
            return Err(OrchestratorError::Configuration(
                "worker_processes must be at least 1".to_string(),
            ));
        }
        if !self.nodes.is_empty() {
            if !self.nodes.contains_key(&self.node_name) {
                return Err(OrchestratorError::Configuration(format!(
                    "node_name {:?} is not a key of the [nodes] map",
                    self.node_name
                )));
            }
            let invalid: Vec<(String, String)> = self
                .nodes
                .iter()
                .filter(|(_, url)| !url.starts_with("http://") && !url.starts_with("https://"))
                .map(|(name, url)| (name.clone(), url.clone()))
                .collect();
            if !invalid.is_empty() {
                for (name, url) in &invalid {
                    error!(node = %name, url = %url, "invalid peer url in [nodes]");
                }
                error!("dropping cluster membership, continuing single-node");
                self.nodes.clear();
            }
        }
        if self.nodes.is_empty() {
            self.nodes.insert(
                self.node_name.clone(),
                format!("http://127.0.0.1:{}", self.listen_port()),
            );
        }
        Ok(())
    }

    /// Base URL of a peer, if configured.
    pub fn node_url(&self, name: &str) -> Option<&str> {
        self.nodes.get(name).map(|u| u.as_str())
    }

    /// Node names in configured (deterministic) order.
    pub fn node_order(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    /// Resolve the owner of a job id by prefix-matching against configured
    /// node names. Longest match wins so `node-a` never claims `node-ab`'s
    /// jobs.
    pub fn owner_of(&self, job_id: &crate::types::JobId) -> Option<&str> {
        self.nodes
            .keys()
            .filter(|name| job_id.is_owned_by(name))
            .max_by_key(|name| name.len())
            .map(|s| s.as_str())
    }

    fn listen_port(&self) -> u16 {
        self.listen_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080)
    }

    /// All-defaults config with an empty membership map. Not yet validated.
    fn defaults(node_name: String, database_path: String) -> Self {
        NodeConfig {
            node_name,
            listen_addr: default_listen_addr(),
            database_path,
            nodes: BTreeMap::new(),
            health_check_interval_secs: default_health_check_interval_secs(),
            internal_timeout_secs: default_internal_timeout_secs(),
            health_fail_threshold: default_health_fail_threshold(),
            worker_processes: default_worker_processes(),
            busy_timeout_ms: default_busy_timeout_ms(),
            stale_job_timeout_secs: default_stale_job_timeout_secs(),
            stale_check_interval_secs: default_stale_check_interval_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            max_upload_mb: default_max_upload_mb(),
            upload_dir: default_upload_dir(),
        }
    }

    /// A minimal single-node config used by tests and the worker binary
    /// default path.
    pub fn single_node(name: &str, database_path: &str) -> Self {
        let mut config = Self::defaults(name.to_string(), database_path.to_string());
        // Infallible with an empty map.
        let _ = config.validate();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;

    fn three_node_config() -> NodeConfig {
        let raw = r#"
            node_name = "node-a"
            listen_addr = "0.0.0.0:9000"
            database_path = "test.db"

            [nodes]
            node-a = "http://10.0.0.1:9000"
            node-b = "http://10.0.0.2:9000"
            node-c = "http://10.0.0.3:9000"
        "#;
        let mut config: NodeConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        config
    }

    #[test]
    fn parses_and_applies_defaults() {
        let config = three_node_config();
        assert_eq!(config.node_name, "node-a");
        assert_eq!(config.health_check_interval_secs, 5);
        assert_eq!(config.worker_processes, 1);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert_eq!(config.stale_job_timeout_secs, 600);
        assert_eq!(config.nodes.len(), 3);
    }

    #[test]
    fn rejects_name_missing_from_membership() {
        let raw = r#"
            node_name = "node-x"
            [nodes]
            node-a = "http://10.0.0.1:9000"
        "#;
        let mut config: NodeConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_peer_url_degrades_to_single_node() {
        let raw = r#"
            node_name = "node-a"
            listen_addr = "0.0.0.0:9000"
            [nodes]
            node-a = "http://10.0.0.1:9000"
            node-b = "10.0.0.2:9000"
        "#;
        let mut config: NodeConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        // Membership is dropped, the node keeps running alone.
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.node_url("node-a"), Some("http://127.0.0.1:9000"));
    }

    #[test]
    fn missing_config_file_falls_back_to_single_node() {
        let config = NodeConfig::load("/definitely/not/there.toml").unwrap();
        assert_eq!(config.nodes.len(), 1);
        assert!(config.nodes.contains_key(&config.node_name));
        assert_eq!(config.worker_processes, 1);
    }

    #[test]
    fn empty_membership_falls_back_to_single_node() {
        let raw = r#"
            node_name = "solo"
            listen_addr = "0.0.0.0:8123"
        "#;
        let mut config: NodeConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.node_url("solo"), Some("http://127.0.0.1:8123"));
    }

    #[test]
    fn owner_resolution_prefers_longest_prefix() {
        let raw = r#"
            node_name = "node-a"
            [nodes]
            node-a = "http://10.0.0.1:9000"
            node-a-east = "http://10.0.0.2:9000"
        "#;
        let mut config: NodeConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        let id = JobId::from("node-a-east-1234");
        assert_eq!(config.owner_of(&id), Some("node-a-east"));
        let id = JobId::from("node-a-1234");
        assert_eq!(config.owner_of(&id), Some("node-a"));
        let id = JobId::from("stranger-1234");
        assert_eq!(config.owner_of(&id), None);
    }
}
