//! # Node Registry
//!
//! Tracks the health of every configured peer. A background loop probes each
//! peer's `/health` endpoint on a fixed interval; the rest of the node only
//! ever reads the resulting map. The local node is always healthy from its
//! own point of view.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cluster::proxy::ClusterClient;
use crate::config::NodeConfig;

/// Health record for one peer.
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Default for NodeHealth {
    fn default() -> Self {
        // Peers start healthy so a freshly booted node does not refuse
        // dispatch before the first probe pass completes.
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_checked: None,
        }
    }
}

/// Shared view of cluster membership and peer health.
#[derive(Clone)]
pub struct NodeRegistry {
    config: Arc<NodeConfig>,
    health: Arc<RwLock<HashMap<String, NodeHealth>>>,
}

impl NodeRegistry {
    pub fn new(config: Arc<NodeConfig>) -> Self {
        let health = config
            .nodes
            .keys()
            .map(|name| (name.clone(), NodeHealth::default()))
            .collect();
        Self {
            config,
            health: Arc::new(RwLock::new(health)),
        }
    }

    /// Whether `name` should receive traffic. The local node never reports
    /// itself unhealthy.
    pub async fn is_healthy(&self, name: &str) -> bool {
        if name == self.config.node_name {
            return true;
        }
        self.health
            .read()
            .await
            .get(name)
            .map(|h| h.healthy)
            .unwrap_or(false)
    }

    /// Full health snapshot for `/cluster/nodes`.
    pub async fn snapshot(&self) -> HashMap<String, NodeHealth> {
        let mut snapshot = self.health.read().await.clone();
        if let Some(own) = snapshot.get_mut(&self.config.node_name) {
            own.healthy = true;
            own.consecutive_failures = 0;
        }
        snapshot
    }

    /// Record one probe outcome. Public so tests can drive health
    /// transitions without a network.
    pub async fn record_probe(&self, name: &str, ok: bool) {
        let mut health = self.health.write().await;
        let entry = health.entry(name.to_string()).or_default();
        entry.last_checked = Some(Utc::now());
        if ok {
            if !entry.healthy {
                info!(node = name, "peer recovered");
            }
            entry.healthy = true;
            entry.consecutive_failures = 0;
        } else {
            entry.consecutive_failures += 1;
            let newly_down =
                entry.healthy && entry.consecutive_failures >= self.config.health_fail_threshold;
            if newly_down {
                entry.healthy = false;
                warn!(
                    node = name,
                    failures = entry.consecutive_failures,
                    "peer marked unhealthy"
                );
            }
        }
    }

    /// One concurrent probe pass over all peers.
    pub async fn probe_all(&self, client: &ClusterClient) {
        let peers: Vec<(String, String)> = self
            .config
            .nodes
            .iter()
            .filter(|(name, _)| **name != self.config.node_name)
            .map(|(name, url)| (name.clone(), url.clone()))
            .collect();

        let probes = peers.into_iter().map(|(name, url)| {
            let client = client.clone();
            async move {
                let ok = client.probe(&url).await;
                (name, ok)
            }
        });

        for (name, ok) in futures::future::join_all(probes).await {
            debug!(node = %name, ok, "probe");
            self.record_probe(&name, ok).await;
        }
    }

    /// Background health-check loop. Runs until the process exits.
    pub async fn run(self, client: ClusterClient) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.health_check_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            self.probe_all(&client).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn registry() -> NodeRegistry {
        let raw = r#"
            node_name = "node-a"
            [nodes]
            node-a = "http://10.0.0.1:9000"
            node-b = "http://10.0.0.2:9000"
        "#;
        let mut config: NodeConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        NodeRegistry::new(Arc::new(config))
    }

    #[tokio::test]
    async fn peers_start_healthy() {
        let registry = registry();
        assert!(registry.is_healthy("node-a").await);
        assert!(registry.is_healthy("node-b").await);
        assert!(!registry.is_healthy("node-z").await);
    }

    #[tokio::test]
    async fn failed_probe_marks_peer_down_and_recovery_resets() {
        let registry = registry();
        registry.record_probe("node-b", false).await;
        assert!(!registry.is_healthy("node-b").await);

        registry.record_probe("node-b", true).await;
        assert!(registry.is_healthy("node-b").await);
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot["node-b"].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn self_is_always_healthy() {
        let registry = registry();
        registry.record_probe("node-a", false).await;
        assert!(registry.is_healthy("node-a").await);
        let snapshot = registry.snapshot().await;
        assert!(snapshot["node-a"].healthy);
    }
}
