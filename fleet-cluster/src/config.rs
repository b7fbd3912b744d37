//! Cluster configuration

use crate::error::{ClusterError, Result};
use crate::topology::{ClusterTopologySpec, NodeAddress, NodeSetSpec, WorkloadKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main cluster configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClusterConfig {
    /// Address this node is known by. Must be a position of some node set.
    pub self_address: NodeAddress,

    /// Local socket to listen on. Defaults to all interfaces at the self address port.
    #[serde(default)]
    pub bind_addr: Option<SocketAddr>,

    /// Whether this node dictates the topology
    #[serde(default)]
    pub is_leader: bool,

    /// Shared secret. Handshakes with a different cookie are rejected.
    #[serde(default = "default_cookie")]
    pub cookie: String,

    /// Address clients should use to reach this node
    #[serde(default)]
    pub public_address: Option<String>,

    /// Reconciliation tick interval in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// How long an unexpectedly lost member keeps its topology slot, in milliseconds
    #[serde(default = "default_grace_window")]
    pub grace_window_ms: u64,

    /// Hard limit for all shards of a group to report ready, in milliseconds
    #[serde(default = "default_shard_ready_timeout")]
    pub shard_ready_timeout_ms: u64,

    pub topology: ClusterTopologySpec,

    /// Service groups in start order. Stopped in reverse.
    #[serde(default)]
    pub service_groups: Vec<ServiceGroupConfig>,
}

/// An ordered group of workloads started and stopped together across the cluster
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceGroupConfig {
    pub name: String,
    pub workloads: Vec<WorkloadConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkloadConfig {
    pub kind: WorkloadKind,

    /// Name used in logs and metrics
    pub name: String,

    /// Time allowed for one shard of this workload to stop, in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

fn default_cookie() -> String {
    "fleet".to_string()
}

fn default_tick_interval() -> u64 {
    5000
}

fn default_grace_window() -> u64 {
    60_000
}

fn default_shard_ready_timeout() -> u64 {
    300_000
}

fn default_shutdown_timeout() -> u64 {
    30_000
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            self_address: NodeAddress::new("127.0.0.1", 6000),
            bind_addr: None,
            is_leader: true,
            cookie: default_cookie(),
            public_address: None,
            tick_interval_ms: default_tick_interval(),
            grace_window_ms: default_grace_window(),
            shard_ready_timeout_ms: default_shard_ready_timeout(),
            topology: ClusterTopologySpec::single_node("127.0.0.1", 6000),
            service_groups: Vec::new(),
        }
    }
}

impl WorkloadConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl ClusterConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: ClusterConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.topology.validate()?;

        if self.cookie.is_empty() {
            return Err(ClusterError::Config("Cluster cookie must not be empty".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ClusterError::Config("tick_interval_ms must be positive".into()));
        }
        if self.self_node_set().is_none() {
            return Err(ClusterError::Config(format!(
                "Self address {} does not belong to any node set",
                self.self_address
            )));
        }

        let mut group_names = HashSet::new();
        let mut declared = HashSet::new();
        for group in &self.service_groups {
            if !group_names.insert(group.name.as_str()) {
                return Err(ClusterError::Config(format!(
                    "Duplicate service group '{}'",
                    group.name
                )));
            }
            for workload in &group.workloads {
                if workload.kind.0 >= WorkloadKind::LIMIT {
                    return Err(ClusterError::Config(format!(
                        "Workload '{}' has out of range {}",
                        workload.name, workload.kind
                    )));
                }
                if !declared.insert(workload.kind) {
                    return Err(ClusterError::Config(format!(
                        "Workload {} is declared in more than one service group",
                        workload.kind
                    )));
                }
                if self.topology.node_sets_for_kind(workload.kind).is_empty() {
                    return Err(ClusterError::Config(format!(
                        "Workload '{}' ({}) is not hosted by any node set",
                        workload.name, workload.kind
                    )));
                }
            }
        }

        Ok(())
    }

    /// Node set this node belongs to
    pub fn self_node_set(&self) -> Option<&NodeSetSpec> {
        self.topology
            .node_set_for_address(&self.self_address)
            .map(|(node_set, _)| node_set)
    }

    /// Socket to listen on for cluster traffic
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], self.self_address.port)))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn shard_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_ready_timeout_ms)
    }
}
