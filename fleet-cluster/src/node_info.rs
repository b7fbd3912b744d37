//! Per-node information gossiped between cluster members

use crate::topology::WorkloadKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle phase of a node. Ordered: later phases compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeLifecyclePhase {
    Connecting,
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl NodeLifecyclePhase {
    pub const ALL: [NodeLifecyclePhase; 5] = [
        NodeLifecyclePhase::Connecting,
        NodeLifecyclePhase::Starting,
        NodeLifecyclePhase::Running,
        NodeLifecyclePhase::Stopping,
        NodeLifecyclePhase::Terminated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLifecyclePhase::Connecting => "connecting",
            NodeLifecyclePhase::Starting => "starting",
            NodeLifecyclePhase::Running => "running",
            NodeLifecyclePhase::Stopping => "stopping",
            NodeLifecyclePhase::Terminated => "terminated",
        }
    }
}

impl fmt::Display for NodeLifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of one service group on one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceGroupPhase {
    NotCreated,
    Created,
    Running,
}

/// Opaque handle to a locally owned shard, as issued by the service-group host
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardHandle(pub String);

impl fmt::Display for ShardHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Information a node publishes about itself.
///
/// Replaced wholesale on every change; observers never see a partial update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Address clients should use to reach this node, if it serves external traffic
    pub public_address: Option<String>,
    pub phase: NodeLifecyclePhase,
    pub cluster_shutdown_requested: bool,
    /// Phase of each service group, indexed by group
    pub group_phases: Vec<ServiceGroupPhase>,
    pub process_started_at: DateTime<Utc>,
    pub shard_handles: BTreeMap<WorkloadKind, ShardHandle>,
}

impl NodeInfo {
    pub fn new(
        public_address: Option<String>,
        group_count: usize,
        process_started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            public_address,
            phase: NodeLifecyclePhase::Connecting,
            cluster_shutdown_requested: false,
            group_phases: vec![ServiceGroupPhase::NotCreated; group_count],
            process_started_at,
            shard_handles: BTreeMap::new(),
        }
    }

    /// Whether the node has begun leaving the cluster
    pub fn is_shutting_down(&self) -> bool {
        self.phase > NodeLifecyclePhase::Running
    }

    /// Phase of group `index`, `NotCreated` for groups this node does not know
    pub fn group_phase(&self, index: usize) -> ServiceGroupPhase {
        self.group_phases
            .get(index)
            .copied()
            .unwrap_or(ServiceGroupPhase::NotCreated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_ordering() {
        assert!(NodeLifecyclePhase::Connecting < NodeLifecyclePhase::Starting);
        assert!(NodeLifecyclePhase::Running < NodeLifecyclePhase::Stopping);
        assert!(ServiceGroupPhase::NotCreated < ServiceGroupPhase::Created);
        assert!(ServiceGroupPhase::Created < ServiceGroupPhase::Running);
    }

    #[test]
    fn test_structural_equality() {
        let started = Utc::now();
        let a = NodeInfo::new(None, 2, started);
        let mut b = a.clone();
        assert_eq!(a, b);

        b.group_phases[1] = ServiceGroupPhase::Created;
        assert_ne!(a, b);

        let mut c = a.clone();
        c.shard_handles
            .insert(WorkloadKind(0), ShardHandle("global/0".into()));
        assert_ne!(a, c);
    }

    #[test]
    fn test_shutting_down() {
        let mut info = NodeInfo::new(None, 0, Utc::now());
        assert!(!info.is_shutting_down());
        info.phase = NodeLifecyclePhase::Running;
        assert!(!info.is_shutting_down());
        info.phase = NodeLifecyclePhase::Stopping;
        assert!(info.is_shutting_down());
    }

    #[test]
    fn test_group_phase_out_of_range() {
        let info = NodeInfo::new(None, 1, Utc::now());
        assert_eq!(info.group_phase(5), ServiceGroupPhase::NotCreated);
    }
}
