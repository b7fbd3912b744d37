//! Locally published cluster events and debug snapshots

use crate::node_info::NodeInfo;
use crate::topology::NodeAddress;
use serde::Serialize;

/// One member of the active topology as seen by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterMember {
    pub address: NodeAddress,
    /// Handshake complete, or this node itself
    pub is_connected: bool,
    /// Latest published info. Only set when connected.
    pub info: Option<NodeInfo>,
}

/// Published whenever the active topology changes or a member's info changes.
///
/// `event_id` is strictly increasing across all events of one process, including
/// ones caused by info changes only. Compare `topology_id` to tell whether two
/// events describe the same topology version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterChangedEvent {
    pub members: Vec<ClusterMember>,
    pub event_id: i64,
    pub topology_id: i64,
}

impl ClusterChangedEvent {
    pub fn member(&self, address: &NodeAddress) -> Option<&ClusterMember> {
        self.members.iter().find(|m| &m.address == address)
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.member(address).is_some()
    }

    pub fn all_connected(&self) -> bool {
        self.members.iter().all(|m| m.is_connected)
    }

    pub fn connected_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_connected).count()
    }

    /// Info of every connected member
    pub fn connected_infos(&self) -> impl Iterator<Item = &NodeInfo> {
        self.members.iter().filter_map(|m| m.info.as_ref())
    }
}

/// Point-in-time view for admin tooling
#[derive(Debug, Clone, Serialize)]
pub struct ClusterDebugStatus {
    /// Every associated peer, handshake complete or not
    pub connected_peers: Vec<NodeAddress>,
    pub current: Option<ClusterChangedEvent>,
    /// Human readable topology, see `ConnectionManager::describe_topology`
    pub description: String,
}
