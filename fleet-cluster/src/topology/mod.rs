//! Static topology and addressing model
//!
//! Pure, side-effect free translation between logical positions in the
//! cluster (workload kind, node set, node index) and network addresses.
//!
//! # Addressing modes
//!
//! - **Disabled**: a single node at a fixed `host:port`
//! - **Static**: nodes share a host and are told apart by port, `host:(base_port + index)`
//! - **Orchestrator**: nodes are told apart by DNS name, `{name}-{index}.{name}{suffix}:base_port`,
//!   which is what a Kubernetes StatefulSet behind a headless service produces
//!
//! # Example
//!
//! ```ignore
//! use fleet_cluster::topology::{AddressingMode, NodeSetSpec, WorkloadKindMask};
//!
//! let logic = NodeSetSpec::new_dynamic_linear(
//!     AddressingMode::Orchestrator, "logic", "logic", 6000, ".svc.cluster.local",
//!     WorkloadKindMask::all(), 1, 5);
//!
//! let address = logic.resolve_address(3);
//! assert_eq!(address.to_string(), "logic-3.logic.svc.cluster.local:6000");
//! assert_eq!(logic.resolve_index(&address), Some(3));
//! ```

mod cluster;
mod node_set;

pub use cluster::ClusterTopologySpec;
pub use node_set::{AddressingMode, NodeSetSpec, ScalingMode};

use crate::error::ClusterError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Network address of a cluster node. Used as a map key throughout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ClusterError::Config(format!("Address '{}' is missing a port", s)))?;
        if host.is_empty() {
            return Err(ClusterError::Config(format!(
                "Address '{}' is missing a host",
                s
            )));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| ClusterError::Config(format!("Invalid port in address '{}': {}", s, e)))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for NodeAddress {
    type Error = ClusterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodeAddress> for String {
    fn from(address: NodeAddress) -> Self {
        address.to_string()
    }
}

/// A logical kind of workload (shard type) that runs on some node sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadKind(pub u8);

impl WorkloadKind {
    /// Number of distinct kinds a [`WorkloadKindMask`] can hold.
    pub const LIMIT: u8 = 64;
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kind#{}", self.0)
    }
}

/// Bitmask of workload kinds placed on a node set.
///
/// Serialized as the list of kind numbers, e.g. `[0, 2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct WorkloadKindMask(u64);

impl WorkloadKindMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn all() -> Self {
        Self(u64::MAX)
    }

    pub fn from_kinds(kinds: impl IntoIterator<Item = WorkloadKind>) -> Self {
        kinds.into_iter().fold(Self::empty(), Self::with)
    }

    /// Returns a copy of this mask with `kind` set. Kinds past [`WorkloadKind::LIMIT`] are ignored.
    pub fn with(self, kind: WorkloadKind) -> Self {
        match 1u64.checked_shl(u32::from(kind.0)) {
            Some(bit) => Self(self.0 | bit),
            None => self,
        }
    }

    pub fn is_set(&self, kind: WorkloadKind) -> bool {
        1u64.checked_shl(u32::from(kind.0))
            .map(|bit| self.0 & bit != 0)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate the set kinds in ascending order
    pub fn kinds(&self) -> impl Iterator<Item = WorkloadKind> + '_ {
        (0..WorkloadKind::LIMIT)
            .map(WorkloadKind)
            .filter(move |kind| self.is_set(*kind))
    }
}

impl TryFrom<Vec<u8>> for WorkloadKindMask {
    type Error = ClusterError;

    fn try_from(kinds: Vec<u8>) -> Result<Self, Self::Error> {
        if let Some(bad) = kinds.iter().find(|k| **k >= WorkloadKind::LIMIT) {
            return Err(ClusterError::Config(format!(
                "Workload kind {} is out of range (max {})",
                bad,
                WorkloadKind::LIMIT - 1
            )));
        }
        Ok(Self::from_kinds(kinds.into_iter().map(WorkloadKind)))
    }
}

impl From<WorkloadKindMask> for Vec<u8> {
    fn from(mask: WorkloadKindMask) -> Self {
        mask.kinds().map(|k| k.0).collect()
    }
}

/// Logical identity of one shard: the `node_index`th node of the
/// `node_set_index`th node set that hosts `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub kind: WorkloadKind,
    pub node_set_index: u32,
    pub node_index: u32,
}

impl ShardId {
    pub fn new(kind: WorkloadKind, node_set_index: u32, node_index: u32) -> Self {
        Self {
            kind,
            node_set_index,
            node_index,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.kind, self.node_set_index, self.node_index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse_and_display() {
        let addr: NodeAddress = "logic-0.logic:6000".parse().unwrap();
        assert_eq!(addr.host, "logic-0.logic");
        assert_eq!(addr.port, 6000);
        assert_eq!(addr.to_string(), "logic-0.logic:6000");
    }

    #[test]
    fn test_address_parse_errors() {
        assert!("no-port".parse::<NodeAddress>().is_err());
        assert!(":6000".parse::<NodeAddress>().is_err());
        assert!("host:99999".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn test_address_serde_as_string() {
        let addr = NodeAddress::new("127.0.0.1", 6001);
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"127.0.0.1:6001\"");
        let back: NodeAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn test_mask_bits() {
        let mask = WorkloadKindMask::from_kinds([WorkloadKind(0), WorkloadKind(5)]);
        assert!(mask.is_set(WorkloadKind(0)));
        assert!(mask.is_set(WorkloadKind(5)));
        assert!(!mask.is_set(WorkloadKind(1)));
        assert_eq!(
            mask.kinds().collect::<Vec<_>>(),
            vec![WorkloadKind(0), WorkloadKind(5)]
        );
        assert!(!WorkloadKindMask::empty().is_set(WorkloadKind(0)));
        assert!(WorkloadKindMask::all().is_set(WorkloadKind(63)));
        assert!(!WorkloadKindMask::all().is_set(WorkloadKind(64)));
    }

    #[test]
    fn test_mask_serde() {
        let mask: WorkloadKindMask = serde_json::from_str("[1, 3]").unwrap();
        assert_eq!(mask.kinds().count(), 2);
        assert!(serde_json::from_str::<WorkloadKindMask>("[64]").is_err());
    }
}
