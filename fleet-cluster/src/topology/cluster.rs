//! Whole-cluster topology: the ordered node sets and lookups across them

use super::{AddressingMode, NodeAddress, NodeSetSpec, ShardId, WorkloadKind};
use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Ordered collection of node sets sharing one addressing mode.
///
/// Node set order is significant: the `node_set_index` of a [`ShardId`] counts
/// only the node sets hosting that shard's kind, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTopology", into = "RawTopology")]
pub struct ClusterTopologySpec {
    mode: AddressingMode,
    node_sets: Vec<NodeSetSpec>,
}

#[derive(Serialize, Deserialize)]
struct RawTopology {
    #[serde(default)]
    mode: AddressingMode,
    node_sets: Vec<NodeSetSpec>,
}

impl TryFrom<RawTopology> for ClusterTopologySpec {
    type Error = ClusterError;

    fn try_from(raw: RawTopology) -> Result<Self> {
        Self::new(raw.mode, raw.node_sets)
    }
}

impl From<ClusterTopologySpec> for RawTopology {
    fn from(spec: ClusterTopologySpec) -> Self {
        RawTopology {
            mode: spec.mode,
            node_sets: spec.node_sets,
        }
    }
}

impl ClusterTopologySpec {
    /// Build and validate a topology. Every node set adopts `mode`.
    pub fn new(mode: AddressingMode, mut node_sets: Vec<NodeSetSpec>) -> Result<Self> {
        for node_set in &mut node_sets {
            node_set.set_mode(mode);
        }
        let spec = Self { mode, node_sets };
        spec.validate()?;
        Ok(spec)
    }

    /// Single-node topology used when clustering is disabled
    pub fn single_node(host: impl Into<String>, port: u16) -> Self {
        Self {
            mode: AddressingMode::Disabled,
            node_sets: vec![NodeSetSpec::new_static(
                AddressingMode::Disabled,
                "all",
                host,
                port,
                "",
                super::WorkloadKindMask::all(),
                1,
            )],
        }
    }

    pub fn mode(&self) -> AddressingMode {
        self.mode
    }

    pub fn node_sets(&self) -> &[NodeSetSpec] {
        &self.node_sets
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_sets.is_empty() {
            return Err(ClusterError::Config(
                "Topology must declare at least one node set".into(),
            ));
        }

        let mut names = HashSet::new();
        for node_set in &self.node_sets {
            node_set.validate()?;
            if !names.insert(node_set.name.as_str()) {
                return Err(ClusterError::Config(format!(
                    "Duplicate node set name '{}'",
                    node_set.name
                )));
            }
        }

        if self.mode == AddressingMode::Disabled && self.node_sets.len() != 1 {
            return Err(ClusterError::Config(
                "Exactly one node set is allowed when clustering is disabled".into(),
            ));
        }
        Ok(())
    }

    /// Node sets hosting `kind`, in declaration order
    pub fn node_sets_for_kind(&self, kind: WorkloadKind) -> Vec<&NodeSetSpec> {
        self.node_sets
            .iter()
            .filter(|node_set| node_set.workloads.is_set(kind))
            .collect()
    }

    pub fn node_set_for_shard(&self, shard: ShardId) -> Result<&NodeSetSpec> {
        self.node_sets_for_kind(shard.kind)
            .get(shard.node_set_index as usize)
            .copied()
            .ok_or_else(|| ClusterError::Topology(format!("No node set found for shard {}", shard)))
    }

    /// Address of the node hosting `shard`, or `None` if it is out of range
    pub fn try_address_for_shard(&self, shard: ShardId) -> Option<NodeAddress> {
        let node_set = self.node_set_for_shard(shard).ok()?;
        if shard.node_index >= node_set.max_node_count() {
            return None;
        }
        Some(node_set.resolve_address(shard.node_index))
    }

    pub fn address_for_shard(&self, shard: ShardId) -> Result<NodeAddress> {
        self.try_address_for_shard(shard).ok_or_else(|| {
            ClusterError::Topology(format!("No node address found for shard {}", shard))
        })
    }

    /// Node set owning `address`, with the node index within it
    pub fn node_set_for_address(&self, address: &NodeAddress) -> Option<(&NodeSetSpec, u32)> {
        self.node_sets.iter().find_map(|node_set| {
            node_set
                .resolve_index(address)
                .map(|index| (node_set, index))
        })
    }

    pub fn node_set_by_name(&self, name: &str) -> Option<&NodeSetSpec> {
        self.node_sets.iter().find(|node_set| node_set.name == name)
    }

    /// Convert a linear shard index of `kind` into `(node_set_index, node_index)`.
    ///
    /// Only meaningful when every node set hosting `kind` is statically scaled; a
    /// dynamically scaled node set yields [`ClusterError::InvalidUsage`].
    pub fn linear_index_to_node(&self, kind: WorkloadKind, linear_index: u32) -> Result<(u32, u32)> {
        let mut remaining = linear_index;
        for (node_set_index, node_set) in self.node_sets_for_kind(kind).into_iter().enumerate() {
            let count = node_set.static_node_count().map_err(|_| {
                ClusterError::InvalidUsage(format!(
                    "Cannot use linear shard index for {} with node set '{}', scaling must be static",
                    kind, node_set.name
                ))
            })?;
            if remaining < count {
                return Ok((node_set_index as u32, remaining));
            }
            remaining -= count;
        }

        Err(ClusterError::InvalidUsage(format!(
            "Linear shard index {} out of range for {}",
            linear_index, kind
        )))
    }

    /// Inverse of [`Self::linear_index_to_node`]
    pub fn node_to_linear_index(
        &self,
        kind: WorkloadKind,
        node_set_index: u32,
        node_index: u32,
    ) -> Result<u32> {
        let mut linear = 0u32;
        for (cursor, node_set) in self.node_sets_for_kind(kind).into_iter().enumerate() {
            let count = node_set.static_node_count().map_err(|_| {
                ClusterError::InvalidUsage(format!(
                    "Cannot use linear shard index for {} with node set '{}', scaling must be static",
                    kind, node_set.name
                ))
            })?;
            if cursor as u32 == node_set_index {
                if node_index < count {
                    return Ok(linear + node_index);
                }
                return Err(ClusterError::InvalidUsage(format!(
                    "Node index {} out of range for node set '{}'",
                    node_index, node_set.name
                )));
            }
            linear += count;
        }

        Err(ClusterError::InvalidUsage(format!(
            "Node set index {} out of range for {}",
            node_set_index, kind
        )))
    }

    /// Shard of `kind` hosted at `address`, if the node is in the cluster and hosts that kind
    pub fn resolve_shard_id(&self, kind: WorkloadKind, address: &NodeAddress) -> Option<ShardId> {
        self.node_sets_for_kind(kind)
            .into_iter()
            .enumerate()
            .find_map(|(node_set_index, node_set)| {
                node_set
                    .resolve_index(address)
                    .map(|node_index| ShardId::new(kind, node_set_index as u32, node_index))
            })
    }

    /// Shard of `kind` hosted by node `node_index` of `node_set`, which must be one of
    /// this topology's node sets (compared by identity).
    pub fn resolve_shard_id_at(
        &self,
        kind: WorkloadKind,
        node_set: &NodeSetSpec,
        node_index: u32,
    ) -> Option<ShardId> {
        let (node_set_index, _) = self
            .node_sets_for_kind(kind)
            .into_iter()
            .enumerate()
            .find(|(_, cursor)| std::ptr::eq(*cursor, node_set))?;
        if node_index >= node_set.max_node_count() {
            return None;
        }
        Some(ShardId::new(kind, node_set_index as u32, node_index))
    }

    /// Whether `address` is a valid node position of any node set
    pub fn is_member(&self, address: &NodeAddress) -> bool {
        self.node_set_for_address(address).is_some()
    }
}

impl fmt::Display for ClusterTopologySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mode = {:?}", self.mode)?;
        writeln!(f, "node_sets = [")?;
        for node_set in &self.node_sets {
            write!(f, "{}", node_set)?;
        }
        write!(f, "]")
    }
}
