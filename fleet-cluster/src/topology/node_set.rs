//! Node set definitions and per-node-set address resolution

use super::{NodeAddress, WorkloadKindMask};
use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How node addresses are derived for the whole cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// Clustering is not in use, the single node lives at `host:port`
    #[default]
    Disabled,
    /// Nodes share a host and are indexed by port: `host:(base_port + index)`
    Static,
    /// Nodes are indexed by DNS name: `{name}-{index}.{name}{suffix}:base_port`
    Orchestrator,
}

/// How many nodes a node set has
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScalingMode {
    /// A fixed number of nodes, indexed `0..node_count`
    Static { node_count: u32 },
    /// Between `min_node_count` and `max_node_count` nodes, always a dense prefix `0..n`
    DynamicLinear {
        min_node_count: u32,
        max_node_count: u32,
    },
}

/// One homogeneous group of nodes sharing an addressing pattern and workload assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSetSpec {
    /// Copied from the owning topology when it is constructed
    #[serde(skip)]
    mode: AddressingMode,

    /// Logical name, also the DNS base name in orchestrator mode
    pub name: String,

    /// Host name used by disabled and static addressing
    pub host: String,

    /// Port of node 0 (static) or of every node (disabled, orchestrator)
    pub base_port: u16,

    /// Appended to every generated host name
    #[serde(default)]
    pub dns_suffix: String,

    /// Workload kinds placed on this node set
    pub workloads: WorkloadKindMask,

    pub scaling: ScalingMode,
}

impl NodeSetSpec {
    #[allow(clippy::too_many_arguments)]
    pub fn new_static(
        mode: AddressingMode,
        name: impl Into<String>,
        host: impl Into<String>,
        base_port: u16,
        dns_suffix: impl Into<String>,
        workloads: WorkloadKindMask,
        node_count: u32,
    ) -> Self {
        Self {
            mode,
            name: name.into(),
            host: host.into(),
            base_port,
            dns_suffix: dns_suffix.into(),
            workloads,
            scaling: ScalingMode::Static { node_count },
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_dynamic_linear(
        mode: AddressingMode,
        name: impl Into<String>,
        host: impl Into<String>,
        base_port: u16,
        dns_suffix: impl Into<String>,
        workloads: WorkloadKindMask,
        min_node_count: u32,
        max_node_count: u32,
    ) -> Self {
        Self {
            mode,
            name: name.into(),
            host: host.into(),
            base_port,
            dns_suffix: dns_suffix.into(),
            workloads,
            scaling: ScalingMode::DynamicLinear {
                min_node_count,
                max_node_count,
            },
        }
    }

    pub fn mode(&self) -> AddressingMode {
        self.mode
    }

    pub(crate) fn set_mode(&mut self, mode: AddressingMode) {
        self.mode = mode;
    }

    pub fn is_static(&self) -> bool {
        matches!(self.scaling, ScalingMode::Static { .. })
    }

    /// Node count of a statically scaled node set
    pub fn static_node_count(&self) -> Result<u32> {
        match self.scaling {
            ScalingMode::Static { node_count } => Ok(node_count),
            ScalingMode::DynamicLinear { .. } => Err(ClusterError::InvalidUsage(format!(
                "Node set '{}' is dynamically scaled and has no static node count",
                self.name
            ))),
        }
    }

    /// `(min, max)` node counts of a dynamically scaled node set
    pub fn dynamic_node_counts(&self) -> Result<(u32, u32)> {
        match self.scaling {
            ScalingMode::DynamicLinear {
                min_node_count,
                max_node_count,
            } => Ok((min_node_count, max_node_count)),
            ScalingMode::Static { .. } => Err(ClusterError::InvalidUsage(format!(
                "Node set '{}' is statically scaled and has no dynamic node counts",
                self.name
            ))),
        }
    }

    /// Upper bound of valid node indices. This is NOT the number of nodes currently
    /// present; subscribe to cluster changes for that.
    pub fn max_node_count(&self) -> u32 {
        match self.scaling {
            ScalingMode::Static { node_count } => node_count,
            ScalingMode::DynamicLinear { max_node_count, .. } => max_node_count,
        }
    }

    /// Number of nodes that are members of every topology
    pub fn min_node_count(&self) -> u32 {
        match self.scaling {
            ScalingMode::Static { node_count } => node_count,
            ScalingMode::DynamicLinear { min_node_count, .. } => min_node_count,
        }
    }

    fn qualified_host(&self) -> String {
        format!("{}{}", self.host, self.dns_suffix)
    }

    /// Address of the node at `node_index`
    pub fn resolve_address(&self, node_index: u32) -> NodeAddress {
        match self.mode {
            AddressingMode::Disabled => NodeAddress::new(self.qualified_host(), self.base_port),
            AddressingMode::Static => {
                let port = u32::from(self.base_port).saturating_add(node_index);
                NodeAddress::new(
                    self.qualified_host(),
                    u16::try_from(port).unwrap_or(u16::MAX),
                )
            }
            AddressingMode::Orchestrator => NodeAddress::new(
                format!(
                    "{name}-{node_index}.{name}{suffix}",
                    name = self.name,
                    suffix = self.dns_suffix
                ),
                self.base_port,
            ),
        }
    }

    /// Node index of `address` within this node set, or `None` if the address does
    /// not follow this node set's pattern or is past the maximum node count.
    pub fn resolve_index(&self, address: &NodeAddress) -> Option<u32> {
        let index = match self.mode {
            AddressingMode::Disabled => {
                if address.host != self.qualified_host() || address.port != self.base_port {
                    return None;
                }
                0
            }
            AddressingMode::Static => {
                if address.host != self.qualified_host() || address.port < self.base_port {
                    return None;
                }
                u32::from(address.port - self.base_port)
            }
            AddressingMode::Orchestrator => {
                if address.port != self.base_port {
                    return None;
                }
                let rest = address.host.strip_prefix(self.name.as_str())?.strip_prefix('-')?;
                let (index, _) = rest.split_once('.')?;
                index.parse::<u32>().ok()?
            }
        };

        if index >= self.max_node_count() {
            return None;
        }

        // Reject non-canonical spellings ("01", "+1") and mismatching domains.
        if self.resolve_address(index) != *address {
            return None;
        }

        Some(index)
    }

    pub fn owns_address(&self, address: &NodeAddress) -> bool {
        self.resolve_index(address).is_some()
    }

    /// Check counts and port ranges
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ClusterError::Config("Node set name must not be empty".into()));
        }

        match self.scaling {
            ScalingMode::Static { node_count } if node_count == 0 => {
                return Err(ClusterError::Config(format!(
                    "Node set '{}' must have at least one node",
                    self.name
                )));
            }
            ScalingMode::DynamicLinear {
                min_node_count,
                max_node_count,
            } => {
                if max_node_count == 0 {
                    return Err(ClusterError::Config(format!(
                        "Node set '{}' must allow at least one node",
                        self.name
                    )));
                }
                if min_node_count > max_node_count {
                    return Err(ClusterError::Config(format!(
                        "Node set '{}' has min_node_count {} > max_node_count {}",
                        self.name, min_node_count, max_node_count
                    )));
                }
            }
            _ => {}
        }

        match self.mode {
            AddressingMode::Disabled if self.max_node_count() != 1 => {
                Err(ClusterError::Config(format!(
                    "Node set '{}' must have exactly one node when clustering is disabled",
                    self.name
                )))
            }
            AddressingMode::Static
                if u32::from(self.base_port) + self.max_node_count() - 1
                    > u32::from(u16::MAX) =>
            {
                Err(ClusterError::Config(format!(
                    "Node set '{}' port range {}+{} does not fit in the port space",
                    self.name,
                    self.base_port,
                    self.max_node_count()
                )))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for NodeSetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  {} {{", self.name)?;
        writeln!(f, "    host = {}", self.host)?;
        writeln!(f, "    base_port = {}", self.base_port)?;
        writeln!(f, "    dns_suffix = {}", self.dns_suffix)?;
        writeln!(
            f,
            "    workloads = {:?}",
            self.workloads.kinds().map(|k| k.0).collect::<Vec<_>>()
        )?;
        match self.scaling {
            ScalingMode::Static { node_count } => {
                writeln!(f, "    scaling = static")?;
                writeln!(f, "    node_count = {}", node_count)?;
            }
            ScalingMode::DynamicLinear {
                min_node_count,
                max_node_count,
            } => {
                writeln!(f, "    scaling = dynamic_linear")?;
                writeln!(f, "    min_node_count = {}", min_node_count)?;
                writeln!(f, "    max_node_count = {}", max_node_count)?;
            }
        }
        writeln!(f, "  }}")
    }
}
