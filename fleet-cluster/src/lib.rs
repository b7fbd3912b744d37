//! Fleet Cluster - Membership and lifecycle coordination for sharded server fleets
//!
//! A fixed set of node processes forms a cluster under one leader. The leader
//! dictates which nodes belong to the active topology; every node then brings
//! up its local shards of each service group in lock-step with its peers and
//! tears them down again in reverse order.
//!
//! # Architecture
//!
//! - **Topology**: Node sets, addressing and the shard-to-node mapping
//! - **Connection**: Handshakes, leader-driven topology formation, cluster change events
//! - **Coordinator**: Node lifecycle state machine with cluster-wide start/stop barriers
//! - **Service**: Host interface that creates, starts and stops shards
//! - **Transport**: Length-delimited TCP, plus an in-memory network for tests
//!
//! # Key Operations
//!
//! - Topology queries: node counts, shard ownership, address enumeration
//! - Membership: peer handshakes, restart detection, grace window for lost nodes
//! - Lifecycle: ordered group start, node-only or cluster-wide shutdown, kick handling
//! - Fatal faults mapped to process exit codes

pub mod config;
pub mod connection;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod node_info;
pub mod protocol;
pub mod service;
pub mod topology;
pub mod transport;

pub use config::{ClusterConfig, ServiceGroupConfig, WorkloadConfig};
pub use connection::{
    ClusterChangedEvent, ClusterDebugStatus, ClusterMember, ConnectionManager,
    ConnectionManagerHandle,
};
pub use context::ClusterContext;
pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorStatus};
pub use error::{ClusterError, ClusterFault, Result};
pub use node_info::{NodeInfo, NodeLifecyclePhase, ServiceGroupPhase, ShardHandle};
pub use protocol::{BuildInfo, PeerMessage};
pub use service::{ServiceGroupError, ServiceGroupHost};
pub use topology::{
    AddressingMode, ClusterTopologySpec, NodeAddress, NodeSetSpec, ScalingMode, ShardId,
    WorkloadKind, WorkloadKindMask,
};
pub use transport::{MemoryNetwork, MemoryTransport, TcpTransport, Transport, TransportEvent};
