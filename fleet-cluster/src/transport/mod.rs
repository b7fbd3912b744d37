//! Transport layer for cluster communication
//!
//! The connection manager only consumes two primitives: association events per
//! peer, and fire-and-forget ordered delivery of [`PeerMessage`]s. Sending to a
//! peer that is not yet associated makes the transport dial it.
//!
//! Two implementations are provided: [`tcp::TcpTransport`] for real deployments
//! and [`memory::MemoryNetwork`] for tests and in-process simulations.

pub mod memory;
pub mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

use crate::protocol::PeerMessage;
use crate::topology::NodeAddress;

/// Inbound traffic from the transport, ordered per peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// At least one link to the peer is up
    Associated(NodeAddress),
    /// The last link to the peer went down, or dialing it failed
    Disassociated(NodeAddress),
    Message {
        from: NodeAddress,
        message: PeerMessage,
    },
}

/// Outbound half of a transport
pub trait Transport: Send + Sync + 'static {
    /// Address this node is known by in the cluster
    fn local_address(&self) -> &NodeAddress;

    /// Queue `message` for delivery to `to`. Never blocks; delivery failures
    /// surface as [`TransportEvent::Disassociated`].
    fn send(&self, to: &NodeAddress, message: PeerMessage);
}
