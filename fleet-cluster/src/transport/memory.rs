//! In-process transport hub
//!
//! Every registered node gets its own event stream. Links are created lazily on
//! first send and can be cut with [`MemoryNetwork::partition`] or by crashing a
//! node, in which case both ends observe [`TransportEvent::Disassociated`].

use super::{Transport, TransportEvent};
use crate::protocol::PeerMessage;
use crate::topology::NodeAddress;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

type Link = (NodeAddress, NodeAddress);

fn link_key(a: &NodeAddress, b: &NodeAddress) -> Link {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

struct Endpoint {
    incarnation: u64,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<NodeAddress, Endpoint>,
    links: HashSet<Link>,
    partitions: HashSet<Link>,
    next_incarnation: u64,
    delivered: u64,
}

impl NetworkState {
    fn emit(&self, to: &NodeAddress, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get(to) {
            let _ = endpoint.events.send(event);
        }
    }

    fn cut(&mut self, a: &NodeAddress, b: &NodeAddress) {
        if self.links.remove(&link_key(a, b)) {
            self.emit(a, TransportEvent::Disassociated(b.clone()));
            self.emit(b, TransportEvent::Disassociated(a.clone()));
        }
    }
}

/// Shared in-memory network. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node at `address`. Replaces any previous incarnation at that address.
    pub fn register(
        &self,
        address: NodeAddress,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let mut state = self.state.lock();
        if state.endpoints.contains_key(&address) {
            Self::detach(&mut state, &address);
        }

        let (events, receiver) = mpsc::unbounded_channel();
        state.next_incarnation += 1;
        let incarnation = state.next_incarnation;
        state
            .endpoints
            .insert(address.clone(), Endpoint { incarnation, events });

        let transport = MemoryTransport {
            local: address,
            incarnation,
            network: self.clone(),
        };
        (transport, receiver)
    }

    /// Remove a node. Every linked peer observes a disassociation.
    pub fn crash(&self, address: &NodeAddress) {
        let mut state = self.state.lock();
        Self::detach(&mut state, address);
    }

    /// Bring a crashed node back as a fresh process
    pub fn restart(
        &self,
        address: NodeAddress,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        self.register(address)
    }

    /// Cut the link between `a` and `b` and refuse to re-create it until healed
    pub fn partition(&self, a: &NodeAddress, b: &NodeAddress) {
        let mut state = self.state.lock();
        state.partitions.insert(link_key(a, b));
        state.cut(a, b);
    }

    pub fn heal(&self, a: &NodeAddress, b: &NodeAddress) {
        self.state.lock().partitions.remove(&link_key(a, b));
    }

    pub fn is_linked(&self, a: &NodeAddress, b: &NodeAddress) -> bool {
        self.state.lock().links.contains(&link_key(a, b))
    }

    /// Total number of messages delivered so far
    pub fn delivered_count(&self) -> u64 {
        self.state.lock().delivered
    }

    fn detach(state: &mut NetworkState, address: &NodeAddress) {
        let peers: Vec<NodeAddress> = state
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == address {
                    Some(b.clone())
                } else if b == address {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        for peer in peers {
            state.cut(address, &peer);
        }
        state.endpoints.remove(address);
    }

    fn deliver(&self, from: &NodeAddress, incarnation: u64, to: &NodeAddress, message: PeerMessage) {
        let mut state = self.state.lock();

        match state.endpoints.get(from) {
            Some(endpoint) if endpoint.incarnation == incarnation => {}
            _ => {
                trace!(from = %from, "Dropping message from a stale incarnation");
                return;
            }
        }
        if from == to || !state.endpoints.contains_key(to) {
            trace!(from = %from, to = %to, "Dropping message to unreachable node");
            return;
        }

        let key = link_key(from, to);
        if state.partitions.contains(&key) {
            trace!(from = %from, to = %to, "Dropping message across partition");
            return;
        }
        if state.links.insert(key) {
            state.emit(from, TransportEvent::Associated(to.clone()));
            state.emit(to, TransportEvent::Associated(from.clone()));
        }

        state.delivered += 1;
        state.emit(
            to,
            TransportEvent::Message {
                from: from.clone(),
                message,
            },
        );
    }
}

/// One node's handle onto a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    local: NodeAddress,
    incarnation: u64,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn local_address(&self) -> &NodeAddress {
        &self.local
    }

    fn send(&self, to: &NodeAddress, message: PeerMessage) {
        self.network
            .deliver(&self.local, self.incarnation, to, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1", port)
    }

    fn ack() -> PeerMessage {
        PeerMessage::HandshakeAck {
            reply_token: Uuid::nil(),
        }
    }

    #[tokio::test]
    async fn test_send_associates_then_delivers() {
        let network = MemoryNetwork::new();
        let (a, mut a_events) = network.register(addr(1));
        let (_b, mut b_events) = network.register(addr(2));

        a.send(&addr(2), ack());

        assert_eq!(
            a_events.recv().await.unwrap(),
            TransportEvent::Associated(addr(2))
        );
        assert_eq!(
            b_events.recv().await.unwrap(),
            TransportEvent::Associated(addr(1))
        );
        assert_eq!(
            b_events.recv().await.unwrap(),
            TransportEvent::Message {
                from: addr(1),
                message: ack()
            }
        );
        assert!(network.is_linked(&addr(1), &addr(2)));
        assert_eq!(network.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_crash_disassociates_peers() {
        let network = MemoryNetwork::new();
        let (a, mut a_events) = network.register(addr(1));
        let (_b, _b_events) = network.register(addr(2));
        a.send(&addr(2), ack());
        a_events.recv().await.unwrap();

        network.crash(&addr(2));
        assert_eq!(
            a_events.recv().await.unwrap(),
            TransportEvent::Disassociated(addr(2))
        );

        // Unreachable now, nothing is delivered
        a.send(&addr(2), ack());
        assert_eq!(network.delivered_count(), 1);
    }

    #[tokio::test]
    async fn test_partition_and_heal() {
        let network = MemoryNetwork::new();
        let (a, mut a_events) = network.register(addr(1));
        let (_b, _b_events) = network.register(addr(2));
        a.send(&addr(2), ack());
        a_events.recv().await.unwrap();

        network.partition(&addr(1), &addr(2));
        assert_eq!(
            a_events.recv().await.unwrap(),
            TransportEvent::Disassociated(addr(2))
        );
        a.send(&addr(2), ack());
        assert!(!network.is_linked(&addr(1), &addr(2)));

        network.heal(&addr(1), &addr(2));
        a.send(&addr(2), ack());
        assert!(network.is_linked(&addr(1), &addr(2)));
        assert_eq!(network.delivered_count(), 2);
    }

    #[tokio::test]
    async fn test_stale_incarnation_is_muted() {
        let network = MemoryNetwork::new();
        let (old, _old_events) = network.register(addr(1));
        let (_b, _b_events) = network.register(addr(2));
        network.crash(&addr(1));
        let (_new, _new_events) = network.restart(addr(1));

        old.send(&addr(2), ack());
        assert_eq!(network.delivered_count(), 0);
    }
}
