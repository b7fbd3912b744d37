//! Peer connections and leader-driven topology formation
//!
//! Every node dials every node it expects to be in the cluster and handshakes in
//! both directions, exchanging [`NodeInfo`]. One statically configured leader
//! computes the topology (the set of member addresses) and broadcasts it with a
//! strictly increasing timestamp. Followers accept anything newer than what they
//! hold and relay it once to every other follower they are connected to, so a
//! message sent by follower A after the change can never reach follower B before
//! the change itself does.
//!
//! [`ConnectionManager`] is the synchronous state machine. [`actor::run`] drives
//! it from transport events, local commands and a periodic tick.

pub mod actor;
mod events;

pub use actor::{ConnectionCommand, ConnectionManagerHandle};
pub use events::{ClusterChangedEvent, ClusterDebugStatus, ClusterMember};

use crate::config::ClusterConfig;
use crate::metrics;
use crate::node_info::{NodeInfo, NodeLifecyclePhase};
use crate::protocol::{BuildInfo, PeerMessage};
use crate::topology::{ClusterTopologySpec, NodeAddress, ScalingMode};
use crate::transport::{Transport, TransportEvent};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Handshake state of one associated peer. Dropped on disassociation.
#[derive(Debug, Clone, Default)]
pub struct PeerConnectionState {
    pub is_leader: bool,
    pub their_handshake_received: bool,
    pub our_handshake_acknowledged: bool,
    /// Launch id of the peer process that sent the last handshake
    pub remote_launch_id: Option<Uuid>,
    /// Only meaningful once the handshake is complete
    pub info: Option<NodeInfo>,
}

impl PeerConnectionState {
    pub fn is_handshake_complete(&self) -> bool {
        self.their_handshake_received && self.our_handshake_acknowledged
    }
}

/// Member list dictated by the leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTopology {
    pub members: Vec<NodeAddress>,
    pub timestamp_id: i64,
}

impl ActiveTopology {
    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.members.contains(address)
    }

    /// Order-independent member comparison
    pub fn members_equal(&self, other: &[NodeAddress]) -> bool {
        let ours: HashSet<&NodeAddress> = self.members.iter().collect();
        let theirs: HashSet<&NodeAddress> = other.iter().collect();
        ours == theirs
    }
}

/// A member that disconnected while not shutting down. It keeps its topology
/// slot until `expires_at`.
#[derive(Debug, Clone, Copy)]
pub struct RecentlyLostNode {
    pub expires_at: Instant,
}

impl RecentlyLostNode {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Strictly increasing ids derived from wall-clock microseconds
#[derive(Debug, Default)]
struct TimestampIdGenerator {
    last: i64,
}

impl TimestampIdGenerator {
    fn next(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_micros();
        self.last = now.max(self.last + 1);
        self.last
    }
}

pub struct ConnectionManager {
    topology: Arc<ClusterTopologySpec>,
    self_address: NodeAddress,
    is_leader: bool,
    cookie: String,
    grace_window: Duration,
    build: BuildInfo,
    launch_id: Uuid,
    transport: Arc<dyn Transport>,

    peers: HashMap<NodeAddress, PeerConnectionState>,
    active: Option<ActiveTopology>,
    self_info: Option<NodeInfo>,
    recently_lost: HashMap<NodeAddress, RecentlyLostNode>,

    topology_ids: TimestampIdGenerator,
    event_ids: TimestampIdGenerator,
    subscribers: Vec<mpsc::UnboundedSender<ClusterChangedEvent>>,
}

impl ConnectionManager {
    pub fn new(config: &ClusterConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            topology: Arc::new(config.topology.clone()),
            self_address: config.self_address.clone(),
            is_leader: config.is_leader,
            cookie: config.cookie.clone(),
            grace_window: config.grace_window(),
            build: BuildInfo::current(),
            launch_id: Uuid::new_v4(),
            transport,
            peers: HashMap::new(),
            active: None,
            self_info: None,
            recently_lost: HashMap::new(),
            topology_ids: TimestampIdGenerator::default(),
            event_ids: TimestampIdGenerator::default(),
            subscribers: Vec::new(),
        }
    }

    pub fn launch_id(&self) -> Uuid {
        self.launch_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn self_address(&self) -> &NodeAddress {
        &self.self_address
    }

    pub fn active_topology(&self) -> Option<&ActiveTopology> {
        self.active.as_ref()
    }

    pub fn peer(&self, address: &NodeAddress) -> Option<&PeerConnectionState> {
        self.peers.get(address)
    }

    pub fn self_info(&self) -> Option<&NodeInfo> {
        self.self_info.as_ref()
    }

    pub fn is_recently_lost(&self, address: &NodeAddress) -> bool {
        self.recently_lost
            .get(address)
            .is_some_and(|lost| !lost.is_expired(Instant::now()))
    }

    fn is_member(&self, address: &NodeAddress) -> bool {
        self.active.as_ref().is_some_and(|a| a.contains(address))
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Associated(peer) => self.on_associated(peer),
            TransportEvent::Disassociated(peer) => self.on_disassociated(&peer),
            TransportEvent::Message { from, message } => self.on_message(from, message),
        }
    }

    pub fn on_associated(&mut self, peer: NodeAddress) {
        info!(peer = %peer, "Associated with peer");
        if self.peers.contains_key(&peer) {
            info!(peer = %peer, "Ignoring association event for an already associated peer");
            return;
        }
        self.peers.insert(peer.clone(), PeerConnectionState::default());
        debug!("Cluster status is now: {}", self.describe_current());

        match self.self_info.clone() {
            Some(info) => self.send_handshake(&peer, info),
            None => warn!(
                peer = %peer,
                "Associated but local node info is not yet available, deferring handshake"
            ),
        }
    }

    pub fn on_disassociated(&mut self, peer: &NodeAddress) {
        info!(peer = %peer, "Disassociated from peer");
        let Some(state) = self.peers.remove(peer) else {
            // Transports report failed dials this way
            info!(peer = %peer, "Ignoring disassociation of a peer that was not associated");
            return;
        };

        let was_member = self.is_member(peer);
        if was_member {
            debug!("Cluster status is now: {}", self.describe_current());
            self.publish();
        }

        let shutting_down = state.info.as_ref().is_some_and(NodeInfo::is_shutting_down);
        if state.is_handshake_complete() && !shutting_down {
            warn!(peer = %peer, grace_ms = self.grace_window.as_millis() as u64, "Lost peer unexpectedly");
            self.recently_lost.insert(
                peer.clone(),
                RecentlyLostNode {
                    expires_at: Instant::now() + self.grace_window,
                },
            );
        }

        if self.is_leader && was_member {
            self.try_form_topology();
        }
    }

    pub fn on_message(&mut self, from: NodeAddress, message: PeerMessage) {
        match message {
            PeerMessage::Handshake {
                is_leader,
                cookie,
                reply_token,
                info,
                build,
            } => self.on_handshake(from, is_leader, &cookie, reply_token, info, &build),
            PeerMessage::HandshakeAck { reply_token } => self.on_handshake_ack(from, reply_token),
            PeerMessage::NodeInfoUpdate { info } => self.on_node_info_update(&from, info),
            PeerMessage::TopologyChanged {
                members,
                timestamp_id,
            } => self.on_topology_changed(&from, members, timestamp_id),
        }
    }

    fn on_handshake(
        &mut self,
        from: NodeAddress,
        is_leader: bool,
        cookie: &str,
        reply_token: Uuid,
        info: NodeInfo,
        build: &BuildInfo,
    ) {
        if !self.peers.contains_key(&from) {
            info!(peer = %from, "Handshake from a peer that was not associated, assuming association");
            self.peers.insert(from.clone(), PeerConnectionState::default());
            if let Some(own) = self.self_info.clone() {
                self.send_handshake(&from, own);
            }
        }

        if cookie != self.cookie {
            error!(
                peer = %from,
                remote_build = %build,
                local_build = %self.build,
                "Handshake with invalid cookie, ignoring"
            );
            metrics::record_protocol_rejection("cookie_mismatch");
            return;
        }
        if *build != self.build {
            warn!(
                peer = %from,
                remote_build = %build,
                local_build = %self.build,
                "Handshake from a different build, continuing since cookie matches"
            );
        }

        self.transport
            .send(&from, PeerMessage::HandshakeAck { reply_token });

        let Some(state) = self.peers.get_mut(&from) else {
            return;
        };

        // A new launch id means the peer restarted without us observing a
        // disassociation. Whatever it acknowledged belonged to its previous life.
        let restarted = state
            .remote_launch_id
            .is_some_and(|previous| previous != reply_token);
        state.remote_launch_id = Some(reply_token);
        if restarted {
            info!(peer = %from, "Peer restarted, redoing handshake");
            let was_complete = state.is_handshake_complete();
            state.their_handshake_received = false;
            state.our_handshake_acknowledged = false;
            state.info = None;
            if was_complete && self.is_member(&from) {
                self.publish();
            }
            if let Some(own) = self.self_info.clone() {
                self.send_handshake(&from, own);
            }
        }

        let Some(state) = self.peers.get_mut(&from) else {
            return;
        };
        state.is_leader = is_leader;
        let info_changed = state.info.as_ref() != Some(&info);
        state.info = Some(info);

        if state.their_handshake_received {
            if info_changed {
                self.on_peer_info_updated(&from);
            }
            return;
        }

        state.their_handshake_received = true;
        if state.is_handshake_complete() {
            self.on_handshake_completed(&from);
        }
    }

    fn on_handshake_ack(&mut self, from: NodeAddress, reply_token: Uuid) {
        if reply_token != self.launch_id {
            error!(peer = %from, "Handshake ack with a wrong reply token, ignoring");
            metrics::record_protocol_rejection("wrong_reply_token");
            return;
        }

        let state = self.peers.entry(from.clone()).or_insert_with(|| {
            warn!(peer = %from, "Handshake ack from a peer that was not associated, assuming association");
            PeerConnectionState::default()
        });

        if state.our_handshake_acknowledged {
            return;
        }
        state.our_handshake_acknowledged = true;
        if state.is_handshake_complete() {
            self.on_handshake_completed(&from);
        }
    }

    fn on_handshake_completed(&mut self, peer: &NodeAddress) {
        info!(peer = %peer, "Peer completed handshake");
        let node_set = self
            .topology
            .node_set_for_address(peer)
            .map_or("unknown", |(node_set, _)| node_set.name.as_str());
        metrics::record_handshake_completed(node_set);

        if self.is_member(peer) {
            debug!("Cluster status is now: {}", self.describe_current());
            self.publish();
        }

        self.recently_lost.remove(peer);

        if self.is_leader {
            // Replay the current topology so the peer need not wait for the next change
            if let Some(active) = &self.active {
                self.transport.send(
                    peer,
                    PeerMessage::TopologyChanged {
                        members: active.members.clone(),
                        timestamp_id: active.timestamp_id,
                    },
                );
            }
            self.try_form_topology();
        }
    }

    fn on_node_info_update(&mut self, from: &NodeAddress, info: NodeInfo) {
        let Some(state) = self.peers.get_mut(from) else {
            error!(peer = %from, "Node info update from a peer that was not associated");
            metrics::record_protocol_rejection("unknown_peer");
            return;
        };
        let changed = state.info.as_ref() != Some(&info);
        state.info = Some(info);
        if changed {
            self.on_peer_info_updated(from);
        }
    }

    fn on_peer_info_updated(&mut self, peer: &NodeAddress) {
        // Before the handshake completes the info is not trustworthy; the
        // completion itself publishes.
        let complete = self
            .peers
            .get(peer)
            .is_some_and(PeerConnectionState::is_handshake_complete);
        if complete && self.is_member(peer) {
            self.publish();
        }
    }

    fn on_topology_changed(&mut self, from: &NodeAddress, members: Vec<NodeAddress>, timestamp_id: i64) {
        if self.is_leader {
            error!(peer = %from, "Received a topology change but this node is the leader");
            metrics::record_protocol_rejection("topology_to_leader");
            return;
        }

        if let Some(active) = &self.active {
            // Every follower relays, so duplicates are expected
            if active.timestamp_id == timestamp_id {
                return;
            }
            if active.timestamp_id > timestamp_id {
                debug!(
                    peer = %from,
                    received_id = timestamp_id,
                    active_id = active.timestamp_id,
                    "Ignoring stale topology change"
                );
                metrics::record_protocol_rejection("stale_topology");
                return;
            }
        }

        if self.self_info.is_none() {
            error!(peer = %from, "Received a topology change before local node info was set, ignoring");
            metrics::record_protocol_rejection("topology_before_info");
            return;
        }

        let message = PeerMessage::TopologyChanged {
            members: members.clone(),
            timestamp_id,
        };
        self.active = Some(ActiveTopology {
            members,
            timestamp_id,
        });
        metrics::record_topology_installed("accepted", self.active.as_ref().map_or(0, |a| a.members.len()));
        info!(topology_id = timestamp_id, "Cluster topology changed: {}", self.describe_current());

        for (address, state) in &self.peers {
            if state.is_leader || address == from || !state.is_handshake_complete() {
                continue;
            }
            self.transport.send(address, message.clone());
        }

        self.publish();
    }

    /// Replace the local node info and push it to every associated peer
    pub fn set_self_info(&mut self, info: NodeInfo) {
        let first_time = self.self_info.is_none();
        if self.self_info.as_ref() == Some(&info) {
            return;
        }
        self.self_info = Some(info.clone());

        for address in self.peers.keys() {
            self.transport
                .send(address, PeerMessage::NodeInfoUpdate { info: info.clone() });
        }

        if self.is_member(&self.self_address.clone()) {
            self.publish();
        }

        if first_time {
            self.connect_to_all();
            if self.is_leader {
                self.try_form_topology();
            }
        }
    }

    /// Periodic reconciliation: status logging, metrics, re-dialing, and on the
    /// leader, another formation attempt.
    pub fn tick(&mut self) {
        let local = usize::from(self.self_info.is_some());
        let remote = self
            .peers
            .values()
            .filter(|p| p.is_handshake_complete())
            .count();
        let connected = local + remote;
        let expected = self.active.as_ref().map_or(0, |a| a.members.len());
        let role = if self.is_leader { "leader" } else { "follower" };

        match (&self.self_info, &self.active) {
            (None, _) => info!(
                role,
                connected, "Waiting for local node to provide its initial info"
            ),
            (Some(_), None) => info!(role, connected, "Waiting for a valid initial topology"),
            (Some(own), Some(_)) => {
                let quiet = expected == 1 && connected == 1 && own.phase == NodeLifecyclePhase::Running;
                if !quiet {
                    info!(
                        role,
                        phase = %own.phase,
                        "{}/{} cluster nodes connected",
                        connected,
                        expected
                    );
                }
            }
        }

        metrics::update_cluster_nodes(expected, connected);
        if let Some(own) = &self.self_info {
            metrics::update_local_phase(own.phase);
        }

        self.connect_to_all();

        if self.is_leader {
            self.try_form_topology();
        }

        let now = Instant::now();
        self.recently_lost.retain(|_, lost| !lost.is_expired(now));
    }

    /// Addresses this node should be connected to right now
    pub fn dial_targets(&self) -> BTreeSet<NodeAddress> {
        let mut targets = BTreeSet::new();
        let now = Instant::now();

        if let Some(active) = &self.active {
            targets.extend(active.members.iter().cloned());
        }

        // Highest observed index per dynamic node set. Nodes N+1.. are not
        // probed; they announce themselves.
        let mut highest: HashMap<&str, u32> = HashMap::new();
        for address in self.peers.keys().chain(std::iter::once(&self.self_address)) {
            for node_set in self.topology.node_sets() {
                if node_set.is_static() {
                    continue;
                }
                if let Some(index) = node_set.resolve_index(address) {
                    let entry = highest.entry(node_set.name.as_str()).or_insert(0);
                    *entry = (*entry).max(index);
                    break;
                }
            }
        }

        for node_set in self.topology.node_sets() {
            let count = match node_set.scaling {
                ScalingMode::Static { node_count } => node_count,
                ScalingMode::DynamicLinear {
                    min_node_count,
                    max_node_count,
                } => {
                    let observed = highest.get(node_set.name.as_str()).copied().unwrap_or(0);
                    (observed + 1).clamp(min_node_count, max_node_count)
                }
            };
            targets.extend((0..count).map(|index| node_set.resolve_address(index)));
        }

        targets.extend(
            self.recently_lost
                .iter()
                .filter(|(_, lost)| !lost.is_expired(now))
                .map(|(address, _)| address.clone()),
        );

        targets
    }

    /// (Re)send handshakes to every dial target that has not acknowledged ours
    pub fn connect_to_all(&mut self) {
        let Some(info) = self.self_info.clone() else {
            return;
        };

        for address in self.dial_targets() {
            if address == self.self_address {
                continue;
            }
            let acknowledged = self
                .peers
                .get(&address)
                .is_some_and(|p| p.our_handshake_acknowledged);
            if !acknowledged {
                self.send_handshake(&address, info.clone());
            }
        }
    }

    fn is_suitable_for_new_topology(&self, address: &NodeAddress, now: Instant) -> bool {
        if *address == self.self_address {
            return true;
        }

        let member = self.is_member(address);
        if let Some(state) = self.peers.get(address) {
            if state.is_handshake_complete() {
                let shutting_down = state.info.as_ref().is_some_and(NodeInfo::is_shutting_down);
                // A node already leaving is not let in, but an existing member keeps its slot
                return member || !shutting_down;
            }
        }

        member
            && self
                .recently_lost
                .get(address)
                .is_some_and(|lost| !lost.is_expired(now))
    }

    /// Member list the leader would form right now
    pub fn compute_topology(&self) -> Vec<NodeAddress> {
        let now = Instant::now();
        let mut members = Vec::new();

        for node_set in self.topology.node_sets() {
            let count = match node_set.scaling {
                // Always members, connected or not
                ScalingMode::Static { node_count } => node_count,
                ScalingMode::DynamicLinear {
                    min_node_count,
                    max_node_count,
                } => (min_node_count..max_node_count)
                    .filter(|index| {
                        self.is_suitable_for_new_topology(&node_set.resolve_address(*index), now)
                    })
                    .map(|index| index + 1)
                    .max()
                    .unwrap_or(min_node_count),
            };
            members.extend((0..count).map(|index| node_set.resolve_address(index)));
        }

        members
    }

    /// Leader only. Install and broadcast the largest topology currently possible
    /// unless it equals the active one. Returns whether a new topology was installed.
    pub fn try_form_topology(&mut self) -> bool {
        if !self.is_leader || self.self_info.is_none() {
            return false;
        }

        let members = self.compute_topology();
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.members_equal(&members))
        {
            return false;
        }

        let timestamp_id = self.topology_ids.next();
        let message = PeerMessage::TopologyChanged {
            members: members.clone(),
            timestamp_id,
        };
        metrics::record_topology_installed("formed", members.len());
        self.active = Some(ActiveTopology {
            members,
            timestamp_id,
        });
        info!(topology_id = timestamp_id, "New cluster topology created: {}", self.describe_current());

        // Everyone handshaken hears about it, including nodes left out of it
        for (address, state) in &self.peers {
            if state.is_handshake_complete() {
                self.transport.send(address, message.clone());
            }
        }

        self.publish();
        true
    }

    fn send_handshake(&self, to: &NodeAddress, info: NodeInfo) {
        self.transport.send(
            to,
            PeerMessage::Handshake {
                is_leader: self.is_leader,
                cookie: self.cookie.clone(),
                reply_token: self.launch_id,
                info,
                build: self.build.clone(),
            },
        );
    }

    /// Build the event describing the active topology. `None` without a topology.
    pub fn current_event(&mut self) -> Option<ClusterChangedEvent> {
        let active = self.active.as_ref()?;
        let members = active
            .members
            .iter()
            .map(|address| {
                if *address == self.self_address {
                    return ClusterMember {
                        address: address.clone(),
                        is_connected: true,
                        info: self.self_info.clone(),
                    };
                }
                match self.peers.get(address) {
                    Some(state) if state.is_handshake_complete() => ClusterMember {
                        address: address.clone(),
                        is_connected: true,
                        info: state.info.clone(),
                    },
                    _ => ClusterMember {
                        address: address.clone(),
                        is_connected: false,
                        info: None,
                    },
                }
            })
            .collect();
        let topology_id = active.timestamp_id;

        Some(ClusterChangedEvent {
            members,
            event_id: self.event_ids.next(),
            topology_id,
        })
    }

    fn publish(&mut self) {
        let Some(event) = self.current_event() else {
            return;
        };
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Register a listener. It receives the current event right away if a topology exists.
    pub fn add_subscriber(&mut self, subscriber: mpsc::UnboundedSender<ClusterChangedEvent>) {
        if let Some(event) = self.current_event() {
            if subscriber.send(event).is_err() {
                return;
            }
        }
        self.subscribers.push(subscriber);
    }

    /// Register a listener and hand the current event back instead of sending it
    pub fn add_subscriber_with_current(
        &mut self,
        subscriber: mpsc::UnboundedSender<ClusterChangedEvent>,
    ) -> Option<ClusterChangedEvent> {
        self.subscribers.push(subscriber);
        self.current_event()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ClusterChangedEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.add_subscriber(sender);
        receiver
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn debug_status(&mut self) -> ClusterDebugStatus {
        let mut connected_peers: Vec<NodeAddress> = self.peers.keys().cloned().collect();
        connected_peers.sort();
        ClusterDebugStatus {
            connected_peers,
            current: self.current_event(),
            description: self.describe_current(),
        }
    }

    pub fn describe_current(&self) -> String {
        match &self.active {
            Some(active) => self.describe_topology(active),
            None => "(<none>, no cluster state)".to_string(),
        }
    }

    /// Compact description grouped by node set, e.g.
    /// `(logic: [0=127.0.0.1:6000 (self) 1=127.0.0.1:6001 (disconnected)] Id: 42)`
    pub fn describe_topology(&self, active: &ActiveTopology) -> String {
        let mut by_node_set: HashMap<&str, BTreeMap<u32, &NodeAddress>> = HashMap::new();
        for address in &active.members {
            if let Some((node_set, index)) = self.topology.node_set_for_address(address) {
                by_node_set
                    .entry(node_set.name.as_str())
                    .or_default()
                    .insert(index, address);
            }
        }

        let mut out = String::from("(");
        let mut first_set = true;
        for node_set in self.topology.node_sets() {
            let Some(nodes) = by_node_set.get(node_set.name.as_str()) else {
                continue;
            };
            if !first_set {
                out.push(' ');
            }
            first_set = false;

            let _ = write!(out, "{}: [", node_set.name);
            for (position, (index, address)) in nodes.iter().enumerate() {
                if position > 0 {
                    out.push(' ');
                }
                let _ = write!(out, "{}={}", index, address);
                if **address == self.self_address {
                    out.push_str(" (self)");
                } else {
                    match self.peers.get(*address) {
                        None => out.push_str(" (disconnected)"),
                        Some(state) if !state.is_handshake_complete() => {
                            out.push_str(" (pending-handshake)")
                        }
                        Some(_) => {}
                    }
                }
            }
            out.push(']');
        }
        let _ = write!(out, " Id: {})", active.timestamp_id);
        out
    }
}
