//! Wire messages exchanged between connection managers
//!
//! Handshaking is two-way: a peer is fully connected once we have received its
//! [`PeerMessage::Handshake`] and it has acknowledged ours with a
//! [`PeerMessage::HandshakeAck`] carrying our launch id.

use crate::node_info::NodeInfo;
use crate::topology::NodeAddress;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Build identity of the sending process. A mismatch between peers that share a
/// cookie is tolerated but logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: String,
    pub commit_id: Option<String>,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit_id: option_env!("FLEET_COMMIT_ID").map(str::to_string),
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.commit_id {
            Some(commit) => write!(f, "{} ({})", self.version, commit),
            None => write!(f, "{}", self.version),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Delivers the sender's node info. Answered with `HandshakeAck` when the cookie matches.
    Handshake {
        is_leader: bool,
        cookie: String,
        /// Sender's launch id, echoed back in the ack
        reply_token: Uuid,
        info: NodeInfo,
        build: BuildInfo,
    },

    HandshakeAck { reply_token: Uuid },

    /// Sent to every connected peer whenever the sender's info changes
    NodeInfoUpdate { info: NodeInfo },

    /// Authoritative member list. Originates at the leader and is relayed once by
    /// each follower so every pair of connected nodes observes the change before
    /// any message sent after it.
    TopologyChanged {
        members: Vec<NodeAddress>,
        timestamp_id: i64,
    },
}

impl PeerMessage {
    /// Short name used in logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Handshake { .. } => "handshake",
            PeerMessage::HandshakeAck { .. } => "handshake_ack",
            PeerMessage::NodeInfoUpdate { .. } => "node_info_update",
            PeerMessage::TopologyChanged { .. } => "topology_changed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_bincode_frame() {
        let message = PeerMessage::Handshake {
            is_leader: true,
            cookie: "secret".into(),
            reply_token: Uuid::new_v4(),
            info: NodeInfo::new(Some("play.example.com".into()), 2, Utc::now()),
            build: BuildInfo::current(),
        };
        let bytes = bincode::serialize(&message).unwrap();
        let decoded: PeerMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_topology_addresses_encode_as_strings() {
        let message = PeerMessage::TopologyChanged {
            members: vec![NodeAddress::new("127.0.0.1", 6000)],
            timestamp_id: 42,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"127.0.0.1:6000\""));
        assert_eq!(message.kind(), "topology_changed");
    }

    #[test]
    fn test_build_info_version() {
        assert_eq!(BuildInfo::current().version, env!("CARGO_PKG_VERSION"));
    }
}
