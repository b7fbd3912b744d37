//! Cluster-specific error types

use crate::node_info::NodeLifecyclePhase;
use thiserror::Error;

/// Errors that can occur during cluster operations
#[derive(Error, Debug, Clone)]
pub enum ClusterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Topology error: {0}")]
    Topology(String),

    /// The caller asked for something that can never succeed with the given
    /// configuration, e.g. a linear shard index on a dynamically scaled node set.
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Node is already shutting down (phase {0:?})")]
    AlreadyShuttingDown(NodeLifecyclePhase),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl ClusterError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::Config(_) => "config",
            ClusterError::Topology(_) => "topology",
            ClusterError::InvalidUsage(_) => "invalid_usage",
            ClusterError::Transport(_) => "transport",
            ClusterError::Serialization(_) => "serialization",
            ClusterError::Timeout(_) => "timeout",
            ClusterError::AlreadyShuttingDown(_) => "already_shutting_down",
            ClusterError::ChannelClosed(_) => "channel_closed",
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Transport(err.to_string())
    }
}

impl From<bincode::Error> for ClusterError {
    fn from(err: bincode::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ClusterError {
    fn from(err: toml::de::Error) -> Self {
        ClusterError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// Conditions after which this process can no longer be trusted to hold a
/// consistent cluster state. The node stops and the process is expected to
/// exit with [`ClusterFault::exit_code`] so an orchestrator restarts it into a
/// clean `Connecting` state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterFault {
    #[error("shard {shard} crashed during boot (phase {phase:?})")]
    ShardCrashedDuringBoot {
        shard: String,
        phase: NodeLifecyclePhase,
    },

    #[error("shard {shard} is in an unpredictable state: {reason}")]
    ShardStateDesynced { shard: String, reason: String },

    #[error("failed to start shard {shard}: {reason}")]
    ShardStartFailed { shard: String, reason: String },

    #[error("timeout while starting service group {group}, pending shards: {pending}")]
    GroupStartTimeout { group: String, pending: String },

    #[error("lifecycle coordinator crashed: {0}")]
    CoordinatorCrashed(String),

    #[error("failed to stop all shards after being removed from the cluster")]
    KickedTeardownFailed,
}

impl ClusterFault {
    /// Process exit code for this fault. Distinct per cause.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClusterFault::ShardCrashedDuringBoot { .. } => 100,
            ClusterFault::ShardStateDesynced { .. } => 100,
            ClusterFault::ShardStartFailed { .. } => 101,
            ClusterFault::GroupStartTimeout { .. } => 101,
            ClusterFault::CoordinatorCrashed(_) => 102,
            ClusterFault::KickedTeardownFailed => 103,
        }
    }
}
