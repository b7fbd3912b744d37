//! Service group host interface
//!
//! The coordinator decides *when* the shards of a service group are created,
//! started and stopped. A [`ServiceGroupHost`] decides *how*. Implementations
//! own the shards' runtime and report unexpected terminations back through
//! [`CoordinatorHandle::shard_terminated`](crate::coordinator::CoordinatorHandle::shard_terminated).
//!
//! # Example
//!
//! ```ignore
//! struct MyHost;
//!
//! #[async_trait]
//! impl ServiceGroupHost for MyHost {
//!     async fn create_shard(&self, shard: ShardId) -> Result<ShardHandle, ServiceGroupError> {
//!         Ok(ShardHandle(format!("shard-{}", shard)))
//!     }
//!     async fn start_shard(&self, _: &ShardHandle) -> Result<(), ServiceGroupError> { Ok(()) }
//!     async fn wait_until_ready(&self, _: &ShardHandle) -> Result<bool, ServiceGroupError> { Ok(true) }
//!     async fn stop_shard(&self, _: &ShardHandle) -> Result<(), ServiceGroupError> { Ok(()) }
//! }
//! ```

use crate::node_info::ShardHandle;
use crate::topology::ShardId;
use async_trait::async_trait;
use thiserror::Error;

/// Failures reported by a [`ServiceGroupHost`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceGroupError {
    /// The shard ran its initialization and it failed
    #[error("shard failed to start: {0}")]
    StartFailed(String),

    /// The shard is not in the state the caller assumed
    #[error("shard is in an unexpected state: {0}")]
    IllegalState(String),

    #[error("shard failed to stop: {0}")]
    StopFailed(String),

    #[error("{0}")]
    Other(String),
}

/// Runtime hosting the local shards of every service group
#[async_trait]
pub trait ServiceGroupHost: Send + Sync + 'static {
    /// Materialize the shard's resources without starting it
    async fn create_shard(&self, shard: ShardId) -> Result<ShardHandle, ServiceGroupError>;

    /// Signal the shard to begin. Readiness is observed through [`wait_until_ready`](Self::wait_until_ready).
    async fn start_shard(&self, handle: &ShardHandle) -> Result<(), ServiceGroupError>;

    /// Poll readiness. `Ok(false)` means not yet; errors are fatal.
    async fn wait_until_ready(&self, handle: &ShardHandle) -> Result<bool, ServiceGroupError>;

    /// Stop the shard. The caller bounds this with the workload's shutdown timeout.
    async fn stop_shard(&self, handle: &ShardHandle) -> Result<(), ServiceGroupError>;
}
