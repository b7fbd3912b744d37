//! Service group host used by the standalone node binary.
//!
//! Shards carry no workload of their own: they log their transitions and
//! report ready once a configurable warmup has elapsed.

use async_trait::async_trait;
use fleet_cluster::{ServiceGroupError, ServiceGroupHost, ShardHandle, ShardId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShardState {
    Created,
    Started(Instant),
}

pub struct LoggingServiceHost {
    warmup: Duration,
    shards: Mutex<HashMap<ShardHandle, ShardState>>,
}

impl LoggingServiceHost {
    pub fn new(warmup: Duration) -> Self {
        Self {
            warmup,
            shards: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl ServiceGroupHost for LoggingServiceHost {
    async fn create_shard(&self, shard: ShardId) -> Result<ShardHandle, ServiceGroupError> {
        let handle = ShardHandle(shard.to_string());
        let mut shards = self.shards.lock();
        if shards.contains_key(&handle) {
            return Err(ServiceGroupError::IllegalState(format!(
                "shard {} already exists",
                handle
            )));
        }
        shards.insert(handle.clone(), ShardState::Created);
        tracing::info!(shard = %handle, "Shard created");
        Ok(handle)
    }

    async fn start_shard(&self, handle: &ShardHandle) -> Result<(), ServiceGroupError> {
        let mut shards = self.shards.lock();
        match shards.get_mut(handle) {
            Some(state @ ShardState::Created) => {
                *state = ShardState::Started(Instant::now());
                tracing::info!(shard = %handle, "Shard starting");
                Ok(())
            }
            Some(ShardState::Started(_)) => Err(ServiceGroupError::IllegalState(format!(
                "shard {} already started",
                handle
            ))),
            None => Err(ServiceGroupError::IllegalState(format!(
                "shard {} does not exist",
                handle
            ))),
        }
    }

    async fn wait_until_ready(&self, handle: &ShardHandle) -> Result<bool, ServiceGroupError> {
        match self.shards.lock().get(handle) {
            Some(ShardState::Started(at)) => Ok(at.elapsed() >= self.warmup),
            Some(ShardState::Created) => Ok(false),
            None => Err(ServiceGroupError::IllegalState(format!(
                "shard {} does not exist",
                handle
            ))),
        }
    }

    async fn stop_shard(&self, handle: &ShardHandle) -> Result<(), ServiceGroupError> {
        if self.shards.lock().remove(handle).is_some() {
            tracing::info!(shard = %handle, "Shard stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_cluster::WorkloadKind;

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_warmup() {
        let host = LoggingServiceHost::new(Duration::from_millis(500));
        let handle = host
            .create_shard(ShardId::new(WorkloadKind(1), 0, 0))
            .await
            .unwrap();
        assert!(!host.wait_until_ready(&handle).await.unwrap());

        host.start_shard(&handle).await.unwrap();
        assert!(!host.wait_until_ready(&handle).await.unwrap());
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(host.wait_until_ready(&handle).await.unwrap());

        host.stop_shard(&handle).await.unwrap();
        assert!(host.wait_until_ready(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_double_create_is_illegal() {
        let host = LoggingServiceHost::new(Duration::ZERO);
        let id = ShardId::new(WorkloadKind(1), 0, 0);
        host.create_shard(id).await.unwrap();
        assert!(matches!(
            host.create_shard(id).await,
            Err(ServiceGroupError::IllegalState(_))
        ));
    }
}
