//! Service group operations
//!
//! Each operation runs on its own task and reports a [`OperationOutcome`] back
//! to the coordinator loop. Nothing here touches coordinator state.

use crate::error::ClusterFault;
use crate::metrics::{self, GroupOperationTimer};
use crate::node_info::ShardHandle;
use crate::service::{ServiceGroupError, ServiceGroupHost};
use crate::topology::{ShardId, WorkloadKind};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// A shard this node should own once its group is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedShard {
    pub kind: WorkloadKind,
    pub name: String,
    pub id: ShardId,
    pub shutdown_timeout: Duration,
}

/// A created, locally owned shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalShard {
    pub kind: WorkloadKind,
    pub name: String,
    pub id: ShardId,
    pub handle: ShardHandle,
    pub shutdown_timeout: Duration,
}

impl LocalShard {
    fn from_planned(planned: PlannedShard, handle: ShardHandle) -> Self {
        Self {
            kind: planned.kind,
            name: planned.name,
            id: planned.id,
            handle,
            shutdown_timeout: planned.shutdown_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Create,
    Start,
    Stop,
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOperation {
    Create {
        group: usize,
        name: String,
        shards: Vec<PlannedShard>,
    },
    Start {
        group: usize,
        name: String,
        shards: Vec<LocalShard>,
        ready_timeout: Duration,
    },
    Stop {
        group: usize,
        name: String,
        shards: Vec<LocalShard>,
    },
    /// Stop every local shard after being removed from the cluster, groups in reverse order
    Teardown { groups: Vec<(String, Vec<LocalShard>)> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Created {
        group: usize,
        result: Result<Vec<LocalShard>, ClusterFault>,
    },
    Started {
        group: usize,
        result: Result<(), ClusterFault>,
    },
    Stopped {
        group: usize,
        all_stopped: bool,
    },
    TornDown {
        all_stopped: bool,
    },
}

impl GroupOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            GroupOperation::Create { .. } => OperationKind::Create,
            GroupOperation::Start { .. } => OperationKind::Start,
            GroupOperation::Stop { .. } => OperationKind::Stop,
            GroupOperation::Teardown { .. } => OperationKind::Teardown,
        }
    }

    /// Outcome to report when the task running this operation panicked
    pub fn panicked(&self, reason: &str) -> OperationOutcome {
        match self {
            GroupOperation::Create { group, name, .. } => OperationOutcome::Created {
                group: *group,
                result: Err(ClusterFault::ShardStateDesynced {
                    shard: name.clone(),
                    reason: format!("creation panicked: {}", reason),
                }),
            },
            GroupOperation::Start { group, name, .. } => OperationOutcome::Started {
                group: *group,
                result: Err(ClusterFault::ShardStartFailed {
                    shard: name.clone(),
                    reason: format!("start panicked: {}", reason),
                }),
            },
            GroupOperation::Stop { group, .. } => OperationOutcome::Stopped {
                group: *group,
                all_stopped: false,
            },
            GroupOperation::Teardown { .. } => OperationOutcome::TornDown { all_stopped: false },
        }
    }

    pub async fn execute(self, host: Arc<dyn ServiceGroupHost>) -> OperationOutcome {
        match self {
            GroupOperation::Create {
                group,
                name,
                shards,
            } => OperationOutcome::Created {
                group,
                result: create_group(host.as_ref(), &name, shards).await,
            },
            GroupOperation::Start {
                group,
                name,
                shards,
                ready_timeout,
            } => OperationOutcome::Started {
                group,
                result: start_group(host.as_ref(), &name, &shards, ready_timeout).await,
            },
            GroupOperation::Stop {
                group,
                name,
                shards,
            } => OperationOutcome::Stopped {
                group,
                all_stopped: stop_group(host.as_ref(), &name, shards).await,
            },
            GroupOperation::Teardown { groups } => {
                let mut all_stopped = true;
                for (name, shards) in groups {
                    all_stopped &= stop_group(host.as_ref(), &name, shards).await;
                }
                OperationOutcome::TornDown { all_stopped }
            }
        }
    }
}

fn kinds(shards: &[LocalShard]) -> String {
    shards
        .iter()
        .map(|s| s.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

async fn create_group(
    host: &dyn ServiceGroupHost,
    group: &str,
    planned: Vec<PlannedShard>,
) -> Result<Vec<LocalShard>, ClusterFault> {
    let timer = GroupOperationTimer::new("create", group);
    let names: Vec<&str> = planned.iter().map(|p| p.name.as_str()).collect();
    info!(group, shards = ?names, "Creating local service group");

    let mut created = Vec::with_capacity(planned.len());
    for shard in planned {
        match host.create_shard(shard.id).await {
            Ok(handle) => created.push(LocalShard::from_planned(shard, handle)),
            Err(e) => {
                // The shard may exist halfway; nothing can be assumed about it anymore
                error!(shard = %shard.id, "Shard is in an unpredictable state, cannot proceed: {}", e);
                return Err(ClusterFault::ShardStateDesynced {
                    shard: shard.id.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }

    timer.finish();
    Ok(created)
}

fn start_fault(shard: &LocalShard, err: ServiceGroupError) -> ClusterFault {
    match err {
        ServiceGroupError::IllegalState(reason) => {
            error!(shard = %shard.id, "Shard is in an unexpected state, cannot proceed: {}", reason);
            ClusterFault::ShardStateDesynced {
                shard: shard.id.to_string(),
                reason,
            }
        }
        other => {
            error!(shard = %shard.id, "Failed to start shard: {}", other);
            ClusterFault::ShardStartFailed {
                shard: shard.id.to_string(),
                reason: other.to_string(),
            }
        }
    }
}

async fn start_group(
    host: &dyn ServiceGroupHost,
    group: &str,
    shards: &[LocalShard],
    ready_timeout: Duration,
) -> Result<(), ClusterFault> {
    let timer = GroupOperationTimer::new("start", group);
    info!(group, shards = %kinds(shards), "Starting local service group");

    for shard in shards {
        host.start_shard(&shard.handle)
            .await
            .map_err(|e| start_fault(shard, e))?;
    }

    wait_until_ready(host, group, shards, ready_timeout).await?;

    let elapsed = timer.finish();
    info!(group, elapsed_ms = elapsed.as_millis() as u64, "Local service group is ready");
    Ok(())
}

async fn wait_until_ready(
    host: &dyn ServiceGroupHost,
    group: &str,
    shards: &[LocalShard],
    timeout: Duration,
) -> Result<(), ClusterFault> {
    let deadline = Instant::now() + timeout;
    let mut next_log_at = Instant::now() + PROGRESS_LOG_INTERVAL;
    let mut ready = vec![false; shards.len()];

    loop {
        // Strict deadline, no last check
        if Instant::now() > deadline {
            let pending = shards
                .iter()
                .zip(&ready)
                .filter(|(_, ready)| !**ready)
                .map(|(shard, _)| shard.id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            error!(group, pending = %pending, "Timeout while starting service group");
            return Err(ClusterFault::GroupStartTimeout {
                group: group.to_string(),
                pending,
            });
        }

        if Instant::now() > next_log_at {
            next_log_at = Instant::now() + PROGRESS_LOG_INTERVAL;
            let pending: Vec<&str> = shards
                .iter()
                .zip(&ready)
                .filter(|(_, ready)| !**ready)
                .map(|(shard, _)| shard.name.as_str())
                .collect();
            info!(group, pending = ?pending, "Waiting for service group to be ready");
        }

        let pending: Vec<usize> = (0..shards.len()).filter(|i| !ready[*i]).collect();
        let polls = pending.into_iter().map(|index| {
            let shard = &shards[index];
            async move {
                let result =
                    tokio::time::timeout(READY_POLL_INTERVAL, host.wait_until_ready(&shard.handle))
                        .await;
                (index, result)
            }
        });

        for (index, result) in join_all(polls).await {
            match result {
                Ok(Ok(is_ready)) => ready[index] = is_ready,
                Ok(Err(e)) => return Err(start_fault(&shards[index], e)),
                Err(_) => {}
            }
        }

        if ready.iter().all(|r| *r) {
            return Ok(());
        }
        tokio::time::sleep(READY_POLL_INTERVAL).await;
    }
}

/// Stop every shard concurrently. Returns whether all of them stopped in time.
async fn stop_group(host: &dyn ServiceGroupHost, group: &str, shards: Vec<LocalShard>) -> bool {
    let timer = GroupOperationTimer::new("stop", group);
    info!(group, shards = %kinds(&shards), "Stopping service group");

    let results = join_all(shards.iter().map(|shard| stop_shard(host, shard))).await;
    timer.finish();
    results.into_iter().all(|stopped| stopped)
}

async fn stop_shard(host: &dyn ServiceGroupHost, shard: &LocalShard) -> bool {
    let deadline = Instant::now() + shard.shutdown_timeout;
    let kind = shard.kind.to_string();
    let mut stop = host.stop_shard(&shard.handle);

    loop {
        let wake_at = (Instant::now() + PROGRESS_LOG_INTERVAL).min(deadline);
        tokio::select! {
            result = &mut stop => {
                return match result {
                    Ok(()) => {
                        metrics::record_shard_stop(&kind, "ok");
                        true
                    }
                    Err(e) => {
                        warn!(shard = %shard.id, "Failed to stop shard: {}", e);
                        metrics::record_shard_stop(&kind, "failed");
                        false
                    }
                };
            }
            _ = tokio::time::sleep_until(wake_at) => {
                if Instant::now() >= deadline {
                    warn!(
                        shard = %shard.id,
                        timeout_ms = shard.shutdown_timeout.as_millis() as u64,
                        "Failed to stop shard within the timeout"
                    );
                    metrics::record_shard_stop(&kind, "timeout");
                    return false;
                }
                info!(shard = %shard.id, "Shutting down shard {}..", shard.name);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Host with scripted behaviour per shard name
    #[derive(Default)]
    pub(crate) struct ScriptedHost {
        pub(crate) fail_create: Mutex<Option<ServiceGroupError>>,
        pub(crate) ready_after_polls: Mutex<HashMap<String, u32>>,
        pub(crate) never_ready: Mutex<bool>,
        pub(crate) hang_on_stop: Mutex<bool>,
        pub(crate) log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ServiceGroupHost for ScriptedHost {
        async fn create_shard(&self, shard: ShardId) -> Result<ShardHandle, ServiceGroupError> {
            if let Some(err) = self.fail_create.lock().clone() {
                return Err(err);
            }
            self.log.lock().push(format!("create {}", shard));
            Ok(ShardHandle(shard.to_string()))
        }

        async fn start_shard(&self, handle: &ShardHandle) -> Result<(), ServiceGroupError> {
            self.log.lock().push(format!("start {}", handle));
            Ok(())
        }

        async fn wait_until_ready(&self, handle: &ShardHandle) -> Result<bool, ServiceGroupError> {
            if *self.never_ready.lock() {
                return Ok(false);
            }
            let mut polls = self.ready_after_polls.lock();
            let remaining = polls.entry(handle.0.clone()).or_insert(0);
            if *remaining == 0 {
                return Ok(true);
            }
            *remaining -= 1;
            Ok(false)
        }

        async fn stop_shard(&self, handle: &ShardHandle) -> Result<(), ServiceGroupError> {
            if *self.hang_on_stop.lock() {
                futures::future::pending::<()>().await;
            }
            self.log.lock().push(format!("stop {}", handle));
            Ok(())
        }
    }

    fn planned(kind: u8) -> PlannedShard {
        PlannedShard {
            kind: WorkloadKind(kind),
            name: format!("workload-{}", kind),
            id: ShardId::new(WorkloadKind(kind), 0, 0),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn local(kind: u8) -> LocalShard {
        let p = planned(kind);
        let handle = ShardHandle(p.id.to_string());
        LocalShard::from_planned(p, handle)
    }

    #[tokio::test]
    async fn test_create_group() {
        let host = Arc::new(ScriptedHost::default());
        let op = GroupOperation::Create {
            group: 0,
            name: "core".into(),
            shards: vec![planned(0), planned(1)],
        };
        match op.execute(host.clone()).await {
            OperationOutcome::Created { group: 0, result: Ok(shards) } => {
                assert_eq!(shards, vec![local(0), local(1)]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_failure_is_desync() {
        let host = Arc::new(ScriptedHost::default());
        *host.fail_create.lock() = Some(ServiceGroupError::Other("boom".into()));
        let op = GroupOperation::Create {
            group: 0,
            name: "core".into(),
            shards: vec![planned(0)],
        };
        match op.execute(host).await {
            OperationOutcome::Created { result: Err(fault), .. } => assert_eq!(fault.exit_code(), 100),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_for_ready() {
        let host = Arc::new(ScriptedHost::default());
        host.ready_after_polls.lock().insert(local(0).handle.0, 3);
        let result = start_group(host.as_ref(), "core", &[local(0), local(1)], Duration::from_secs(10)).await;
        assert!(result.is_ok());
        assert!(host.log.lock().contains(&format!("start {}", local(1).handle)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_timeout_is_fatal() {
        let host = Arc::new(ScriptedHost::default());
        *host.never_ready.lock() = true;
        let result = start_group(host.as_ref(), "core", &[local(0)], Duration::from_secs(2)).await;
        match result {
            Err(fault @ ClusterFault::GroupStartTimeout { .. }) => assert_eq!(fault.exit_code(), 101),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_timeout_is_tolerated() {
        let host = Arc::new(ScriptedHost::default());
        *host.hang_on_stop.lock() = true;
        assert!(!stop_group(host.as_ref(), "core", vec![local(0)]).await);
    }

    #[tokio::test]
    async fn test_teardown_stops_everything() {
        let host = Arc::new(ScriptedHost::default());
        let op = GroupOperation::Teardown {
            groups: vec![("late".into(), vec![local(1)]), ("early".into(), vec![local(0)])],
        };
        assert_eq!(op.execute(host.clone()).await, OperationOutcome::TornDown { all_stopped: true });
        let log = host.log.lock();
        assert_eq!(
            *log,
            vec![format!("stop {}", local(1).handle), format!("stop {}", local(0).handle)]
        );
    }

    #[test]
    fn test_panicked_outcomes() {
        let start = GroupOperation::Start {
            group: 1,
            name: "core".into(),
            shards: vec![],
            ready_timeout: Duration::from_secs(1),
        };
        match start.panicked("oops") {
            OperationOutcome::Started { group: 1, result: Err(fault) } => assert_eq!(fault.exit_code(), 101),
            other => panic!("unexpected outcome {:?}", other),
        }
        let stop = GroupOperation::Stop {
            group: 2,
            name: "core".into(),
            shards: vec![],
        };
        assert_eq!(
            stop.panicked("oops"),
            OperationOutcome::Stopped { group: 2, all_stopped: false }
        );
    }
}
