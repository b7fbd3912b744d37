//! Task that owns a [`Coordinator`]
//!
//! Inputs are cluster changed events, commands from [`CoordinatorHandle`]s,
//! outcomes of group operations and a periodic tick. After every input the
//! state machine is stepped until it has to wait.

use super::{Coordinator, GroupOperation, Step};
use crate::connection::ClusterChangedEvent;
use crate::error::{ClusterError, ClusterFault, Result};
use crate::node_info::{NodeLifecyclePhase, ShardHandle};
use crate::service::ServiceGroupHost;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorCommand {
    RequestNodeShutdown,
    RequestClusterShutdown,
    ShardTerminated(ShardHandle),
}

/// Externally observable coordinator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorStatus {
    pub phase: NodeLifecyclePhase,
    /// Terminated through a cluster-wide shutdown
    pub coordinated_shutdown: bool,
    /// Set when the node terminated because of a fatal condition
    pub fault: Option<ClusterFault>,
}

impl Default for CoordinatorStatus {
    fn default() -> Self {
        Self {
            phase: NodeLifecyclePhase::Connecting,
            coordinated_shutdown: false,
            fault: None,
        }
    }
}

/// Receiving side of [`channel`], consumed when the coordinator task starts
pub struct CoordinatorInbox {
    commands: mpsc::UnboundedReceiver<CoordinatorCommand>,
    status: Arc<watch::Sender<CoordinatorStatus>>,
}

impl CoordinatorInbox {
    pub fn status_sender(&self) -> Arc<watch::Sender<CoordinatorStatus>> {
        Arc::clone(&self.status)
    }
}

/// Cheap to clone. Requests sent before the coordinator task starts are queued.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<CoordinatorCommand>,
    status: watch::Receiver<CoordinatorStatus>,
}

pub fn channel() -> (CoordinatorHandle, CoordinatorInbox) {
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let (status_tx, status) = watch::channel(CoordinatorStatus::default());
    (
        CoordinatorHandle { commands, status },
        CoordinatorInbox {
            commands: commands_rx,
            status: Arc::new(status_tx),
        },
    )
}

impl CoordinatorHandle {
    fn send(&self, command: CoordinatorCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClusterError::ChannelClosed("lifecycle coordinator stopped".into()))
    }

    /// Shut down this node only. Idempotent.
    pub fn request_node_shutdown(&self) -> Result<()> {
        self.send(CoordinatorCommand::RequestNodeShutdown)
    }

    /// Shut down every node of the cluster in coordinated order. Takes
    /// precedence over a node-only request. Idempotent.
    pub fn request_cluster_shutdown(&self) -> Result<()> {
        self.send(CoordinatorCommand::RequestClusterShutdown)
    }

    /// Report that a locally owned shard stopped without being asked to
    pub fn shard_terminated(&self, handle: ShardHandle) -> Result<()> {
        self.send(CoordinatorCommand::ShardTerminated(handle))
    }

    pub fn phase(&self) -> NodeLifecyclePhase {
        self.status.borrow().phase
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == NodeLifecyclePhase::Running
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.status.borrow().clone()
    }

    pub fn fault(&self) -> Option<ClusterFault> {
        self.status.borrow().fault.clone()
    }

    pub fn is_coordinated_shutdown(&self) -> bool {
        self.status.borrow().coordinated_shutdown
    }

    pub fn watch_status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.clone()
    }

    /// Wait until this node is `Running`. Fails if it passes `Running` first.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let mut status = self.status.clone();
        let wait = async move {
            loop {
                let phase = status.borrow_and_update().phase;
                match phase {
                    NodeLifecyclePhase::Running => return Ok(()),
                    phase if phase > NodeLifecyclePhase::Running => {
                        return Err(ClusterError::AlreadyShuttingDown(phase))
                    }
                    _ => {}
                }
                if status.changed().await.is_err() {
                    return Err(ClusterError::ChannelClosed(
                        "lifecycle coordinator stopped".into(),
                    ));
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ClusterError::Timeout("waiting for the cluster to become ready".into())
        })?
    }

    /// Wait until this node is `Terminated`
    pub async fn wait_for_terminated(&self, timeout: Duration) -> Result<()> {
        let mut status = self.status.clone();
        let wait = async move {
            status
                .wait_for(|s| s.phase == NodeLifecyclePhase::Terminated)
                .await
                .map(|_| ())
                .map_err(|_| ClusterError::ChannelClosed("lifecycle coordinator stopped".into()))
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_| {
            ClusterError::Timeout("waiting for the node to shut down".into())
        })?
    }
}

fn handle_command(coordinator: &mut Coordinator, command: CoordinatorCommand) {
    match command {
        CoordinatorCommand::RequestNodeShutdown => coordinator.request_node_shutdown(),
        CoordinatorCommand::RequestClusterShutdown => coordinator.request_cluster_shutdown(),
        CoordinatorCommand::ShardTerminated(handle) => coordinator.on_shard_terminated(&handle),
    }
}

fn panic_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn spawn_operation(
    operation: GroupOperation,
    host: Arc<dyn ServiceGroupHost>,
    done: mpsc::UnboundedSender<super::OperationOutcome>,
) {
    let fallback = operation.clone();
    tokio::spawn(async move {
        let outcome = match tokio::spawn(operation.execute(host)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = panic_reason(e);
                error!(operation = ?fallback.kind(), "Service group operation panicked: {}", reason);
                fallback.panicked(&reason)
            }
        };
        let _ = done.send(outcome);
    });
}

fn progress(
    coordinator: &mut Coordinator,
    host: &Arc<dyn ServiceGroupHost>,
    done: &mpsc::UnboundedSender<super::OperationOutcome>,
) {
    loop {
        match coordinator.step() {
            Step::CallAgain => continue,
            Step::Wait => return,
            Step::Run(operation) => {
                spawn_operation(operation, Arc::clone(host), done.clone());
                return;
            }
        }
    }
}

/// Drive `coordinator` until `cancel` fires or every handle is dropped
pub async fn run(
    mut coordinator: Coordinator,
    inbox: CoordinatorInbox,
    mut events: mpsc::UnboundedReceiver<ClusterChangedEvent>,
    host: Arc<dyn ServiceGroupHost>,
    tick_interval: Duration,
    cancel: CancellationToken,
) {
    let mut commands = inbox.commands;
    let (done, mut outcomes) = mpsc::unbounded_channel();
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(phase = %coordinator.phase(), "Lifecycle coordinator started");
    coordinator.publish_info();

    let mut events_open = true;
    loop {
        progress(&mut coordinator, &host, &done);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut coordinator, command),
                None => break,
            },
            event = events.recv(), if events_open => match event {
                Some(event) => coordinator.on_cluster_changed(&event),
                None => {
                    debug!("Cluster event stream closed");
                    events_open = false;
                }
            },
            Some(outcome) = outcomes.recv() => coordinator.on_operation_complete(outcome),
        }
    }

    info!(phase = %coordinator.phase(), "Lifecycle coordinator stopped");
}

/// Turn a panic of the coordinator task into a fatal fault. The state it
/// held is lost and cannot be rebuilt.
pub async fn supervise(task: JoinHandle<()>, status: Arc<watch::Sender<CoordinatorStatus>>) {
    match task.await {
        Ok(()) => {}
        Err(e) if e.is_panic() => {
            let reason = panic_reason(e);
            error!("Lifecycle coordinator crashed, cluster state lost: {}", reason);
            status.send_modify(|status| {
                status.phase = NodeLifecyclePhase::Terminated;
                status.coordinated_shutdown = false;
                status.fault = Some(ClusterFault::CoordinatorCrashed(reason));
            });
        }
        Err(e) => debug!("Lifecycle coordinator task ended: {}", e),
    }
}

/// Spawn the coordinator loop under [`supervise`]
pub fn spawn_supervised(
    coordinator: Coordinator,
    inbox: CoordinatorInbox,
    events: mpsc::UnboundedReceiver<ClusterChangedEvent>,
    host: Arc<dyn ServiceGroupHost>,
    tick_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let status = inbox.status_sender();
    let task = tokio::spawn(run(coordinator, inbox, events, host, tick_interval, cancel));
    tokio::spawn(supervise(task, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panic_becomes_fault() {
        let (handle, inbox) = channel();
        let task = tokio::spawn(async { panic!("state corrupted") });
        supervise(task, inbox.status_sender()).await;

        assert_eq!(handle.phase(), NodeLifecyclePhase::Terminated);
        let fault = handle.fault().unwrap();
        assert_eq!(fault.exit_code(), 102);
        assert!(fault.to_string().contains("state corrupted"));
        assert!(handle.wait_for_terminated(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_ready() {
        let (handle, inbox) = channel();
        let status = inbox.status_sender();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_for_ready(Duration::from_secs(5)).await })
        };
        status.send_modify(|s| s.phase = NodeLifecyclePhase::Starting);
        status.send_modify(|s| s.phase = NodeLifecyclePhase::Running);
        assert!(waiter.await.unwrap().is_ok());
        assert!(handle.is_ready());
    }

    #[tokio::test]
    async fn test_wait_for_ready_fails_when_shutting_down() {
        let (handle, inbox) = channel();
        inbox
            .status_sender()
            .send_modify(|s| s.phase = NodeLifecyclePhase::Stopping);
        assert!(matches!(
            handle.wait_for_ready(Duration::from_secs(1)).await,
            Err(ClusterError::AlreadyShuttingDown(NodeLifecyclePhase::Stopping))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeouts() {
        let (handle, _inbox) = channel();
        assert!(matches!(
            handle.wait_for_ready(Duration::from_secs(1)).await,
            Err(ClusterError::Timeout(_))
        ));
        assert!(matches!(
            handle.wait_for_terminated(Duration::from_secs(1)).await,
            Err(ClusterError::Timeout(_))
        ));
    }

    #[test]
    fn test_requests_are_queued_before_start() {
        let (handle, mut inbox) = channel();
        handle.request_node_shutdown().unwrap();
        handle.request_cluster_shutdown().unwrap();
        assert_eq!(
            inbox.commands.try_recv().unwrap(),
            CoordinatorCommand::RequestNodeShutdown
        );
        assert_eq!(
            inbox.commands.try_recv().unwrap(),
            CoordinatorCommand::RequestClusterShutdown
        );
    }
}
