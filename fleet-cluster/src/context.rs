//! Per-process cluster context
//!
//! Owns the connection manager and the lifecycle coordinator of one node.
//! Every channel is created in [`ClusterContext::new`], so handles obtained
//! before [`start`](ClusterContext::start) are already usable and their
//! requests take effect once the tasks run.

use crate::config::ClusterConfig;
use crate::connection::actor::{self as connection_actor, ConnectionCommand};
use crate::connection::{
    ClusterChangedEvent, ClusterDebugStatus, ConnectionManager, ConnectionManagerHandle,
};
use crate::coordinator::actor::{self as coordinator_actor, CoordinatorInbox};
use crate::coordinator::{Coordinator, CoordinatorHandle};
use crate::error::{ClusterError, ClusterFault, Result};
use crate::node_info::{NodeInfo, NodeLifecyclePhase};
use crate::service::ServiceGroupHost;
use crate::topology::NodeAddress;
use crate::transport::{Transport, TransportEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Everything that moves into the background tasks on start
struct Pending {
    manager: ConnectionManager,
    connection_commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    coordinator: Coordinator,
    inbox: CoordinatorInbox,
    host: Arc<dyn ServiceGroupHost>,
}

pub struct ClusterContext {
    self_address: NodeAddress,
    tick_interval: Duration,
    connection: ConnectionManagerHandle,
    coordinator: CoordinatorHandle,
    cancel: CancellationToken,
    pending: Option<Pending>,
    tasks: Vec<JoinHandle<()>>,
}

impl ClusterContext {
    /// The configuration must already be validated
    pub fn new(
        config: &ClusterConfig,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        host: Arc<dyn ServiceGroupHost>,
    ) -> Self {
        let (connection, connection_commands) = connection_actor::channel();
        let (coordinator, inbox) = coordinator_actor::channel();

        let manager = ConnectionManager::new(config, transport);
        let state = Coordinator::new(config, connection.clone(), inbox.status_sender());

        Self {
            self_address: config.self_address.clone(),
            tick_interval: config.tick_interval(),
            connection,
            coordinator,
            cancel: CancellationToken::new(),
            pending: Some(Pending {
                manager,
                connection_commands,
                transport_events,
                coordinator: state,
                inbox,
                host,
            }),
            tasks: Vec::new(),
        }
    }

    /// Spawn the connection manager and the coordinator. Must be called once,
    /// from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| ClusterError::InvalidUsage("cluster context already started".into()))?;

        let events: mpsc::UnboundedReceiver<ClusterChangedEvent> = self.connection.subscribe()?;

        self.tasks.push(tokio::spawn(connection_actor::run(
            pending.manager,
            pending.connection_commands,
            pending.transport_events,
            self.tick_interval,
            self.cancel.child_token(),
        )));
        self.tasks.push(coordinator_actor::spawn_supervised(
            pending.coordinator,
            pending.inbox,
            events,
            pending.host,
            self.tick_interval,
            self.cancel.child_token(),
        ));

        info!(address = %self.self_address, "Cluster context started");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.pending.is_none()
    }

    /// Stop both tasks without running any shutdown sequence
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!(address = %self.self_address, "Cluster context stopped");
    }

    pub fn self_address(&self) -> &NodeAddress {
        &self.self_address
    }

    pub fn connection(&self) -> &ConnectionManagerHandle {
        &self.connection
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn request_node_shutdown(&self) -> Result<()> {
        self.coordinator.request_node_shutdown()
    }

    pub fn request_cluster_shutdown(&self) -> Result<()> {
        self.coordinator.request_cluster_shutdown()
    }

    pub fn set_self_info(&self, info: NodeInfo) -> Result<()> {
        self.connection.set_self_info(info)
    }

    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ClusterChangedEvent>> {
        self.connection.subscribe()
    }

    pub async fn debug_status(&self) -> Result<ClusterDebugStatus> {
        self.connection.debug_status().await
    }

    pub fn phase(&self) -> NodeLifecyclePhase {
        self.coordinator.phase()
    }

    pub fn fault(&self) -> Option<ClusterFault> {
        self.coordinator.fault()
    }

    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        self.coordinator.wait_for_ready(timeout).await
    }

    pub async fn wait_for_terminated(&self, timeout: Duration) -> Result<()> {
        self.coordinator.wait_for_terminated(timeout).await
    }
}

impl Drop for ClusterContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::groups::tests::ScriptedHost;
    use crate::coordinator::tests::config;
    use crate::transport::MemoryNetwork;

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let network = MemoryNetwork::new();
        let cfg = config(6000);
        let (transport, events) = network.register(cfg.self_address.clone());
        let mut context = ClusterContext::new(
            &cfg,
            Arc::new(transport),
            events,
            Arc::new(ScriptedHost::default()),
        );

        assert!(!context.is_started());
        context.start().unwrap();
        assert!(context.is_started());
        assert!(matches!(context.start(), Err(ClusterError::InvalidUsage(_))));
        context.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_requested_before_start_is_honored() {
        let network = MemoryNetwork::new();
        let cfg = config(6000);
        let (transport, events) = network.register(cfg.self_address.clone());
        let mut context = ClusterContext::new(
            &cfg,
            Arc::new(transport),
            events,
            Arc::new(ScriptedHost::default()),
        );

        context.request_node_shutdown().unwrap();
        context.start().unwrap();
        context
            .wait_for_terminated(Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(context.phase(), NodeLifecyclePhase::Terminated);
        assert!(context.fault().is_none());
        context.shutdown().await;
    }
}
