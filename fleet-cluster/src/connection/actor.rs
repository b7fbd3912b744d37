//! Task that owns a [`ConnectionManager`]
//!
//! All state is mutated from one task. Inputs are transport events, commands
//! from [`ConnectionManagerHandle`]s and the reconciliation tick.

use super::{ClusterChangedEvent, ClusterDebugStatus, ConnectionManager};
use crate::error::{ClusterError, Result};
use crate::node_info::NodeInfo;
use crate::transport::TransportEvent;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub enum ConnectionCommand {
    SetSelfInfo(NodeInfo),
    Subscribe {
        events: mpsc::UnboundedSender<ClusterChangedEvent>,
        /// When present the current event is returned here instead of being sent on `events`
        reply: Option<oneshot::Sender<Option<ClusterChangedEvent>>>,
    },
    DebugStatus(oneshot::Sender<ClusterDebugStatus>),
}

/// Cheap to clone. Commands are processed in send order.
#[derive(Clone)]
pub struct ConnectionManagerHandle {
    commands: mpsc::UnboundedSender<ConnectionCommand>,
}

pub fn channel() -> (
    ConnectionManagerHandle,
    mpsc::UnboundedReceiver<ConnectionCommand>,
) {
    let (commands, receiver) = mpsc::unbounded_channel();
    (ConnectionManagerHandle { commands }, receiver)
}

impl ConnectionManagerHandle {
    fn send(&self, command: ConnectionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClusterError::ChannelClosed("connection manager stopped".into()))
    }

    /// Replace the local node info and propagate it to peers
    pub fn set_self_info(&self, info: NodeInfo) -> Result<()> {
        self.send(ConnectionCommand::SetSelfInfo(info))
    }

    /// Receive every cluster change. The current state, if any, arrives first.
    pub fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<ClusterChangedEvent>> {
        let (events, receiver) = mpsc::unbounded_channel();
        self.send(ConnectionCommand::Subscribe {
            events,
            reply: None,
        })?;
        Ok(receiver)
    }

    /// Like [`subscribe`](Self::subscribe) but returns the current state directly.
    /// `None` until a topology has been installed.
    pub async fn subscribe_with_current(
        &self,
    ) -> Result<(
        Option<ClusterChangedEvent>,
        mpsc::UnboundedReceiver<ClusterChangedEvent>,
    )> {
        let (events, receiver) = mpsc::unbounded_channel();
        let (reply, current) = oneshot::channel();
        self.send(ConnectionCommand::Subscribe {
            events,
            reply: Some(reply),
        })?;
        let current = current
            .await
            .map_err(|_| ClusterError::ChannelClosed("connection manager stopped".into()))?;
        Ok((current, receiver))
    }

    pub async fn debug_status(&self) -> Result<ClusterDebugStatus> {
        let (reply, status) = oneshot::channel();
        self.send(ConnectionCommand::DebugStatus(reply))?;
        status
            .await
            .map_err(|_| ClusterError::ChannelClosed("connection manager stopped".into()))
    }
}

fn handle_command(manager: &mut ConnectionManager, command: ConnectionCommand) {
    match command {
        ConnectionCommand::SetSelfInfo(info) => manager.set_self_info(info),
        ConnectionCommand::Subscribe {
            events,
            reply: None,
        } => manager.add_subscriber(events),
        ConnectionCommand::Subscribe {
            events,
            reply: Some(reply),
        } => {
            let current = manager.add_subscriber_with_current(events);
            let _ = reply.send(current);
        }
        ConnectionCommand::DebugStatus(reply) => {
            let _ = reply.send(manager.debug_status());
        }
    }
}

/// Drive `manager` until `cancel` fires or every handle is dropped
pub async fn run(
    mut manager: ConnectionManager,
    mut commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    tick_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // Skip immediate tick

    info!(
        address = %manager.self_address(),
        leader = manager.is_leader(),
        launch_id = %manager.launch_id(),
        "Connection manager started with {}ms tick",
        tick_interval.as_millis()
    );

    let mut transport_open = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => manager.tick(),
            command = commands.recv() => match command {
                Some(command) => handle_command(&mut manager, command),
                None => break,
            },
            event = transport_events.recv(), if transport_open => match event {
                Some(event) => manager.handle_transport_event(event),
                None => {
                    debug!("Transport event stream closed");
                    transport_open = false;
                }
            },
        }
    }

    info!("Connection manager stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::topology::{
        AddressingMode, ClusterTopologySpec, NodeAddress, NodeSetSpec, WorkloadKindMask,
    };
    use crate::transport::MemoryNetwork;
    use chrono::Utc;
    use std::sync::Arc;

    fn config(port: u16, is_leader: bool) -> ClusterConfig {
        let topology = ClusterTopologySpec::new(
            AddressingMode::Static,
            vec![NodeSetSpec::new_static(
                AddressingMode::Static,
                "logic",
                "127.0.0.1",
                6000,
                "",
                WorkloadKindMask::all(),
                2,
            )],
        )
        .unwrap();
        ClusterConfig {
            self_address: NodeAddress::new("127.0.0.1", port),
            is_leader,
            tick_interval_ms: 50,
            topology,
            ..ClusterConfig::default()
        }
    }

    fn spawn_node(
        network: &MemoryNetwork,
        port: u16,
        is_leader: bool,
        cancel: &CancellationToken,
    ) -> ConnectionManagerHandle {
        let config = config(port, is_leader);
        let (transport, events) = network.register(config.self_address.clone());
        let manager = ConnectionManager::new(&config, Arc::new(transport));
        let (handle, commands) = channel();
        tokio::spawn(run(
            manager,
            commands,
            events,
            config.tick_interval(),
            cancel.child_token(),
        ));
        handle
    }

    async fn wait_all_connected(events: &mut mpsc::UnboundedReceiver<ClusterChangedEvent>) -> ClusterChangedEvent {
        loop {
            let event = events.recv().await.unwrap();
            if event.all_connected() {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn test_two_nodes_converge() {
        let network = MemoryNetwork::new();
        let cancel = CancellationToken::new();
        let leader = spawn_node(&network, 6000, true, &cancel);
        let follower = spawn_node(&network, 6001, false, &cancel);

        let mut leader_events = leader.subscribe().unwrap();
        let mut follower_events = follower.subscribe().unwrap();
        leader.set_self_info(NodeInfo::new(None, 0, Utc::now())).unwrap();
        follower.set_self_info(NodeInfo::new(None, 0, Utc::now())).unwrap();

        let timeout = Duration::from_secs(5);
        let on_leader = tokio::time::timeout(timeout, wait_all_connected(&mut leader_events))
            .await
            .unwrap();
        let on_follower = tokio::time::timeout(timeout, wait_all_connected(&mut follower_events))
            .await
            .unwrap();
        assert_eq!(on_leader.topology_id, on_follower.topology_id);
        assert_eq!(on_leader.members.len(), 2);

        let status = follower.debug_status().await.unwrap();
        assert_eq!(status.connected_peers, vec![NodeAddress::new("127.0.0.1", 6000)]);

        let (current, _rest) = leader.subscribe_with_current().await.unwrap();
        assert!(current.unwrap().all_connected());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_handle_fails_after_stop() {
        let network = MemoryNetwork::new();
        let cancel = CancellationToken::new();
        let handle = spawn_node(&network, 6000, true, &cancel);
        cancel.cancel();

        let mut result = Ok(());
        for _ in 0..100 {
            result = handle.set_self_info(NodeInfo::new(None, 0, Utc::now()));
            if result.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(matches!(result, Err(ClusterError::ChannelClosed(_))));
    }
}
