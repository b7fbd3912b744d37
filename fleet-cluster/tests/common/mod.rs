//! Shared harness for multi-node tests over the in-memory network

#![allow(dead_code)]

use async_trait::async_trait;
use fleet_cluster::{
    AddressingMode, ClusterConfig, ClusterContext, ClusterTopologySpec, MemoryNetwork,
    NodeAddress, NodeSetSpec, ServiceGroupConfig, ServiceGroupError, ServiceGroupHost,
    ShardHandle, ShardId, WorkloadConfig, WorkloadKind, WorkloadKindMask,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const READY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("127.0.0.1", port)
}

fn service_groups() -> Vec<ServiceGroupConfig> {
    let group = |name: &str, kind: u8| ServiceGroupConfig {
        name: name.into(),
        workloads: vec![WorkloadConfig {
            kind: WorkloadKind(kind),
            name: format!("{}-workload", name),
            shutdown_timeout_ms: 2000,
        }],
    };
    vec![group("core", 0), group("players", 1)]
}

fn config_for(self_port: u16, node_set: NodeSetSpec, mode: AddressingMode) -> ClusterConfig {
    ClusterConfig {
        self_address: addr(self_port),
        is_leader: self_port == 6000,
        tick_interval_ms: 50,
        grace_window_ms: 500,
        shard_ready_timeout_ms: 5000,
        topology: ClusterTopologySpec::new(mode, vec![node_set]).unwrap(),
        service_groups: service_groups(),
        ..ClusterConfig::default()
    }
}

fn kinds() -> WorkloadKindMask {
    WorkloadKindMask::from_kinds([WorkloadKind(0), WorkloadKind(1)])
}

/// `node_count` static nodes from port 6000, leader at 6000
pub fn static_config(self_port: u16, node_count: u32) -> ClusterConfig {
    let node_set = NodeSetSpec::new_static(
        AddressingMode::Static,
        "logic",
        "127.0.0.1",
        6000,
        "",
        kinds(),
        node_count,
    );
    config_for(self_port, node_set, AddressingMode::Static)
}

/// Dynamically scaled nodes from port 6000, leader at 6000
pub fn dynamic_config(self_port: u16, min: u32, max: u32) -> ClusterConfig {
    let node_set = NodeSetSpec::new_dynamic_linear(
        AddressingMode::Static,
        "logic",
        "127.0.0.1",
        6000,
        "",
        kinds(),
        min,
        max,
    );
    config_for(self_port, node_set, AddressingMode::Static)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEvent {
    pub node: u16,
    pub action: &'static str,
    pub kind: u8,
}

/// Host calls of every node, in global order
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<HostEvent>>>);

impl EventLog {
    pub fn entries(&self) -> Vec<HostEvent> {
        self.0.lock().clone()
    }

    fn push(&self, node: u16, action: &'static str, kind: WorkloadKind) {
        self.0.lock().push(HostEvent {
            node,
            action,
            kind: kind.0,
        });
    }

    pub fn position(&self, action: &str, kind: u8, first: bool) -> Option<usize> {
        let entries = self.entries();
        let matches = |e: &HostEvent| e.action == action && e.kind == kind;
        if first {
            entries.iter().position(matches)
        } else {
            entries.iter().rposition(matches)
        }
    }

    /// First entry of `node` matching `action` and `kind`
    pub fn node_position(&self, node: u16, action: &str, kind: u8) -> Option<usize> {
        self.entries()
            .iter()
            .position(|e| e.node == node && e.action == action && e.kind == kind)
    }
}

pub struct TestHost {
    node: u16,
    log: EventLog,
    shards: Mutex<HashMap<ShardHandle, WorkloadKind>>,
    pub fail_create: Mutex<bool>,
}

#[async_trait]
impl ServiceGroupHost for TestHost {
    async fn create_shard(&self, shard: ShardId) -> Result<ShardHandle, ServiceGroupError> {
        if *self.fail_create.lock() {
            return Err(ServiceGroupError::Other("disk full".into()));
        }
        let handle = ShardHandle(format!("{}@{}", shard, self.node));
        self.shards.lock().insert(handle.clone(), shard.kind);
        self.log.push(self.node, "create", shard.kind);
        Ok(handle)
    }

    async fn start_shard(&self, handle: &ShardHandle) -> Result<(), ServiceGroupError> {
        let kind = self.shards.lock().get(handle).copied();
        let kind = kind.ok_or_else(|| ServiceGroupError::IllegalState(handle.to_string()))?;
        self.log.push(self.node, "start", kind);
        Ok(())
    }

    async fn wait_until_ready(&self, _handle: &ShardHandle) -> Result<bool, ServiceGroupError> {
        Ok(true)
    }

    async fn stop_shard(&self, handle: &ShardHandle) -> Result<(), ServiceGroupError> {
        if let Some(kind) = self.shards.lock().remove(handle) {
            self.log.push(self.node, "stop", kind);
        }
        Ok(())
    }
}

pub struct TestNode {
    pub context: ClusterContext,
    pub host: Arc<TestHost>,
}

impl TestNode {
    pub fn start(network: &MemoryNetwork, config: ClusterConfig, log: &EventLog) -> Self {
        Self::start_with(network, config, log, false)
    }

    pub fn start_with(
        network: &MemoryNetwork,
        config: ClusterConfig,
        log: &EventLog,
        fail_create: bool,
    ) -> Self {
        config.validate().unwrap();
        let (transport, events) = network.register(config.self_address.clone());
        let host = Arc::new(TestHost {
            node: config.self_address.port,
            log: log.clone(),
            shards: Mutex::new(HashMap::new()),
            fail_create: Mutex::new(fail_create),
        });
        let mut context = ClusterContext::new(&config, Arc::new(transport), events, host.clone());
        context.start().unwrap();
        Self { context, host }
    }

    /// Members of the active topology as this node sees it
    pub async fn members(&self) -> Vec<NodeAddress> {
        self.context
            .debug_status()
            .await
            .ok()
            .and_then(|status| status.current)
            .map(|event| event.members.into_iter().map(|m| m.address).collect())
            .unwrap_or_default()
    }

    pub async fn stop(mut self) {
        self.context.shutdown().await;
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
