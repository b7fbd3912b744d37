//! Node lifecycle coordination
//!
//! Drives the local node through its lifecycle phases and starts and stops
//! service groups in lock-step with the rest of the cluster:
//!
//! ```text
//! Node phases:  Connecting → Starting → Running → Stopping → Terminated
//! Group phases: NotCreated → Created → Running → NotCreated
//!
//! Connecting → Starting:  self in topology and every member connected
//! Starting:               advance the first non-running group once every
//!                         member has caught up with it (or the cluster runs)
//! Stopping:               tear down the last created group, on cluster-wide
//!                         shutdown only after every member vacated later groups
//! Starting/Running → Connecting: removed from the topology and every shard stopped
//! ```
//!
//! [`Coordinator`] is the synchronous state machine. [`actor`] runs it on a
//! single task and executes group operations on spawned helper tasks.

pub mod actor;
pub mod barrier;
pub mod groups;

pub use actor::{CoordinatorCommand, CoordinatorHandle, CoordinatorStatus};
pub use barrier::{ClusterView, MemberView};
pub use groups::{GroupOperation, LocalShard, OperationKind, OperationOutcome, PlannedShard};

use crate::config::{ClusterConfig, ServiceGroupConfig};
use crate::connection::{ClusterChangedEvent, ConnectionManagerHandle};
use crate::error::ClusterFault;
use crate::metrics;
use crate::node_info::{NodeInfo, NodeLifecyclePhase, ServiceGroupPhase, ShardHandle};
use crate::topology::{ClusterTopologySpec, NodeAddress, WorkloadKind};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Result of one step of the state machine
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// State changed, step again
    CallAgain,
    /// Nothing to do until the next external event
    Wait,
    /// Run this operation, then step again once its outcome arrives
    Run(GroupOperation),
}

pub struct Coordinator {
    self_address: NodeAddress,
    topology: Arc<ClusterTopologySpec>,
    groups: Vec<ServiceGroupConfig>,
    public_address: Option<String>,
    started_at: DateTime<Utc>,
    ready_timeout: Duration,

    phase: NodeLifecyclePhase,
    group_phases: Vec<ServiceGroupPhase>,
    shards: BTreeMap<WorkloadKind, LocalShard>,
    view: Option<ClusterView>,

    node_shutdown_requested: bool,
    cluster_shutdown_requested: bool,
    coordinated_shutdown: bool,

    in_flight: Option<OperationKind>,
    /// Removed from the topology, teardown not launched yet
    kick_pending: bool,
    /// Shards are no longer advertised to peers
    withdrawn: bool,
    fault: Option<ClusterFault>,

    connection: ConnectionManagerHandle,
    status: Arc<watch::Sender<CoordinatorStatus>>,
}

impl Coordinator {
    pub fn new(
        config: &ClusterConfig,
        connection: ConnectionManagerHandle,
        status: Arc<watch::Sender<CoordinatorStatus>>,
    ) -> Self {
        Self {
            self_address: config.self_address.clone(),
            topology: Arc::new(config.topology.clone()),
            groups: config.service_groups.clone(),
            public_address: config.public_address.clone(),
            started_at: Utc::now(),
            ready_timeout: config.shard_ready_timeout(),
            phase: NodeLifecyclePhase::Connecting,
            group_phases: vec![ServiceGroupPhase::NotCreated; config.service_groups.len()],
            shards: BTreeMap::new(),
            view: None,
            node_shutdown_requested: false,
            cluster_shutdown_requested: false,
            coordinated_shutdown: false,
            in_flight: None,
            kick_pending: false,
            withdrawn: false,
            fault: None,
            connection,
            status,
        }
    }

    pub fn phase(&self) -> NodeLifecyclePhase {
        self.phase
    }

    pub fn group_phases(&self) -> &[ServiceGroupPhase] {
        &self.group_phases
    }

    pub fn fault(&self) -> Option<&ClusterFault> {
        self.fault.as_ref()
    }

    pub fn view(&self) -> Option<&ClusterView> {
        self.view.as_ref()
    }

    pub fn local_shards(&self) -> impl Iterator<Item = &LocalShard> {
        self.shards.values()
    }

    pub fn status_sender(&self) -> Arc<watch::Sender<CoordinatorStatus>> {
        Arc::clone(&self.status)
    }

    fn shutdown_requested(&self) -> bool {
        self.node_shutdown_requested || self.cluster_shutdown_requested
    }

    /// Info this node currently publishes about itself
    pub fn node_info(&self) -> NodeInfo {
        let shard_handles = if self.withdrawn {
            BTreeMap::new()
        } else {
            self.shards
                .iter()
                .map(|(kind, shard)| (*kind, shard.handle.clone()))
                .collect()
        };
        NodeInfo {
            public_address: self.public_address.clone(),
            phase: self.phase,
            cluster_shutdown_requested: self.cluster_shutdown_requested,
            group_phases: self.group_phases.clone(),
            process_started_at: self.started_at,
            shard_handles,
        }
    }

    /// Push local info to the connection manager. Every member, self
    /// included, observes it as a cluster change.
    pub fn publish_info(&mut self) {
        if let Some(view) = &mut self.view {
            view.update_self(self.phase, &self.group_phases);
        }
        if let Err(e) = self.connection.set_self_info(self.node_info()) {
            debug!("Cannot publish node info: {}", e);
        }
    }

    fn set_phase(&mut self, phase: NodeLifecyclePhase, reason: &str) {
        if phase == self.phase {
            return;
        }
        info!(from = %self.phase, to = %phase, reason, "Switching node phase");
        self.phase = phase;
        metrics::update_local_phase(phase);
        self.publish_status();
        self.publish_info();
    }

    fn publish_status(&self) {
        let status = CoordinatorStatus {
            phase: self.phase,
            coordinated_shutdown: self.coordinated_shutdown,
            fault: self.fault.clone(),
        };
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    fn set_group_phase(&mut self, group: usize, phase: ServiceGroupPhase) {
        self.group_phases[group] = phase;
        metrics::record_group_transition(&self.groups[group].name, phase);
        self.publish_info();
    }

    /// Enter `Terminated` because local state can no longer be trusted
    fn fail(&mut self, fault: ClusterFault) {
        if self.fault.is_some() {
            return;
        }
        error!(exit_code = fault.exit_code(), "Fatal cluster fault: {}", fault);
        self.fault = Some(fault);
        self.coordinated_shutdown = false;
        self.kick_pending = false;
        self.set_phase(NodeLifecyclePhase::Terminated, "fatal fault");
        self.publish_status();
    }

    pub fn request_node_shutdown(&mut self) {
        if !self.node_shutdown_requested {
            info!("Node shutdown requested");
        }
        self.node_shutdown_requested = true;
        self.publish_info();
    }

    pub fn request_cluster_shutdown(&mut self) {
        if !self.cluster_shutdown_requested {
            info!("Cluster shutdown requested");
        }
        self.cluster_shutdown_requested = true;
        self.publish_info();
    }

    pub fn on_cluster_changed(&mut self, event: &ClusterChangedEvent) {
        let view = ClusterView::from_event(event, &self.self_address, self.phase, &self.group_phases);

        let was_member = self.view.as_ref().is_some_and(ClusterView::contains_self);
        if was_member && !view.contains_self() {
            self.on_kicked();
        }
        self.view = Some(view);

        if !self.cluster_shutdown_requested {
            let requested_by = event
                .members
                .iter()
                .filter(|m| m.is_connected && m.address != self.self_address)
                .find(|m| m.info.as_ref().is_some_and(|i| i.cluster_shutdown_requested));
            if let Some(member) = requested_by {
                info!(peer = %member.address, "Cluster shutdown requested by peer");
                self.cluster_shutdown_requested = true;
                self.publish_info();
            }
        }
    }

    fn on_kicked(&mut self) {
        match self.phase {
            NodeLifecyclePhase::Starting | NodeLifecyclePhase::Running => {
                if self.in_flight == Some(OperationKind::Teardown) || self.kick_pending {
                    return;
                }
                info!("This node was removed from the cluster, stopping all shards and returning to connecting");
                // Peers must stop using our shards right away, before they are actually stopped
                self.group_phases.fill(ServiceGroupPhase::NotCreated);
                self.withdrawn = true;
                self.kick_pending = true;
                self.publish_info();
            }
            // Shutdown continues without a barrier
            _ => debug!(phase = %self.phase, "Removed from the cluster"),
        }
    }

    /// A locally owned shard stopped without being asked to
    pub fn on_shard_terminated(&mut self, handle: &ShardHandle) {
        let Some(kind) = self
            .shards
            .iter()
            .find(|(_, shard)| shard.handle == *handle)
            .map(|(kind, _)| *kind)
        else {
            // Already being stopped, or from an earlier incarnation
            debug!(shard = %handle, "Ignoring termination of a shard that is not owned");
            return;
        };

        match self.phase {
            NodeLifecyclePhase::Connecting | NodeLifecyclePhase::Starting => {
                error!(shard = %handle, phase = %self.phase, "Shard crashed during boot, cannot proceed");
                let shard = self.shards.get(&kind).map(|s| s.id.to_string()).unwrap_or_default();
                self.fail(ClusterFault::ShardCrashedDuringBoot {
                    shard,
                    phase: self.phase,
                });
            }
            NodeLifecyclePhase::Running => {
                error!(shard = %handle, "Shard crashed unexpectedly, shutting down node");
                self.shards.remove(&kind);
                self.set_phase(NodeLifecyclePhase::Stopping, "unexpected shard crash");
            }
            NodeLifecyclePhase::Stopping | NodeLifecyclePhase::Terminated => {
                error!(shard = %handle, phase = %self.phase, "Shard crashed during shutdown, continuing");
                self.shards.remove(&kind);
                self.publish_info();
            }
        }
    }

    pub fn on_operation_complete(&mut self, outcome: OperationOutcome) {
        self.in_flight = None;
        if self.fault.is_some() {
            return;
        }

        match outcome {
            OperationOutcome::Created { group, result } => match result {
                Ok(shards) => {
                    for shard in shards {
                        self.shards.insert(shard.kind, shard);
                    }
                    if !self.kick_pending {
                        self.set_group_phase(group, ServiceGroupPhase::Created);
                    }
                }
                Err(fault) => self.fail(fault),
            },
            OperationOutcome::Started { group, result } => match result {
                Ok(()) => {
                    if !self.kick_pending {
                        self.set_group_phase(group, ServiceGroupPhase::Running);
                    }
                }
                Err(fault) => self.fail(fault),
            },
            OperationOutcome::Stopped { group, all_stopped } => {
                if !all_stopped {
                    warn!(group = %self.groups[group].name, "Service group did not stop cleanly, continuing shutdown");
                }
                self.set_group_phase(group, ServiceGroupPhase::NotCreated);
            }
            OperationOutcome::TornDown { all_stopped } => {
                self.withdrawn = false;
                if all_stopped {
                    self.set_phase(NodeLifecyclePhase::Connecting, "removed from cluster");
                } else {
                    // A shard may still be alive; rejoining could run it twice
                    self.fail(ClusterFault::KickedTeardownFailed);
                }
            }
        }
    }

    /// Shards of `group` hosted by this node
    fn plan_group(&self, group: usize) -> Vec<PlannedShard> {
        self.groups[group]
            .workloads
            .iter()
            .filter_map(|workload| {
                let id = self.topology.resolve_shard_id(workload.kind, &self.self_address)?;
                Some(PlannedShard {
                    kind: workload.kind,
                    name: workload.name.clone(),
                    id,
                    shutdown_timeout: workload.shutdown_timeout(),
                })
            })
            .collect()
    }

    fn take_group_shards(&mut self, group: usize) -> Vec<LocalShard> {
        self.groups[group]
            .workloads
            .iter()
            .filter_map(|workload| self.shards.remove(&workload.kind))
            .collect()
    }

    fn launch(&mut self, operation: GroupOperation) -> Step {
        self.in_flight = Some(operation.kind());
        Step::Run(operation)
    }

    /// Advance the state machine as far as possible without waiting
    pub fn step(&mut self) -> Step {
        if self.in_flight.is_some() {
            return Step::Wait;
        }

        if self.kick_pending {
            self.kick_pending = false;
            let groups = (0..self.groups.len())
                .rev()
                .map(|group| (self.groups[group].name.clone(), self.take_group_shards(group)))
                .collect();
            return self.launch(GroupOperation::Teardown { groups });
        }

        match self.phase {
            NodeLifecyclePhase::Connecting => {
                if self.shutdown_requested() {
                    self.set_phase(NodeLifecyclePhase::Stopping, "shutdown requested");
                    return Step::CallAgain;
                }
                let Some(view) = &self.view else {
                    return Step::Wait;
                };
                if !view.contains_self() || !view.all_connected() {
                    return Step::Wait;
                }
                info!(topology_id = view.topology_id, "Connection established to all cluster peers");
                self.set_phase(NodeLifecyclePhase::Starting, "peers connected");
                Step::CallAgain
            }

            NodeLifecyclePhase::Starting => {
                if self.shutdown_requested() {
                    self.set_phase(NodeLifecyclePhase::Stopping, "shutdown requested");
                    return Step::CallAgain;
                }
                let Some(group) = self
                    .group_phases
                    .iter()
                    .position(|p| *p != ServiceGroupPhase::Running)
                else {
                    info!("All service groups started");
                    self.set_phase(NodeLifecyclePhase::Running, "service groups started");
                    return Step::CallAgain;
                };

                let local = self.group_phases[group];
                let Some(view) = &self.view else {
                    return Step::Wait;
                };
                if !barrier::can_advance_start(view, group, local) {
                    return Step::Wait;
                }

                info!(
                    group = %self.groups[group].name,
                    from = ?local,
                    members = %view.group_phases(group),
                    "Service group starting transition"
                );
                let name = self.groups[group].name.clone();
                match local {
                    ServiceGroupPhase::NotCreated => {
                        let shards = self.plan_group(group);
                        self.launch(GroupOperation::Create { group, name, shards })
                    }
                    ServiceGroupPhase::Created => {
                        let shards = self.groups[group]
                            .workloads
                            .iter()
                            .filter_map(|w| self.shards.get(&w.kind).cloned())
                            .collect();
                        let ready_timeout = self.ready_timeout;
                        self.launch(GroupOperation::Start {
                            group,
                            name,
                            shards,
                            ready_timeout,
                        })
                    }
                    ServiceGroupPhase::Running => Step::Wait,
                }
            }

            NodeLifecyclePhase::Running => {
                if self.shutdown_requested() {
                    self.set_phase(NodeLifecyclePhase::Stopping, "shutdown requested");
                    return Step::CallAgain;
                }
                Step::Wait
            }

            NodeLifecyclePhase::Stopping => {
                let Some(group) = self
                    .group_phases
                    .iter()
                    .rposition(|p| *p != ServiceGroupPhase::NotCreated)
                else {
                    info!(coordinated = self.cluster_shutdown_requested, "All service groups stopped");
                    self.coordinated_shutdown = self.cluster_shutdown_requested;
                    self.set_phase(NodeLifecyclePhase::Terminated, "service groups stopped");
                    return Step::CallAgain;
                };

                let local = self.group_phases[group];
                if !barrier::can_stop_group(
                    self.view.as_ref(),
                    group,
                    local,
                    self.cluster_shutdown_requested,
                ) {
                    return Step::Wait;
                }

                let name = self.groups[group].name.clone();
                let shards = self.take_group_shards(group);
                self.launch(GroupOperation::Stop { group, name, shards })
            }

            NodeLifecyclePhase::Terminated => Step::Wait,
        }
    }
}
