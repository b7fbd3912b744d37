//! Cluster observability metrics
//!
//! Recorded through the `metrics` facade, exported by whatever recorder the
//! binary installs:
//! - Expected and connected cluster nodes
//! - Local lifecycle phase (one-hot)
//! - Protocol rejections and topology installs
//! - Service group transitions and shard stop outcomes

use crate::node_info::{NodeLifecyclePhase, ServiceGroupPhase};
use std::time::{Duration, Instant};

/// Update node count gauges, called once per reconciliation tick
pub fn update_cluster_nodes(expected: usize, connected: usize) {
    metrics::gauge!("fleet_cluster_expected_nodes").set(expected as f64);
    metrics::gauge!("fleet_cluster_connected_nodes").set(connected as f64);
}

/// Set the one-hot phase gauge for the local node
pub fn update_local_phase(current: NodeLifecyclePhase) {
    for phase in NodeLifecyclePhase::ALL {
        metrics::gauge!(
            "fleet_cluster_phase",
            "phase" => phase.as_str(),
        )
        .set(if phase == current { 1.0 } else { 0.0 });
    }
}

/// Record a dropped protocol message (cookie_mismatch, wrong_reply_token, stale_topology, ...)
pub fn record_protocol_rejection(reason: &'static str) {
    metrics::counter!(
        "fleet_cluster_protocol_rejections_total",
        "reason" => reason,
    )
    .increment(1);
}

/// Record installation of a new topology. `source` is `formed` on the leader and `accepted` on followers.
pub fn record_topology_installed(source: &'static str, member_count: usize) {
    metrics::counter!(
        "fleet_cluster_topology_changes_total",
        "source" => source,
    )
    .increment(1);
    metrics::gauge!("fleet_cluster_topology_members").set(member_count as f64);
}

/// Record a completed handshake. `node_set` is `unknown` for addresses outside the topology.
pub fn record_handshake_completed(node_set: &str) {
    metrics::counter!(
        "fleet_cluster_handshakes_total",
        "node_set" => node_set.to_string(),
    )
    .increment(1);
}

/// Record a service group reaching `phase`
pub fn record_group_transition(group: &str, phase: ServiceGroupPhase) {
    let phase = match phase {
        ServiceGroupPhase::NotCreated => "not_created",
        ServiceGroupPhase::Created => "created",
        ServiceGroupPhase::Running => "running",
    };
    metrics::counter!(
        "fleet_cluster_group_transitions_total",
        "group" => group.to_string(),
        "phase" => phase,
    )
    .increment(1);
}

/// Record the outcome of stopping one shard
pub fn record_shard_stop(kind: &str, outcome: &'static str) {
    metrics::counter!(
        "fleet_cluster_shard_stops_total",
        "kind" => kind.to_string(),
        "outcome" => outcome,
    )
    .increment(1);
}

fn record_group_operation_duration(operation: &'static str, group: &str, duration: Duration) {
    metrics::histogram!(
        "fleet_cluster_group_operation_duration_seconds",
        "operation" => operation,
        "group" => group.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Guard for timing service group operations
pub struct GroupOperationTimer {
    operation: &'static str,
    group: String,
    start: Instant,
}

impl GroupOperationTimer {
    pub fn new(operation: &'static str, group: &str) -> Self {
        Self {
            operation,
            group: group.to_string(),
            start: Instant::now(),
        }
    }

    /// Record duration and return it for logging
    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        record_group_operation_duration(self.operation, &self.group, duration);
        duration
    }
}
