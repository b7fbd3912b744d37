//! Cluster-wide barriers for service group transitions

use crate::connection::ClusterChangedEvent;
use crate::node_info::{NodeLifecyclePhase, ServiceGroupPhase};
use crate::topology::NodeAddress;
use std::fmt;

/// One topology member as the coordinator sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberView {
    pub address: NodeAddress,
    pub is_self: bool,
    pub is_connected: bool,
    pub phase: NodeLifecyclePhase,
    pub group_phases: Vec<ServiceGroupPhase>,
}

impl MemberView {
    pub fn group_phase(&self, group: usize) -> ServiceGroupPhase {
        self.group_phases
            .get(group)
            .copied()
            .unwrap_or(ServiceGroupPhase::NotCreated)
    }
}

/// Phases of every member of the active topology
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterView {
    pub members: Vec<MemberView>,
    pub topology_id: i64,
}

impl ClusterView {
    /// Build a view from an event. Self always uses the local phases so a
    /// late event can never move this node back in time. Disconnected
    /// members count as `Connecting` with nothing created.
    pub fn from_event(
        event: &ClusterChangedEvent,
        self_address: &NodeAddress,
        local_phase: NodeLifecyclePhase,
        local_groups: &[ServiceGroupPhase],
    ) -> Self {
        let members = event
            .members
            .iter()
            .map(|member| {
                if member.address == *self_address {
                    return MemberView {
                        address: member.address.clone(),
                        is_self: true,
                        is_connected: true,
                        phase: local_phase,
                        group_phases: local_groups.to_vec(),
                    };
                }
                match (&member.info, member.is_connected) {
                    (Some(info), true) => MemberView {
                        address: member.address.clone(),
                        is_self: false,
                        is_connected: true,
                        phase: info.phase,
                        group_phases: info.group_phases.clone(),
                    },
                    _ => MemberView {
                        address: member.address.clone(),
                        is_self: false,
                        is_connected: false,
                        phase: NodeLifecyclePhase::Connecting,
                        group_phases: vec![ServiceGroupPhase::NotCreated; local_groups.len()],
                    },
                }
            })
            .collect();

        Self {
            members,
            topology_id: event.topology_id,
        }
    }

    pub fn contains(&self, address: &NodeAddress) -> bool {
        self.members.iter().any(|m| &m.address == address)
    }

    pub fn contains_self(&self) -> bool {
        self.members.iter().any(|m| m.is_self)
    }

    pub fn all_connected(&self) -> bool {
        self.members.iter().all(|m| m.is_connected)
    }

    /// Refresh the self entry after a local change
    pub fn update_self(&mut self, phase: NodeLifecyclePhase, groups: &[ServiceGroupPhase]) {
        for member in self.members.iter_mut().filter(|m| m.is_self) {
            member.phase = phase;
            member.group_phases = groups.to_vec();
        }
    }

    /// Every member's phase for `group`, for logging
    pub fn group_phases(&self, group: usize) -> GroupPhases<'_> {
        GroupPhases { view: self, group }
    }
}

pub struct GroupPhases<'a> {
    view: &'a ClusterView,
    group: usize,
}

impl fmt::Display for GroupPhases<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, member) in self.view.members.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}", member.group_phase(self.group))?;
        }
        f.write_str("]")
    }
}

/// Whether `group` may advance out of `local` while starting.
///
/// Every member, disconnected ones included, must have reached `local` for that
/// group, unless some connected member already runs. In that case the cluster is
/// live and this node is joining late.
pub fn can_advance_start(view: &ClusterView, group: usize, local: ServiceGroupPhase) -> bool {
    let in_sync = view.members.iter().all(|m| m.group_phase(group) >= local);
    let cluster_running = view
        .members
        .iter()
        .any(|m| m.is_connected && m.phase == NodeLifecyclePhase::Running);
    in_sync || cluster_running
}

/// Whether `group`, currently at `local`, may be torn down.
///
/// A node-only shutdown never waits. A cluster-wide one tears down groups in
/// strict reverse start order across all members, except for a group that was
/// never started or when this node is no longer a member.
pub fn can_stop_group(
    view: Option<&ClusterView>,
    group: usize,
    local: ServiceGroupPhase,
    cluster_shutdown: bool,
) -> bool {
    if !cluster_shutdown || local == ServiceGroupPhase::Created {
        return true;
    }
    let Some(view) = view.filter(|v| v.contains_self()) else {
        return true;
    };
    view.members.iter().all(|member| {
        member.group_phases.iter().skip(group + 1).all(|p| *p == ServiceGroupPhase::NotCreated)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ClusterMember;
    use crate::node_info::NodeInfo;
    use chrono::Utc;
    use ServiceGroupPhase::*;

    fn addr(port: u16) -> NodeAddress {
        NodeAddress::new("127.0.0.1", port)
    }

    fn member(port: u16, phase: NodeLifecyclePhase, groups: &[ServiceGroupPhase]) -> MemberView {
        MemberView {
            address: addr(port),
            is_self: port == 6000,
            is_connected: true,
            phase,
            group_phases: groups.to_vec(),
        }
    }

    fn view(members: Vec<MemberView>) -> ClusterView {
        ClusterView {
            members,
            topology_id: 1,
        }
    }

    #[test]
    fn test_start_waits_for_slowest_member() {
        let v = view(vec![
            member(6000, NodeLifecyclePhase::Starting, &[Created, NotCreated]),
            member(6001, NodeLifecyclePhase::Starting, &[NotCreated, NotCreated]),
        ]);
        assert!(!can_advance_start(&v, 0, Created));
        assert!(can_advance_start(&v, 0, NotCreated));
    }

    #[test]
    fn test_start_skips_barrier_when_cluster_running() {
        let v = view(vec![
            member(6000, NodeLifecyclePhase::Starting, &[Created, NotCreated]),
            member(6001, NodeLifecyclePhase::Running, &[Running, Running]),
            MemberView {
                is_connected: false,
                ..member(6002, NodeLifecyclePhase::Connecting, &[NotCreated, NotCreated])
            },
        ]);
        assert!(can_advance_start(&v, 0, Created));
    }

    #[test]
    fn test_disconnected_running_member_does_not_count() {
        let v = view(vec![
            member(6000, NodeLifecyclePhase::Starting, &[Created]),
            MemberView {
                is_connected: false,
                ..member(6001, NodeLifecyclePhase::Running, &[NotCreated])
            },
        ]);
        assert!(!can_advance_start(&v, 0, Created));
    }

    #[test]
    fn test_node_shutdown_never_waits() {
        let v = view(vec![
            member(6000, NodeLifecyclePhase::Stopping, &[Running, Running]),
            member(6001, NodeLifecyclePhase::Running, &[Running, Running]),
        ]);
        assert!(can_stop_group(Some(&v), 0, Running, false));
    }

    #[test]
    fn test_cluster_shutdown_stops_in_reverse_order() {
        let v = view(vec![
            member(6000, NodeLifecyclePhase::Stopping, &[Running, NotCreated, NotCreated]),
            member(6001, NodeLifecyclePhase::Stopping, &[Running, Running, NotCreated]),
        ]);
        assert!(!can_stop_group(Some(&v), 0, Running, true));
        assert!(can_stop_group(Some(&v), 1, Running, true));
    }

    #[test]
    fn test_cluster_shutdown_created_group_stops_immediately() {
        let v = view(vec![
            member(6000, NodeLifecyclePhase::Stopping, &[Created, NotCreated]),
            member(6001, NodeLifecyclePhase::Running, &[Running, Running]),
        ]);
        assert!(can_stop_group(Some(&v), 0, Created, true));
    }

    #[test]
    fn test_cluster_shutdown_outside_topology_stops_immediately() {
        let v = view(vec![member(6001, NodeLifecyclePhase::Running, &[Running, Running])]);
        assert!(can_stop_group(Some(&v), 0, Running, true));
        assert!(can_stop_group(None, 0, Running, true));
    }

    #[test]
    fn test_view_from_event_uses_local_phases_for_self() {
        let mut stale = NodeInfo::new(None, 2, Utc::now());
        stale.phase = NodeLifecyclePhase::Connecting;
        let mut remote = NodeInfo::new(None, 2, Utc::now());
        remote.phase = NodeLifecyclePhase::Starting;
        remote.group_phases = vec![Created, NotCreated];

        let event = ClusterChangedEvent {
            members: vec![
                ClusterMember {
                    address: addr(6000),
                    is_connected: true,
                    info: Some(stale),
                },
                ClusterMember {
                    address: addr(6001),
                    is_connected: true,
                    info: Some(remote),
                },
                ClusterMember {
                    address: addr(6002),
                    is_connected: false,
                    info: None,
                },
            ],
            event_id: 1,
            topology_id: 7,
        };

        let v = ClusterView::from_event(
            &event,
            &addr(6000),
            NodeLifecyclePhase::Starting,
            &[Running, Created],
        );
        assert_eq!(v.topology_id, 7);
        assert!(v.contains_self());
        assert!(!v.all_connected());
        assert_eq!(v.members[0].group_phases, vec![Running, Created]);
        assert_eq!(v.members[1].phase, NodeLifecyclePhase::Starting);
        assert_eq!(v.members[2].group_phases, vec![NotCreated, NotCreated]);
        assert_eq!(v.group_phases(0).to_string(), "[Running, Created, NotCreated]");
    }
}
