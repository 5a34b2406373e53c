//! Discovery and membership events.

use std::fmt;
use std::sync::Arc;

use raftlink_core::{Member, Node, now_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeDiscoveryEventType {
    Join,
    Leave,
}

/// A node appeared or disappeared according to a discovery provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDiscoveryEvent {
    pub kind: NodeDiscoveryEventType,
    pub node: Node,
    pub time: u64,
}

impl NodeDiscoveryEvent {
    pub fn join(node: Node) -> Self {
        Self {
            kind: NodeDiscoveryEventType::Join,
            node,
            time: now_millis(),
        }
    }

    pub fn leave(node: Node) -> Self {
        Self {
            kind: NodeDiscoveryEventType::Leave,
            node,
            time: now_millis(),
        }
    }
}

/// Membership change kinds, shared by protocol- and cluster-level events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipEventType {
    MemberAdded,
    MetadataChanged,
    ReachabilityChanged,
    MemberRemoved,
}

impl fmt::Display for MembershipEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MembershipEventType::MemberAdded => "MEMBER_ADDED",
            MembershipEventType::MetadataChanged => "METADATA_CHANGED",
            MembershipEventType::ReachabilityChanged => "REACHABILITY_CHANGED",
            MembershipEventType::MemberRemoved => "MEMBER_REMOVED",
        };
        f.write_str(name)
    }
}

/// Event emitted by a group membership protocol.
#[derive(Debug, Clone)]
pub struct GroupMembershipEvent {
    pub kind: MembershipEventType,
    pub member: Arc<Member>,
    pub time: u64,
}

impl GroupMembershipEvent {
    pub fn new(kind: MembershipEventType, member: Arc<Member>) -> Self {
        Self {
            kind,
            member,
            time: now_millis(),
        }
    }
}

/// Event emitted by the cluster membership service.
#[derive(Debug, Clone)]
pub struct ClusterMembershipEvent {
    pub kind: MembershipEventType,
    pub member: Arc<Member>,
    pub time: u64,
}

impl From<&GroupMembershipEvent> for ClusterMembershipEvent {
    fn from(event: &GroupMembershipEvent) -> Self {
        Self {
            kind: event.kind,
            member: event.member.clone(),
            time: event.time,
        }
    }
}
