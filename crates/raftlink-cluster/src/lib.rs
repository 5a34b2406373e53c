//! raftlink-cluster — node discovery, group membership, topic events, and
//! the `Cluster` composition root that runs them over the messaging layer.

pub mod balancer;
pub mod cluster;
pub mod discovery;
pub mod error;
pub mod event;
pub mod event_service;
pub mod membership;
pub mod protocol;

pub use cluster::Cluster;
pub use discovery::{
    BootstrapDiscoveryProvider, BootstrapService, DefaultNodeDiscoveryService, NodeDiscoveryProvider,
};
pub use error::{ClusterError, ClusterResult};
pub use event::{
    ClusterMembershipEvent, GroupMembershipEvent, MembershipEventType, NodeDiscoveryEvent,
    NodeDiscoveryEventType,
};
pub use event_service::{ClusterEventService, Subscription, SubscriptionAnnouncement};
pub use membership::{ClusterMembershipService, DefaultClusterMembershipService};
pub use protocol::{DiscoveryMembershipProtocol, GroupMembershipProtocol};
