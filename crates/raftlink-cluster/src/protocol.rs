//! Group membership protocols.
//!
//! [`DiscoveryMembershipProtocol`] derives the member set directly from node
//! discovery: whatever discovery reports is a member. It keeps a plain map of
//! record keyed by member id; concurrent events apply in delivery order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use raftlink_core::{EventListener, ListenerId, ListenerRegistry, Member, MemberId, Node};
use tracing::{debug, info};

use crate::discovery::{BootstrapService, DefaultNodeDiscoveryService};
use crate::error::ClusterResult;
use crate::event::{GroupMembershipEvent, MembershipEventType, NodeDiscoveryEvent, NodeDiscoveryEventType};

/// Strategy that turns discovery into an authoritative member set.
#[async_trait]
pub trait GroupMembershipProtocol: Send + Sync {
    async fn join(
        &self,
        bootstrap: &BootstrapService,
        discovery: Arc<DefaultNodeDiscoveryService>,
        local: Arc<Member>,
    ) -> ClusterResult<()>;

    async fn leave(&self, local: &Member) -> ClusterResult<()>;

    fn members(&self) -> Vec<Arc<Member>>;

    fn member(&self, id: &MemberId) -> Option<Arc<Member>>;

    fn add_listener(&self, listener: Arc<dyn EventListener<GroupMembershipEvent>>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

type MemberMap = Arc<DashMap<MemberId, Arc<Member>>>;

#[derive(Default)]
pub struct DiscoveryMembershipProtocol {
    members: MemberMap,
    listeners: Arc<ListenerRegistry<GroupMembershipEvent>>,
    subscription: Mutex<Option<(Arc<DefaultNodeDiscoveryService>, ListenerId)>>,
    started: AtomicBool,
}

impl DiscoveryMembershipProtocol {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Member reported by discovery. Discovery is the only liveness signal this
/// protocol has, so reported members count as active and reachable.
fn discovered_member(node: &Node) -> Arc<Member> {
    let member = Member::from_node(node);
    member.set_active(true);
    member.set_reachable(true);
    Arc::new(member)
}

fn handle_discovery_event(
    members: &MemberMap,
    listeners: &ListenerRegistry<GroupMembershipEvent>,
    local: &MemberId,
    event: &NodeDiscoveryEvent,
) {
    let id = MemberId::from(&event.node.id);
    if &id == local {
        debug!(member_id = %id, kind = ?event.kind, "ignoring discovery event for local member");
        return;
    }
    match event.kind {
        NodeDiscoveryEventType::Join => {
            let member = discovered_member(&event.node);
            if members.insert(id, member.clone()).is_none() {
                info!(member = %member, "member added");
                listeners.post(&GroupMembershipEvent::new(MembershipEventType::MemberAdded, member));
            }
        }
        NodeDiscoveryEventType::Leave => {
            if let Some((_, member)) = members.remove(&id) {
                member.set_active(false);
                member.set_reachable(false);
                info!(member = %member, "member removed");
                listeners.post(&GroupMembershipEvent::new(MembershipEventType::MemberRemoved, member));
            }
        }
    }
}

#[async_trait]
impl GroupMembershipProtocol for DiscoveryMembershipProtocol {
    async fn join(
        &self,
        _bootstrap: &BootstrapService,
        discovery: Arc<DefaultNodeDiscoveryService>,
        local: Arc<Member>,
    ) -> ClusterResult<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        for node in discovery.nodes() {
            let member = discovered_member(&node);
            self.members.insert(member.id().clone(), member);
        }
        self.members.insert(local.id().clone(), local.clone());
        self.listeners
            .post(&GroupMembershipEvent::new(MembershipEventType::MemberAdded, local.clone()));

        let members = self.members.clone();
        let listeners = self.listeners.clone();
        let local_id = local.id().clone();
        let id = discovery.add_listener(Arc::new(move |event: &NodeDiscoveryEvent| {
            handle_discovery_event(&members, &listeners, &local_id, event)
        }));
        *self.subscription.lock().expect("subscription lock poisoned") = Some((discovery, id));

        info!(member = %local, members = self.members.len(), "joined discovery membership");
        Ok(())
    }

    async fn leave(&self, local: &Member) -> ClusterResult<()> {
        if self
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let subscription = self
            .subscription
            .lock()
            .expect("subscription lock poisoned")
            .take();
        if let Some((discovery, id)) = subscription {
            discovery.remove_listener(id);
        }
        self.members.clear();
        info!(member = %local, "left discovery membership");
        Ok(())
    }

    fn members(&self) -> Vec<Arc<Member>> {
        self.members.iter().map(|e| e.value().clone()).collect()
    }

    fn member(&self, id: &MemberId) -> Option<Arc<Member>> {
        self.members.get(id).map(|e| e.value().clone())
    }

    fn add_listener(&self, listener: Arc<dyn EventListener<GroupMembershipEvent>>) -> ListenerId {
        self.listeners.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove_listener(id)
    }
}
