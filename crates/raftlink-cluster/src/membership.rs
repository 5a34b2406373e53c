//! Cluster membership service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use raftlink_core::{Address, EventListener, ListenerId, ListenerRegistry, Member, MemberId};
use tracing::{info, warn};

use crate::discovery::{BootstrapService, DefaultNodeDiscoveryService};
use crate::error::ClusterResult;
use crate::event::{ClusterMembershipEvent, GroupMembershipEvent};
use crate::protocol::GroupMembershipProtocol;

/// Read side of cluster membership.
pub trait ClusterMembershipService: Send + Sync {
    fn local_member(&self) -> Arc<Member>;

    fn members(&self) -> Vec<Arc<Member>>;

    fn member(&self, id: &MemberId) -> Option<Arc<Member>>;

    fn member_by_address(&self, address: &Address) -> Option<Arc<Member>> {
        self.members()
            .into_iter()
            .find(|m| m.address() == address)
    }

    fn add_listener(&self, listener: Arc<dyn EventListener<ClusterMembershipEvent>>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;

    fn is_running(&self) -> bool;
}

/// Membership service driven by a [`GroupMembershipProtocol`].
pub struct DefaultClusterMembershipService {
    local: Arc<Member>,
    bootstrap: BootstrapService,
    discovery: Arc<DefaultNodeDiscoveryService>,
    protocol: Arc<dyn GroupMembershipProtocol>,
    listeners: Arc<ListenerRegistry<ClusterMembershipEvent>>,
    protocol_listener: Mutex<Option<ListenerId>>,
    started: AtomicBool,
}

impl DefaultClusterMembershipService {
    pub fn new(
        local: Arc<Member>,
        bootstrap: BootstrapService,
        discovery: Arc<DefaultNodeDiscoveryService>,
        protocol: Arc<dyn GroupMembershipProtocol>,
    ) -> Self {
        Self {
            local,
            bootstrap,
            discovery,
            protocol,
            listeners: Arc::new(ListenerRegistry::new()),
            protocol_listener: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn discovery(&self) -> &Arc<DefaultNodeDiscoveryService> {
        &self.discovery
    }

    /// Start discovery and join the group. Idempotent while running.
    pub async fn start(&self) -> ClusterResult<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let listeners = self.listeners.clone();
        let id = self.protocol.add_listener(Arc::new(move |event: &GroupMembershipEvent| {
            listeners.post(&ClusterMembershipEvent::from(event))
        }));
        *self.protocol_listener.lock().expect("listener id lock poisoned") = Some(id);

        if let Err(e) = self.join().await {
            warn!(member = %self.local, error = %e, "failed to start membership service");
            self.local.set_active(false);
            self.local.set_reachable(false);
            self.detach();
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        info!(member = %self.local, "started cluster membership service");
        Ok(())
    }

    async fn join(&self) -> ClusterResult<()> {
        self.discovery.start().await?;
        self.local.set_active(true);
        self.local.set_reachable(true);
        self.protocol
            .join(&self.bootstrap, self.discovery.clone(), self.local.clone())
            .await
    }

    /// Leave the group and stop discovery. Both stages run even if the
    /// first fails; the first error is returned.
    pub async fn stop(&self) -> ClusterResult<()> {
        if self
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let left = self.protocol.leave(&self.local).await;
        if let Err(e) = &left {
            warn!(member = %self.local, error = %e, "failed to leave membership group");
        }
        let stopped = self.discovery.stop().await;
        if let Err(e) = &stopped {
            warn!(member = %self.local, error = %e, "failed to stop node discovery");
        }
        self.local.set_active(false);
        self.local.set_reachable(false);
        self.detach();
        info!(member = %self.local, "stopped cluster membership service");
        left.and(stopped)
    }

    fn detach(&self) {
        let id = self
            .protocol_listener
            .lock()
            .expect("listener id lock poisoned")
            .take();
        if let Some(id) = id {
            self.protocol.remove_listener(id);
        }
    }
}

impl ClusterMembershipService for DefaultClusterMembershipService {
    fn local_member(&self) -> Arc<Member> {
        self.local.clone()
    }

    fn members(&self) -> Vec<Arc<Member>> {
        self.protocol.members()
    }

    fn member(&self, id: &MemberId) -> Option<Arc<Member>> {
        self.protocol.member(id)
    }

    fn add_listener(&self, listener: Arc<dyn EventListener<ClusterMembershipEvent>>) -> ListenerId {
        self.listeners.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove_listener(id)
    }

    fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::testing::{ManualDiscoveryProvider, bootstrap};
    use crate::event::MembershipEventType;
    use crate::protocol::DiscoveryMembershipProtocol;
    use raftlink_core::Node;

    fn service(provider: Arc<ManualDiscoveryProvider>) -> DefaultClusterMembershipService {
        let local = Arc::new(Member::new("local", Address::new("127.0.0.1", 1)));
        let discovery = Arc::new(DefaultNodeDiscoveryService::new(
            bootstrap(),
            local.node(),
            provider,
        ));
        DefaultClusterMembershipService::new(
            local,
            bootstrap(),
            discovery,
            Arc::new(DiscoveryMembershipProtocol::new()),
        )
    }

    #[tokio::test]
    async fn test_start_activates_local_member() {
        let svc = service(Arc::new(ManualDiscoveryProvider::default()));
        assert!(!svc.local_member().is_active());

        svc.start().await.unwrap();
        assert!(svc.is_running());
        assert!(svc.discovery().is_running());
        assert!(svc.local_member().is_active());
        assert!(svc.local_member().is_reachable());
        assert_eq!(svc.members().len(), 1);

        svc.stop().await.unwrap();
        assert!(!svc.is_running());
        assert!(!svc.discovery().is_running());
        assert!(!svc.local_member().is_active());
        assert!(svc.members().is_empty());
    }

    #[tokio::test]
    async fn test_events_are_republished() {
        let provider = Arc::new(ManualDiscoveryProvider::default());
        let svc = service(provider.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        svc.add_listener(Arc::new(move |e: &ClusterMembershipEvent| {
            sink.lock().unwrap().push((e.kind, e.member.id().to_string()));
        }));

        svc.start().await.unwrap();
        provider.add(Node::new("peer", Address::new("127.0.0.1", 2)));
        provider.remove(Node::new("peer", Address::new("127.0.0.1", 2)));
        svc.stop().await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (MembershipEventType::MemberAdded, "local".to_string()),
                (MembershipEventType::MemberAdded, "peer".to_string()),
                (MembershipEventType::MemberRemoved, "peer".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_lookup_by_id_and_address() {
        let provider = Arc::new(ManualDiscoveryProvider::with_nodes(vec![Node::new(
            "peer",
            Address::new("10.0.0.2", 5679),
        )]));
        let svc = service(provider);
        svc.start().await.unwrap();

        let peer = svc.member(&"peer".into()).unwrap();
        assert!(peer.is_active());
        let by_addr = svc.member_by_address(&Address::new("10.0.0.2", 5679)).unwrap();
        assert_eq!(by_addr.id(), peer.id());
        assert!(svc.member_by_address(&Address::new("10.0.0.3", 5679)).is_none());

        svc.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let svc = service(Arc::new(ManualDiscoveryProvider::default()));
        svc.start().await.unwrap();
        svc.start().await.unwrap();
        svc.stop().await.unwrap();
        svc.stop().await.unwrap();
        assert!(!svc.is_running());
    }
}
