//! Node discovery.
//!
//! A [`NodeDiscoveryProvider`] reports which nodes exist. The
//! [`DefaultNodeDiscoveryService`] wraps one provider, gives it a lifecycle,
//! and republishes its events to its own listeners.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use raftlink_core::{EventListener, ListenerId, ListenerRegistry, Node};
use raftlink_messaging::MessagingService;
use tracing::info;

use crate::error::ClusterResult;
use crate::event::NodeDiscoveryEvent;

/// Services available to discovery providers and membership protocols
/// while joining.
#[derive(Clone)]
pub struct BootstrapService {
    messaging: Arc<dyn MessagingService>,
}

impl BootstrapService {
    pub fn new(messaging: Arc<dyn MessagingService>) -> Self {
        Self { messaging }
    }

    pub fn messaging(&self) -> &Arc<dyn MessagingService> {
        &self.messaging
    }
}

/// Pluggable strategy that reports cluster nodes.
#[async_trait]
pub trait NodeDiscoveryProvider: Send + Sync {
    /// Nodes currently known to the provider.
    fn nodes(&self) -> Vec<Node>;

    async fn join(&self, bootstrap: &BootstrapService, local: &Node) -> ClusterResult<()>;

    async fn leave(&self, local: &Node) -> ClusterResult<()>;

    fn add_listener(&self, listener: Arc<dyn EventListener<NodeDiscoveryEvent>>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Static provider seeded with a fixed node list. It never emits events.
pub struct BootstrapDiscoveryProvider {
    nodes: Vec<Node>,
    listeners: ListenerRegistry<NodeDiscoveryEvent>,
}

impl BootstrapDiscoveryProvider {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            listeners: ListenerRegistry::new(),
        }
    }
}

#[async_trait]
impl NodeDiscoveryProvider for BootstrapDiscoveryProvider {
    fn nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    async fn join(&self, _bootstrap: &BootstrapService, local: &Node) -> ClusterResult<()> {
        info!(node = %local, nodes = self.nodes.len(), "joined bootstrap discovery");
        Ok(())
    }

    async fn leave(&self, local: &Node) -> ClusterResult<()> {
        info!(node = %local, "left bootstrap discovery");
        Ok(())
    }

    fn add_listener(&self, listener: Arc<dyn EventListener<NodeDiscoveryEvent>>) -> ListenerId {
        self.listeners.add_listener(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove_listener(id)
    }
}

/// Runs a provider for the local node.
pub struct DefaultNodeDiscoveryService {
    provider: Arc<dyn NodeDiscoveryProvider>,
    bootstrap: BootstrapService,
    local: Node,
    listeners: Arc<ListenerRegistry<NodeDiscoveryEvent>>,
    provider_listener: Mutex<Option<ListenerId>>,
    started: AtomicBool,
}

impl DefaultNodeDiscoveryService {
    pub fn new(
        bootstrap: BootstrapService,
        local: Node,
        provider: Arc<dyn NodeDiscoveryProvider>,
    ) -> Self {
        Self {
            provider,
            bootstrap,
            local,
            listeners: Arc::new(ListenerRegistry::new()),
            provider_listener: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn local_node(&self) -> &Node {
        &self.local
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.provider.nodes()
    }

    pub fn node(&self, id: &raftlink_core::NodeId) -> Option<Node> {
        self.provider.nodes().into_iter().find(|n| &n.id == id)
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener<NodeDiscoveryEvent>>) -> ListenerId {
        self.listeners.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove_listener(id)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub async fn start(&self) -> ClusterResult<()> {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let listeners = self.listeners.clone();
        let id = self
            .provider
            .add_listener(Arc::new(move |event: &NodeDiscoveryEvent| listeners.post(event)));
        *self.provider_listener.lock().expect("listener id lock poisoned") = Some(id);

        if let Err(e) = self.provider.join(&self.bootstrap, &self.local).await {
            self.detach();
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        info!(node = %self.local, "started node discovery service");
        Ok(())
    }

    pub async fn stop(&self) -> ClusterResult<()> {
        if self
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let result = self.provider.leave(&self.local).await;
        self.detach();
        info!(node = %self.local, "stopped node discovery service");
        result
    }

    fn detach(&self) {
        let id = self
            .provider_listener
            .lock()
            .expect("listener id lock poisoned")
            .take();
        if let Some(id) = id {
            self.provider.remove_listener(id);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::RwLock;

    /// Provider whose node set is driven by the test.
    #[derive(Default)]
    pub struct ManualDiscoveryProvider {
        nodes: RwLock<Vec<Node>>,
        pub(crate) listeners: ListenerRegistry<NodeDiscoveryEvent>,
    }

    impl ManualDiscoveryProvider {
        pub fn with_nodes(nodes: Vec<Node>) -> Self {
            Self {
                nodes: RwLock::new(nodes),
                listeners: ListenerRegistry::new(),
            }
        }

        pub fn add(&self, node: Node) {
            self.nodes.write().unwrap().push(node.clone());
            self.listeners.post(&NodeDiscoveryEvent::join(node));
        }

        pub fn remove(&self, node: Node) {
            self.nodes.write().unwrap().retain(|n| n.id != node.id);
            self.listeners.post(&NodeDiscoveryEvent::leave(node));
        }
    }

    #[async_trait]
    impl NodeDiscoveryProvider for ManualDiscoveryProvider {
        fn nodes(&self) -> Vec<Node> {
            self.nodes.read().unwrap().clone()
        }

        async fn join(&self, _bootstrap: &BootstrapService, _local: &Node) -> ClusterResult<()> {
            Ok(())
        }

        async fn leave(&self, _local: &Node) -> ClusterResult<()> {
            Ok(())
        }

        fn add_listener(&self, listener: Arc<dyn EventListener<NodeDiscoveryEvent>>) -> ListenerId {
            self.listeners.add_listener(listener)
        }

        fn remove_listener(&self, id: ListenerId) -> bool {
            self.listeners.remove_listener(id)
        }
    }

    pub fn bootstrap() -> BootstrapService {
        use raftlink_core::{Address, MessagingConfig};
        use raftlink_messaging::TcpMessagingService;
        BootstrapService::new(Arc::new(TcpMessagingService::new(
            "test",
            Address::new("127.0.0.1", 0),
            MessagingConfig::default(),
        )))
    }
}
