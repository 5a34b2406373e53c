//! Multi-node clusters over loopback TCP.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use raftlink_cluster::{
    BootstrapService, Cluster, ClusterMembershipService, ClusterResult, NodeDiscoveryEvent,
    NodeDiscoveryProvider,
};
use raftlink_core::{
    Address, ClusterConfig, EventListener, ListenerId, ListenerRegistry, MemberId, Node, NodeConfig,
};
use raftlink_messaging::HandlerError;
use tokio::runtime::Handle;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn config(id: &str, port: u16, peers: &[(&str, u16)]) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.cluster_id = "it-cluster".into();
    config.node.id = Some(id.into());
    config.node.address = Address::new("127.0.0.1", port);
    config.event_service.subscription_sync_interval_ms = 100;
    config.discovery.nodes = peers
        .iter()
        .map(|(id, port)| NodeConfig {
            id: Some(id.to_string()),
            address: Address::new("127.0.0.1", *port),
        })
        .collect();
    config
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn three_nodes() -> Vec<Cluster> {
    let ports = [free_port(), free_port(), free_port()];
    let peers = [("a", ports[0]), ("b", ports[1]), ("c", ports[2])];
    let mut nodes = Vec::new();
    for (id, port) in peers {
        let cluster = Cluster::from_config(config(id, port, &peers)).unwrap();
        cluster.start().await.unwrap();
        nodes.push(cluster);
    }
    nodes
}

async fn stop_all(nodes: Vec<Cluster>) {
    for node in nodes {
        node.stop().await;
    }
}

fn text(payload: Bytes) -> Result<String, HandlerError> {
    Ok(String::from_utf8(payload.to_vec())?)
}

fn bytes(reply: String) -> Result<Bytes, HandlerError> {
    Ok(Bytes::from(reply))
}

#[tokio::test]
async fn bootstrap_nodes_become_members() {
    let nodes = three_nodes().await;
    for node in &nodes {
        let ids: BTreeSet<String> = node
            .membership()
            .members()
            .iter()
            .map(|m| m.id().to_string())
            .collect();
        assert_eq!(ids, BTreeSet::from(["a".into(), "b".into(), "c".into()]));
        assert!(node.membership().members().iter().all(|m| m.is_active()));
    }
    stop_all(nodes).await;
}

#[tokio::test]
async fn send_reaches_remote_subscriber() {
    let nodes = three_nodes().await;
    let _sub = nodes[1].events().subscribe(
        "ping",
        text,
        |s: String| format!("pong {s}"),
        bytes,
        Handle::current(),
    );

    let a = &nodes[0];
    eventually("subscription announcement", || {
        a.events().get_subscribers("ping").contains(&MemberId::from("b"))
    })
    .await;

    let reply = a.events().send("ping", Bytes::from_static(b"1")).await.unwrap();
    assert_eq!(reply.as_ref(), b"pong 1");
    stop_all(nodes).await;
}

#[tokio::test]
async fn send_round_robins_across_subscribers() {
    let nodes = three_nodes().await;
    let mut subs = Vec::new();
    for (i, node) in nodes.iter().enumerate().skip(1) {
        let name = ["a", "b", "c"][i].to_string();
        subs.push(node.events().subscribe_json(
            "who",
            move |_: ()| name.clone(),
            Handle::current(),
        ));
    }

    let a = &nodes[0];
    eventually("both subscribers", || a.events().get_subscribers("who").len() == 2).await;

    let mut seen = BTreeSet::new();
    for _ in 0..4 {
        let who: String = a.events().send_json("who", &()).await.unwrap();
        seen.insert(who);
    }
    assert_eq!(seen, BTreeSet::from(["b".to_string(), "c".to_string()]));
    stop_all(nodes).await;
}

#[tokio::test]
async fn broadcast_reaches_every_member() {
    let nodes = three_nodes().await;
    let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut subs = Vec::new();
    for node in &nodes {
        let hits = hits.clone();
        subs.push(node.events().subscribe_consumer(
            "news",
            text,
            move |_s: String| {
                hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            },
            Handle::current(),
        ));
    }

    let a = &nodes[0];
    eventually("all subscribers", || a.events().get_subscribers("news").len() == 3).await;
    a.events()
        .broadcast("news", Bytes::from_static(b"hello"))
        .await
        .unwrap();
    eventually("broadcast delivery", || {
        hits.load(std::sync::atomic::Ordering::SeqCst) == 3
    })
    .await;
    stop_all(nodes).await;
}

// ── Dynamic discovery ──────────────────────────────────────────────

/// Provider shared by every node in the test, driven by the test body.
#[derive(Default)]
struct SharedProvider {
    nodes: RwLock<Vec<Node>>,
    listeners: ListenerRegistry<NodeDiscoveryEvent>,
}

impl SharedProvider {
    fn add(&self, node: Node) {
        self.nodes.write().unwrap().push(node.clone());
        self.listeners.post(&NodeDiscoveryEvent::join(node));
    }

    fn remove(&self, node: &Node) {
        self.nodes.write().unwrap().retain(|n| n.id != node.id);
        self.listeners.post(&NodeDiscoveryEvent::leave(node.clone()));
    }
}

#[async_trait]
impl NodeDiscoveryProvider for SharedProvider {
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

#[tokio::test]
async fn leave_event_drops_member_and_its_subscriptions() {
    let (pa, pb) = (free_port(), free_port());
    let node_b = Node::new("b", Address::new("127.0.0.1", pb));

    // Each node gets its own provider so only `a` sees `b` leave.
    let provider_a = Arc::new(SharedProvider::default());
    let a = Cluster::with_provider(config("a", pa, &[]), provider_a.clone()).unwrap();
    let provider_b = Arc::new(SharedProvider::default());
    let b = Cluster::with_provider(config("b", pb, &[]), provider_b.clone()).unwrap();
    a.start().await.unwrap();
    b.start().await.unwrap();

    provider_a.add(node_b.clone());
    provider_b.add(Node::new("a", Address::new("127.0.0.1", pa)));
    assert!(a.membership().member(&"b".into()).is_some());

    let _sub = b.events().subscribe(
        "jobs",
        text,
        |s: String| s,
        bytes,
        Handle::current(),
    );
    eventually("subscription announcement", || {
        a.events().get_subscribers("jobs").contains(&MemberId::from("b"))
    })
    .await;

    provider_a.remove(&node_b);
    assert!(a.membership().member(&"b".into()).is_none());
    assert!(a.events().get_subscribers("jobs").is_empty());

    a.stop().await;
    b.stop().await;
}
