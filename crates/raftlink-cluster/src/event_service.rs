//! Topic-based publish/subscribe across cluster members.
//!
//! Every member keeps its own subscriptions and tells the others which
//! topics it serves. A topic's subscribers are the members that announced
//! it and are currently active in the membership view.
//!
//! On the wire each topic uses two messaging subjects: the topic name for
//! request/reply (answered by one local subscription, round-robin) and
//! `"{topic}:notify"` for fire-and-forget delivery (fanned out to every
//! local subscription).

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use raftlink_core::{Address, EventServiceConfig, ListenerId, MemberId, now_millis};
use raftlink_messaging::{AsyncHandler, BoxFuture, Consumer, HandlerError, MessagingService};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::balancer::RoundRobinBalancer;
use crate::error::{ClusterError, ClusterResult};
use crate::event::{ClusterMembershipEvent, MembershipEventType};
use crate::membership::ClusterMembershipService;

/// Messaging subject carrying subscription announcements.
pub const SUBSCRIPTION_SUBJECT: &str = "raftlink-cluster-event-subscriptions";

fn notify_subject(topic: &str) -> String {
    format!("{topic}:notify")
}

/// The set of topics one member serves, stamped with a version that only
/// grows. Receivers keep the highest version they have seen per member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAnnouncement {
    pub member: MemberId,
    pub version: u64,
    pub topics: BTreeSet<String>,
}

#[derive(Debug)]
struct RemoteSubscriptions {
    version: u64,
    topics: BTreeSet<String>,
}

// ── Local subscriptions ────────────────────────────────────────────

type RawHandler = Arc<dyn Fn(Bytes) -> BoxFuture<'static, Result<Bytes, HandlerError>> + Send + Sync>;

struct LocalSubscription {
    id: u64,
    handler: RawHandler,
    executor: Handle,
}

impl LocalSubscription {
    async fn invoke(&self, payload: Bytes) -> Result<Bytes, HandlerError> {
        self.executor.spawn((self.handler)(payload)).await?
    }
}

#[derive(Default)]
struct TopicState {
    subscriptions: Vec<Arc<LocalSubscription>>,
    balancer: RoundRobinBalancer,
}

#[derive(Default)]
struct LocalTopics {
    topics: DashMap<String, TopicState>,
}

impl LocalTopics {
    fn next(&self, topic: &str) -> Option<Arc<LocalSubscription>> {
        let state = self.topics.get(topic)?;
        state.balancer.pick(&state.subscriptions).cloned()
    }

    fn all(&self, topic: &str) -> Vec<Arc<LocalSubscription>> {
        self.topics
            .get(topic)
            .map(|s| s.subscriptions.clone())
            .unwrap_or_default()
    }

    fn names(&self) -> BTreeSet<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }
}

fn request_handler(local: Arc<LocalTopics>, topic: String) -> AsyncHandler {
    Arc::new(move |_from: Address, payload: Bytes| -> BoxFuture<'static, Result<Bytes, HandlerError>> {
        let subscription = local.next(&topic);
        let topic = topic.clone();
        Box::pin(async move {
            match subscription {
                Some(s) => s.invoke(payload).await,
                None => Err(format!("no local subscription for topic '{topic}'").into()),
            }
        })
    })
}

fn notify_handler(local: Arc<LocalTopics>, topic: String) -> Consumer {
    Arc::new(move |_from: Address, payload: Bytes| {
        for subscription in local.all(&topic) {
            let work = (subscription.handler)(payload.clone());
            let topic = topic.clone();
            subscription.executor.spawn(async move {
                if let Err(e) = work.await {
                    warn!(topic, error = %e, "subscription handler failed");
                }
            });
        }
    })
}

// ── Service ────────────────────────────────────────────────────────

/// Handle to one local subscription. Dropping it does not unsubscribe;
/// call [`Subscription::close`].
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    topic: String,
    service: Weak<Inner>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remove the subscription. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        match self.service.upgrade() {
            Some(inner) => inner.remove_subscription(&self.topic, self.id),
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct ClusterEventService {
    inner: Arc<Inner>,
}

struct Inner {
    messaging: Arc<dyn MessagingService>,
    membership: Arc<dyn ClusterMembershipService>,
    config: EventServiceConfig,
    local: Arc<LocalTopics>,
    remote: DashMap<MemberId, RemoteSubscriptions>,
    balancers: DashMap<String, RoundRobinBalancer>,
    version: AtomicU64,
    next_subscription: AtomicU64,
    started: AtomicBool,
    runtime: Mutex<Option<Handle>>,
    sync_task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
    membership_listener: Mutex<Option<ListenerId>>,
}

impl ClusterEventService {
    pub fn new(
        messaging: Arc<dyn MessagingService>,
        membership: Arc<dyn ClusterMembershipService>,
        config: EventServiceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                messaging,
                membership,
                config,
                local: Arc::new(LocalTopics::default()),
                remote: DashMap::new(),
                balancers: DashMap::new(),
                // Seeded from the clock so a restarted member outranks its
                // previous incarnation.
                version: AtomicU64::new(now_millis()),
                next_subscription: AtomicU64::new(1),
                started: AtomicBool::new(false),
                runtime: Mutex::new(None),
                sync_task: Mutex::new(None),
                membership_listener: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Start exchanging subscription state with other members.
    pub async fn start(&self) -> ClusterResult<()> {
        let inner = &self.inner;
        if inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        let runtime = Handle::current();
        *inner.runtime.lock().expect("runtime lock poisoned") = Some(runtime.clone());

        let weak = Arc::downgrade(inner);
        inner.messaging.register_consumer(
            SUBSCRIPTION_SUBJECT,
            Arc::new(move |from: Address, payload: Bytes| {
                let Some(inner) = weak.upgrade() else { return };
                match serde_json::from_slice::<SubscriptionAnnouncement>(&payload) {
                    Ok(announcement) => inner.apply_announcement(announcement),
                    Err(e) => warn!(%from, error = %e, "malformed subscription announcement"),
                }
            }),
            runtime.clone(),
        );

        let weak = Arc::downgrade(inner);
        let id = inner
            .membership
            .add_listener(Arc::new(move |event: &ClusterMembershipEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.membership_changed(event);
                }
            }));
        *inner
            .membership_listener
            .lock()
            .expect("listener id lock poisoned") = Some(id);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(sync_loop(
            Arc::downgrade(inner),
            inner.config.subscription_sync_interval(),
            shutdown_rx,
        ));
        *inner.sync_task.lock().expect("sync task lock poisoned") = Some((shutdown_tx, task));

        inner.announce_all();
        info!(topics = inner.local.topics.len(), "started cluster event service");
        Ok(())
    }

    pub async fn stop(&self) -> ClusterResult<()> {
        let inner = &self.inner;
        if inner
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let sync = inner.sync_task.lock().expect("sync task lock poisoned").take();
        if let Some((shutdown, task)) = sync {
            shutdown.send_replace(true);
            let _ = task.await;
        }
        let listener = inner
            .membership_listener
            .lock()
            .expect("listener id lock poisoned")
            .take();
        if let Some(id) = listener {
            inner.membership.remove_listener(id);
        }
        inner.messaging.unregister_handler(SUBSCRIPTION_SUBJECT);
        *inner.runtime.lock().expect("runtime lock poisoned") = None;
        inner.remote.clear();
        info!("stopped cluster event service");
        Ok(())
    }

    // ── Publishing ─────────────────────────────────────────────────

    /// Deliver `payload` to every subscriber of `topic`. Per-member send
    /// failures are logged, not returned.
    pub async fn broadcast(&self, topic: &str, payload: Bytes) -> ClusterResult<()> {
        let subject = notify_subject(topic);
        for member in self.inner.subscribers(topic) {
            let Some(address) = self.inner.address_of(&member) else {
                continue;
            };
            if let Err(e) = self.inner.messaging.send_async(&address, &subject, payload.clone()).await {
                warn!(topic, member_id = %member, error = %e, "broadcast delivery failed");
            }
        }
        Ok(())
    }

    pub async fn broadcast_json<T: Serialize>(&self, topic: &str, message: &T) -> ClusterResult<()> {
        self.broadcast(topic, Bytes::from(serde_json::to_vec(message)?)).await
    }

    /// Deliver `payload` to one subscriber of `topic`, chosen round-robin.
    pub async fn unicast(&self, topic: &str, payload: Bytes) -> ClusterResult<()> {
        let address = self.inner.next_subscriber(topic)?;
        self.inner
            .messaging
            .send_async(&address, &notify_subject(topic), payload)
            .await?;
        Ok(())
    }

    pub async fn unicast_json<T: Serialize>(&self, topic: &str, message: &T) -> ClusterResult<()> {
        self.unicast(topic, Bytes::from(serde_json::to_vec(message)?)).await
    }

    /// Send to one subscriber of `topic`, chosen round-robin, and await its
    /// reply.
    pub async fn send(&self, topic: &str, payload: Bytes) -> ClusterResult<Bytes> {
        let address = self.inner.next_subscriber(topic)?;
        Ok(self.inner.messaging.send_and_receive(&address, topic, payload).await?)
    }

    pub async fn send_with_timeout(
        &self,
        topic: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> ClusterResult<Bytes> {
        let address = self.inner.next_subscriber(topic)?;
        Ok(self
            .inner
            .messaging
            .send_and_receive_with_timeout(&address, topic, payload, timeout)
            .await?)
    }

    pub async fn send_json<T, R>(&self, topic: &str, message: &T) -> ClusterResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let reply = self.send(topic, Bytes::from(serde_json::to_vec(message)?)).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    // ── Subscribing ────────────────────────────────────────────────

    /// Subscribe with a synchronous handler. Decoding, handling, and
    /// encoding run on a blocking thread of `executor`.
    pub fn subscribe<M, R, D, H, E>(
        &self,
        topic: &str,
        decoder: D,
        handler: H,
        encoder: E,
        executor: Handle,
    ) -> Subscription
    where
        M: Send + 'static,
        R: Send + 'static,
        D: Fn(Bytes) -> Result<M, HandlerError> + Send + Sync + 'static,
        H: Fn(M) -> R + Send + Sync + 'static,
        E: Fn(R) -> Result<Bytes, HandlerError> + Send + Sync + 'static,
    {
        let stages = Arc::new((decoder, handler, encoder));
        let raw: RawHandler = Arc::new(move |payload: Bytes| -> BoxFuture<'static, Result<Bytes, HandlerError>> {
            let stages = stages.clone();
            Box::pin(async move {
                tokio::task::spawn_blocking(move || {
                    let (decoder, handler, encoder) = &*stages;
                    encoder(handler(decoder(payload)?))
                })
                .await?
            })
        });
        self.inner.add_subscription(topic, raw, executor)
    }

    /// Subscribe with an asynchronous handler spawned on `executor`.
    pub fn subscribe_async<M, R, D, H, F, E>(
        &self,
        topic: &str,
        decoder: D,
        handler: H,
        encoder: E,
        executor: Handle,
    ) -> Subscription
    where
        M: Send + 'static,
        R: Send + 'static,
        D: Fn(Bytes) -> Result<M, HandlerError> + Send + Sync + 'static,
        H: Fn(M) -> F + Send + Sync + 'static,
        F: Future<Output = R> + Send + 'static,
        E: Fn(R) -> Result<Bytes, HandlerError> + Send + Sync + 'static,
    {
        let stages = Arc::new((decoder, handler, encoder));
        let raw: RawHandler = Arc::new(move |payload: Bytes| -> BoxFuture<'static, Result<Bytes, HandlerError>> {
            let stages = stages.clone();
            Box::pin(async move {
                let work = {
                    let (decoder, handler, _) = &*stages;
                    handler(decoder(payload)?)
                };
                let reply = work.await;
                (stages.2)(reply)
            })
        });
        self.inner.add_subscription(topic, raw, executor)
    }

    /// Subscribe a consumer; requests to the topic are answered with an
    /// empty payload.
    pub fn subscribe_consumer<M, D, C>(
        &self,
        topic: &str,
        decoder: D,
        consumer: C,
        executor: Handle,
    ) -> Subscription
    where
        M: Send + 'static,
        D: Fn(Bytes) -> Result<M, HandlerError> + Send + Sync + 'static,
        C: Fn(M) + Send + Sync + 'static,
    {
        self.subscribe(topic, decoder, consumer, |()| Ok(Bytes::new()), executor)
    }

    /// Subscribe with JSON-encoded messages and replies.
    pub fn subscribe_json<M, R, H>(&self, topic: &str, handler: H, executor: Handle) -> Subscription
    where
        M: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        H: Fn(M) -> R + Send + Sync + 'static,
    {
        self.subscribe(
            topic,
            |payload: Bytes| serde_json::from_slice::<M>(&payload).map_err(HandlerError::from),
            handler,
            |reply: R| {
                serde_json::to_vec(&reply)
                    .map(Bytes::from)
                    .map_err(HandlerError::from)
            },
            executor,
        )
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Local subscriptions to `topic`.
    pub fn get_subscriptions(&self, topic: &str) -> Vec<Subscription> {
        self.inner
            .local
            .all(topic)
            .into_iter()
            .map(|s| Subscription {
                id: s.id,
                topic: topic.to_string(),
                service: Arc::downgrade(&self.inner),
            })
            .collect()
    }

    /// Members with at least one subscription to `topic`.
    pub fn get_subscribers(&self, topic: &str) -> BTreeSet<MemberId> {
        self.inner.subscribers(topic)
    }

    /// Topics with at least one local subscription.
    pub fn topics(&self) -> BTreeSet<String> {
        self.inner.local.names()
    }

    /// The announcement this member would send right now.
    pub fn announcement(&self) -> SubscriptionAnnouncement {
        self.inner.announcement()
    }
}

impl Inner {
    fn local_id(&self) -> MemberId {
        self.membership.local_member().id().clone()
    }

    fn add_subscription(self: &Arc<Self>, topic: &str, handler: RawHandler, executor: Handle) -> Subscription {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(LocalSubscription {
            id,
            handler,
            executor: executor.clone(),
        });

        match self.local.topics.entry(topic.to_string()) {
            Entry::Occupied(mut e) => e.get_mut().subscriptions.push(subscription),
            Entry::Vacant(e) => {
                self.messaging.register_async_handler(
                    topic,
                    request_handler(self.local.clone(), topic.to_string()),
                    executor.clone(),
                );
                self.messaging.register_consumer(
                    &notify_subject(topic),
                    notify_handler(self.local.clone(), topic.to_string()),
                    executor,
                );
                e.insert(TopicState {
                    subscriptions: vec![subscription],
                    balancer: RoundRobinBalancer::new(),
                });
                debug!(topic, "serving new topic");
            }
        }
        self.local_changed();

        Subscription {
            id,
            topic: topic.to_string(),
            service: Arc::downgrade(self),
        }
    }

    fn remove_subscription(&self, topic: &str, id: u64) -> bool {
        let removed = match self.local.topics.entry(topic.to_string()) {
            Entry::Occupied(mut e) => {
                let subscriptions = &mut e.get_mut().subscriptions;
                let before = subscriptions.len();
                subscriptions.retain(|s| s.id != id);
                let removed = subscriptions.len() < before;
                if subscriptions.is_empty() {
                    e.remove();
                    self.messaging.unregister_handler(topic);
                    self.messaging.unregister_handler(&notify_subject(topic));
                    debug!(topic, "no longer serving topic");
                }
                removed
            }
            Entry::Vacant(_) => false,
        };
        if removed {
            self.local_changed();
        }
        removed
    }

    fn local_changed(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.announce_all();
    }

    fn announcement(&self) -> SubscriptionAnnouncement {
        SubscriptionAnnouncement {
            member: self.local_id(),
            version: self.version.load(Ordering::Acquire),
            topics: self.local.names(),
        }
    }

    fn apply_announcement(&self, announcement: SubscriptionAnnouncement) {
        if announcement.member == self.local_id() {
            return;
        }
        let SubscriptionAnnouncement {
            member,
            version,
            topics,
        } = announcement;
        match self.remote.entry(member) {
            Entry::Occupied(mut e) => {
                if e.get().version < version {
                    e.insert(RemoteSubscriptions { version, topics });
                }
            }
            Entry::Vacant(e) => {
                debug!(member_id = %e.key(), topics = topics.len(), "learned subscriptions");
                e.insert(RemoteSubscriptions { version, topics });
            }
        }
    }

    fn membership_changed(&self, event: &ClusterMembershipEvent) {
        let id = event.member.id();
        match event.kind {
            MembershipEventType::MemberAdded if *id != self.local_id() => {
                self.announce_to(vec![event.member.address().clone()]);
            }
            MembershipEventType::MemberRemoved => {
                if self.remote.remove(id).is_some() {
                    debug!(member_id = %id, "dropped subscriptions of removed member");
                }
            }
            _ => {}
        }
    }

    /// Push the current announcement to every other active member.
    fn announce_all(&self) {
        let local = self.local_id();
        let targets = self
            .membership
            .members()
            .into_iter()
            .filter(|m| *m.id() != local && m.is_active())
            .map(|m| m.address().clone())
            .collect();
        self.announce_to(targets);
    }

    fn announce_to(&self, targets: Vec<Address>) {
        let Some(runtime) = self.runtime.lock().expect("runtime lock poisoned").clone() else {
            return;
        };
        if targets.is_empty() {
            return;
        }
        let payload = match serde_json::to_vec(&self.announcement()) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                warn!(error = %e, "failed to encode subscription announcement");
                return;
            }
        };
        for address in targets {
            let messaging = self.messaging.clone();
            let payload = payload.clone();
            runtime.spawn(async move {
                if let Err(e) = messaging.send_async(&address, SUBSCRIPTION_SUBJECT, payload).await {
                    debug!(%address, error = %e, "failed to announce subscriptions");
                }
            });
        }
    }

    fn subscribers(&self, topic: &str) -> BTreeSet<MemberId> {
        let mut members = BTreeSet::new();
        if self.local.contains(topic) {
            members.insert(self.local_id());
        }
        for entry in self.remote.iter() {
            if !entry.topics.contains(topic) {
                continue;
            }
            let active = self
                .membership
                .member(entry.key())
                .is_some_and(|m| m.is_active());
            if active {
                members.insert(entry.key().clone());
            }
        }
        members
    }

    fn address_of(&self, member: &MemberId) -> Option<Address> {
        if *member == self.local_id() {
            return Some(self.messaging.address());
        }
        self.membership.member(member).map(|m| m.address().clone())
    }

    fn next_subscriber(&self, topic: &str) -> ClusterResult<Address> {
        let candidates: Vec<MemberId> = self.subscribers(topic).into_iter().collect();
        let balancer = self.balancers.entry(topic.to_string()).or_default();
        balancer
            .pick(&candidates)
            .and_then(|id| self.address_of(id))
            .ok_or_else(|| ClusterError::NoSubscribers(topic.to_string()))
    }
}

async fn sync_loop(inner: Weak<Inner>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; start() already announced.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.announce_all();
            }
            _ = shutdown.changed() => break,
        }
    }
}
