//! Client and server connections.
//!
//! A client connection sends requests and matches replies to them by
//! correlation id. A server connection dispatches inbound requests to the
//! handler registered for their subject and writes replies back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::channel::Channel;
use crate::error::{MessagingError, MessagingResult};
use crate::protocol::{ProtocolMessage, ProtocolReply, ProtocolRequest, ReplyStatus};

/// Handles a request. The handler owns replying through the connection.
pub type Handler = Arc<dyn Fn(ProtocolRequest, Arc<dyn ServerConnection>) + Send + Sync>;

// ── Client side ────────────────────────────────────────────────────

#[async_trait]
pub trait ClientConnection: Send + Sync + 'static {
    /// Send without waiting for a reply.
    async fn send_async(&self, request: ProtocolRequest) -> MessagingResult<()>;

    /// Send and wait up to `timeout` for the matching reply.
    async fn send_and_receive(
        &self,
        request: ProtocolRequest,
        timeout: Duration,
    ) -> MessagingResult<Bytes>;

    fn is_active(&self) -> bool;

    /// Resolves once the connection has closed.
    fn closed(&self) -> BoxFuture<'static, ()>;

    fn close(&self);
}

/// Turn a reply into the caller-visible result.
pub fn reply_result(subject: &str, reply: ProtocolReply) -> MessagingResult<Bytes> {
    match reply.status {
        ReplyStatus::Ok => Ok(reply.payload),
        ReplyStatus::ErrorNoHandler | ReplyStatus::ErrorNoRemoteHandler => {
            Err(MessagingError::NoRemoteHandler {
                subject: subject.to_string(),
            })
        }
        ReplyStatus::ErrorHandlerException => Err(MessagingError::RemoteHandlerFailure {
            subject: subject.to_string(),
            message: String::from_utf8_lossy(&reply.payload).into_owned(),
        }),
        ReplyStatus::ProtocolError => Err(MessagingError::Protocol(format!(
            "remote reported a protocol error for '{subject}'"
        ))),
    }
}

struct PendingReply {
    subject: String,
    tx: oneshot::Sender<MessagingResult<Bytes>>,
}

type PendingReplies = DashMap<u64, PendingReply>;

/// Removes a request's pending entry when its caller stops waiting, whether
/// it returned or its future was dropped. A delivered reply has already
/// removed the entry, so the removal is then a no-op.
struct PendingGuard {
    pending: Arc<PendingReplies>,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Client connection over a network [`Channel`].
pub struct RemoteClientConnection {
    channel: Arc<Channel>,
    pending: Arc<PendingReplies>,
}

impl RemoteClientConnection {
    /// Wrap `channel`, consuming its inbound messages as replies.
    pub fn new(channel: Arc<Channel>, inbound: mpsc::Receiver<ProtocolMessage>) -> Arc<Self> {
        let pending: Arc<PendingReplies> = Arc::new(DashMap::new());
        tokio::spawn(receive_replies(channel.id(), inbound, pending.clone()));
        Arc::new(Self { channel, pending })
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

async fn receive_replies(
    channel_id: u64,
    mut inbound: mpsc::Receiver<ProtocolMessage>,
    pending: Arc<PendingReplies>,
) {
    while let Some(message) = inbound.recv().await {
        match message {
            ProtocolMessage::Reply(reply) => match pending.remove(&reply.id) {
                Some((_, entry)) => {
                    let result = reply_result(&entry.subject, reply);
                    let _ = entry.tx.send(result);
                }
                None => {
                    debug!(channel = channel_id, id = reply.id, "dropping reply for unknown request");
                }
            },
            ProtocolMessage::Request(request) => {
                debug!(
                    channel = channel_id,
                    subject = %request.subject,
                    "ignoring request received on client channel"
                );
            }
        }
    }

    // Channel closed: fail everything still waiting.
    let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, entry)) = pending.remove(&id) {
            let _ = entry.tx.send(Err(MessagingError::ConnectionClosed));
        }
    }
}

#[async_trait]
impl ClientConnection for RemoteClientConnection {
    async fn send_async(&self, request: ProtocolRequest) -> MessagingResult<()> {
        self.channel.send(ProtocolMessage::Request(request)).await
    }

    async fn send_and_receive(
        &self,
        request: ProtocolRequest,
        timeout: Duration,
    ) -> MessagingResult<Bytes> {
        let id = request.id;
        let subject = request.subject.clone();
        let (tx, rx) = oneshot::channel();

        // Registered before the write so an early reply is never lost.
        self.pending.insert(
            id,
            PendingReply {
                subject: subject.clone(),
                tx,
            },
        );
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            id,
        };
        if !self.channel.is_active() {
            return Err(MessagingError::ConnectionClosed);
        }

        self.channel.send(ProtocolMessage::Request(request)).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MessagingError::ConnectionClosed),
            Err(_) => Err(MessagingError::Timeout {
                subject,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn is_active(&self) -> bool {
        self.channel.is_active()
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        self.channel.closed()
    }

    fn close(&self) {
        self.channel.close();
    }
}

/// Client connection to handlers registered in this process.
pub struct LocalClientConnection {
    handlers: Arc<HandlerRegistry>,
    closed: watch::Sender<bool>,
}

impl LocalClientConnection {
    /// A connection dispatching straight into `handlers`.
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        let (closed, _) = watch::channel(false);
        Self { handlers, closed }
    }
}

#[async_trait]
impl ClientConnection for LocalClientConnection {
    async fn send_async(&self, request: ProtocolRequest) -> MessagingResult<()> {
        if !self.is_active() {
            return Err(MessagingError::ConnectionClosed);
        }
        dispatch(&self.handlers, request, Arc::new(DiscardReply)).await;
        Ok(())
    }

    async fn send_and_receive(
        &self,
        request: ProtocolRequest,
        timeout: Duration,
    ) -> MessagingResult<Bytes> {
        if !self.is_active() {
            return Err(MessagingError::ConnectionClosed);
        }
        let subject = request.subject.clone();
        let (tx, rx) = oneshot::channel();
        let sink = Arc::new(LocalReplySink {
            tx: Mutex::new(Some(tx)),
        });
        dispatch(&self.handlers, request, sink).await;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply_result(&subject, reply),
            Ok(Err(_)) => Err(MessagingError::ConnectionClosed),
            Err(_) => Err(MessagingError::Timeout {
                subject,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn is_active(&self) -> bool {
        !*self.closed.borrow()
    }

    fn closed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.closed.subscribe();
        Box::pin(async move {
            let _ = rx.wait_for(|closed| *closed).await;
        })
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

// ── Server side ────────────────────────────────────────────────────

/// Sink for replies to dispatched requests.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    async fn reply(&self, id: u64, status: ReplyStatus, payload: Bytes) -> MessagingResult<()>;
}

/// Server connection writing replies to a network [`Channel`].
pub struct RemoteServerConnection {
    channel: Arc<Channel>,
}

impl RemoteServerConnection {
    /// Reply writer for an accepted `channel`.
    pub fn new(channel: Arc<Channel>) -> Arc<Self> {
        Arc::new(Self { channel })
    }

    /// Dispatch every inbound request until the channel closes.
    pub async fn serve(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<ProtocolMessage>,
        handlers: Arc<HandlerRegistry>,
    ) {
        let connection: Arc<dyn ServerConnection> = self.clone();
        while let Some(message) = inbound.recv().await {
            match message {
                ProtocolMessage::Request(request) => {
                    dispatch(&handlers, request, connection.clone()).await;
                }
                ProtocolMessage::Reply(reply) => {
                    debug!(
                        channel = self.channel.id(),
                        id = reply.id,
                        "ignoring reply received on server channel"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl ServerConnection for RemoteServerConnection {
    async fn reply(&self, id: u64, status: ReplyStatus, payload: Bytes) -> MessagingResult<()> {
        self.channel
            .send(ProtocolMessage::Reply(ProtocolReply::new(id, status, payload)))
            .await
    }
}

struct LocalReplySink {
    tx: Mutex<Option<oneshot::Sender<ProtocolReply>>>,
}

#[async_trait]
impl ServerConnection for LocalReplySink {
    async fn reply(&self, id: u64, status: ReplyStatus, payload: Bytes) -> MessagingResult<()> {
        let tx = self.tx.lock().expect("reply sink lock poisoned").take();
        match tx {
            Some(tx) => tx
                .send(ProtocolReply::new(id, status, payload))
                .map_err(|_| MessagingError::ConnectionClosed),
            None => Err(MessagingError::Protocol(format!("duplicate reply for request {id}"))),
        }
    }
}

struct DiscardReply;

#[async_trait]
impl ServerConnection for DiscardReply {
    async fn reply(&self, _id: u64, _status: ReplyStatus, _payload: Bytes) -> MessagingResult<()> {
        Ok(())
    }
}

/// Route `request` to its handler, or reply `ERROR_NO_HANDLER` with the
/// subject as payload.
pub async fn dispatch(
    handlers: &HandlerRegistry,
    request: ProtocolRequest,
    connection: Arc<dyn ServerConnection>,
) {
    match handlers.get(&request.subject) {
        Some(handler) => handler(request, connection),
        None => {
            debug!(subject = %request.subject, sender = %request.sender, "no handler for request");
            let payload = Bytes::from(request.subject.into_bytes());
            if let Err(e) = connection
                .reply(request.id, ReplyStatus::ErrorNoHandler, payload)
                .await
            {
                warn!(id = request.id, error = %e, "failed to send no-handler reply");
            }
        }
    }
}

/// Handlers keyed by subject.
#[derive(Default)]
/// Handlers keyed by subject.
pub struct HandlerRegistry {
    handlers: DashMap<String, Handler>,
}

impl HandlerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler`, replacing any existing handler for `subject`.
    pub fn register(&self, subject: impl Into<String>, handler: Handler) {
        self.handlers.insert(subject.into(), handler);
    }

    /// Remove the handler for `subject`. Removing twice is harmless.
    pub fn unregister(&self, subject: &str) -> bool {
        self.handlers.remove(subject).is_some()
    }

    /// The handler for `subject`, if any.
    pub fn get(&self, subject: &str) -> Option<Handler> {
        self.handlers.get(subject).map(|h| h.value().clone())
    }

    /// Whether a handler is registered for `subject`.
    pub fn contains(&self, subject: &str) -> bool {
        self.handlers.contains_key(subject)
    }

    /// Registered subjects, in no particular order.
    pub fn subjects(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
