//! The messaging service: addressed request/reply over pooled TCP
//! connections.
//!
//! Handlers are registered per subject together with the runtime handle
//! they should run on. Sync handlers run on that runtime's blocking pool,
//! async handlers are spawned on it, so slow application code never runs
//! on a connection's reader task.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use raftlink_core::{Address, MessagingConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::channel::Channel;
use crate::connection::{
    ClientConnection, Handler, HandlerRegistry, LocalClientConnection, RemoteClientConnection,
    RemoteServerConnection, ServerConnection,
};
use crate::error::{CodecError, MessagingError, MessagingResult};
use crate::handshake::{client_handshake, cluster_preamble, server_handshake};
use crate::pool::{ChannelPool, ConnectionFactory};
use crate::protocol::{ProtocolRequest, ReplyStatus};

/// Error returned by application handlers; its message is sent back to the
/// caller.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Replies with the returned payload. Runs on a blocking thread.
pub type SyncHandler = Arc<dyn Fn(Address, Bytes) -> Result<Bytes, HandlerError> + Send + Sync>;

/// Replies with the payload the future resolves to.
pub type AsyncHandler =
    Arc<dyn Fn(Address, Bytes) -> BoxFuture<'static, Result<Bytes, HandlerError>> + Send + Sync>;

/// Receives a message and sends no reply.
pub type Consumer = Arc<dyn Fn(Address, Bytes) + Send + Sync>;

#[async_trait]
pub trait MessagingService: Send + Sync + 'static {
    /// Address this node is reachable at.
    fn address(&self) -> Address;

    /// Send a message without waiting for a reply.
    async fn send_async(&self, address: &Address, subject: &str, payload: Bytes)
    -> MessagingResult<()>;

    /// Send a request and wait for the reply, using the configured timeout.
    async fn send_and_receive(
        &self,
        address: &Address,
        subject: &str,
        payload: Bytes,
    ) -> MessagingResult<Bytes>;

    async fn send_and_receive_with_timeout(
        &self,
        address: &Address,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> MessagingResult<Bytes>;

    fn register_handler(&self, subject: &str, handler: SyncHandler, executor: Handle);

    fn register_async_handler(&self, subject: &str, handler: AsyncHandler, executor: Handle);

    fn register_consumer(&self, subject: &str, consumer: Consumer, executor: Handle);

    /// Remove the handler for `subject`. Returns whether one was registered;
    /// removing an absent handler is a no-op.
    fn unregister_handler(&self, subject: &str) -> bool;

    fn is_running(&self) -> bool;
}

// ── Handler adapters ───────────────────────────────────────────────

async fn respond(
    subject: &str,
    id: u64,
    outcome: Result<Result<Bytes, HandlerError>, JoinError>,
    connection: Arc<dyn ServerConnection>,
) {
    let (status, payload) = match outcome {
        Ok(Ok(payload)) => (ReplyStatus::Ok, payload),
        Ok(Err(e)) => {
            debug!(subject, error = %e, "handler returned an error");
            (ReplyStatus::ErrorHandlerException, Bytes::from(e.to_string()))
        }
        Err(e) => {
            warn!(subject, error = %e, "handler panicked");
            (
                ReplyStatus::ErrorHandlerException,
                Bytes::from_static(b"handler panicked"),
            )
        }
    };
    match connection.reply(id, status, payload).await {
        Ok(()) => {}
        // The stream is still in sync, so the caller can be told why.
        Err(MessagingError::Codec(CodecError::FrameTooLarge { size, max })) => {
            warn!(subject, id, size, max, "reply exceeds the frame limit");
            let reason = format!("reply of {size} bytes exceeds the {max} byte frame limit");
            if let Err(e) = connection
                .reply(id, ReplyStatus::ErrorHandlerException, Bytes::from(reason))
                .await
            {
                debug!(subject, id, error = %e, "failed to send reply");
            }
        }
        Err(e) => debug!(subject, id, error = %e, "failed to send reply"),
    }
}

/// Adapt a [`SyncHandler`] to the connection layer.
pub fn sync_handler(subject: &str, handler: SyncHandler, executor: Handle) -> Handler {
    let subject: Arc<str> = subject.into();
    Arc::new(move |request: ProtocolRequest, connection: Arc<dyn ServerConnection>| {
        let handler = handler.clone();
        let subject = subject.clone();
        let blocking = executor.clone();
        executor.spawn(async move {
            let id = request.id;
            let outcome = blocking
                .spawn_blocking(move || handler(request.sender, request.payload))
                .await;
            respond(&subject, id, outcome, connection).await;
        });
    })
}

/// Adapt an [`AsyncHandler`] to the connection layer.
pub fn async_handler(subject: &str, handler: AsyncHandler, executor: Handle) -> Handler {
    let subject: Arc<str> = subject.into();
    Arc::new(move |request: ProtocolRequest, connection: Arc<dyn ServerConnection>| {
        let id = request.id;
        let work = handler(request.sender, request.payload);
        let subject = subject.clone();
        let inner = executor.clone();
        executor.spawn(async move {
            let outcome = inner.spawn(work).await;
            respond(&subject, id, outcome, connection).await;
        });
    })
}

/// Adapt a [`Consumer`] to the connection layer.
pub fn consumer_handler(consumer: Consumer, executor: Handle) -> Handler {
    Arc::new(move |request: ProtocolRequest, _connection: Arc<dyn ServerConnection>| {
        let consumer = consumer.clone();
        executor.spawn_blocking(move || consumer(request.sender, request.payload));
    })
}

// ── TCP transport ──────────────────────────────────────────────────

/// Opens handshaken TCP connections for the channel pool.
pub struct TcpConnectionFactory {
    preamble: i32,
    config: MessagingConfig,
}

impl TcpConnectionFactory {
    /// A factory that handshakes as a member of `cluster_id`.
    pub fn new(cluster_id: &str, config: MessagingConfig) -> Self {
        Self {
            preamble: cluster_preamble(cluster_id),
            config,
        }
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    type Connection = RemoteClientConnection;

    async fn connect(
        &self,
        address: &Address,
        ip: IpAddr,
    ) -> MessagingResult<Arc<RemoteClientConnection>> {
        let connect_timeout = self.config.connect_timeout();
        let target = SocketAddr::new(ip, address.port());
        let connect_err = |reason: String| MessagingError::Connect {
            address: address.to_string(),
            reason,
        };

        let mut stream = tokio::time::timeout(connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| connect_err(format!("timed out after {}ms", connect_timeout.as_millis())))?
            .map_err(|e| connect_err(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let version = tokio::time::timeout(connect_timeout, client_handshake(&mut stream, self.preamble))
            .await
            .map_err(|_| MessagingError::Handshake(format!("timed out with {address}")))??;

        debug!(address = %address, ip = %ip, "connected to peer");
        let codec = version.codec(self.config.max_frame_bytes);
        let (channel, inbound) = Channel::spawn(
            stream,
            codec,
            self.config.outbound_queue_size,
            address.to_string(),
        );
        Ok(RemoteClientConnection::new(channel, inbound))
    }
}

/// [`MessagingService`] over TCP.
#[derive(Clone)]
pub struct TcpMessagingService {
    inner: Arc<Inner>,
}

struct Inner {
    config: MessagingConfig,
    preamble: i32,
    /// Advertised address; the port is filled in after binding port 0.
    address: RwLock<Address>,
    /// IP form of the address written into outgoing requests.
    sender: RwLock<Address>,
    handlers: Arc<HandlerRegistry>,
    pool: ChannelPool<TcpConnectionFactory>,
    local: LocalClientConnection,
    next_id: AtomicU64,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    server_channels: DashMap<u64, Arc<Channel>>,
}

impl TcpMessagingService {
    /// A stopped service that will listen on `address` once started.
    pub fn new(cluster_id: &str, address: Address, config: MessagingConfig) -> Self {
        let handlers = Arc::new(HandlerRegistry::new());
        let factory = Arc::new(TcpConnectionFactory::new(cluster_id, config.clone()));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                pool: ChannelPool::new(factory, config.connection_pool_size),
                preamble: cluster_preamble(cluster_id),
                sender: RwLock::new(address.clone()),
                address: RwLock::new(address),
                local: LocalClientConnection::new(handlers.clone()),
                handlers,
                next_id: AtomicU64::new(1),
                started: AtomicBool::new(false),
                shutdown,
                accept_task: Mutex::new(None),
                server_channels: DashMap::new(),
                config,
            }),
        }
    }

    /// Bind the listener and start accepting connections. Starting twice is
    /// a no-op; starting after [`stop`](Self::stop) fails.
    pub async fn start(&self) -> MessagingResult<()> {
        let inner = &self.inner;
        if *inner.shutdown.borrow() {
            return Err(MessagingError::Shutdown);
        }
        if inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                inner.started.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let shutdown = inner.shutdown.subscribe();
        let task = tokio::spawn(accept_loop(inner.clone(), listener, shutdown));
        *inner.accept_task.lock().expect("accept task lock poisoned") = Some(task);

        info!(address = %self.address(), "messaging service started");
        Ok(())
    }

    async fn bind(&self) -> MessagingResult<TcpListener> {
        let configured = self.address();
        let ip = match configured.ip() {
            Some(ip) => ip,
            None => tokio::net::lookup_host((configured.host(), configured.port()))
                .await?
                .next()
                .map(|sa| sa.ip())
                .ok_or_else(|| MessagingError::Connect {
                    address: configured.to_string(),
                    reason: "bind address did not resolve".to_string(),
                })?,
        };

        let listener = TcpListener::bind(SocketAddr::new(ip, configured.port())).await?;
        let port = listener.local_addr()?.port();
        *self.inner.address.write().expect("address lock poisoned") =
            Address::new(configured.host(), port);
        *self.inner.sender.write().expect("address lock poisoned") = Address::from_ip(ip, port);
        Ok(listener)
    }

    /// Stop accepting, close every connection, and fail in-flight requests.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner
            .started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        inner.shutdown.send_replace(true);

        let task = inner.accept_task.lock().expect("accept task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }

        inner.pool.close_all().await;
        let channels: Vec<_> = inner
            .server_channels
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for channel in channels {
            channel.close();
        }
        inner.server_channels.clear();
        inner.local.close();
        info!(address = %self.address(), "messaging service stopped");
    }

    /// Subjects with a registered handler.
    pub fn subjects(&self) -> Vec<String> {
        self.inner.handlers.subjects()
    }

    fn sender(&self) -> Address {
        self.inner.sender.read().expect("address lock poisoned").clone()
    }

    fn is_local(&self, address: &Address) -> bool {
        *address == self.address() || *address == self.sender()
    }

    fn new_request(&self, subject: &str, payload: Bytes) -> ProtocolRequest {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        ProtocolRequest::new(id, self.sender(), subject, payload)
    }

    fn ensure_running(&self) -> MessagingResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(MessagingError::NotRunning)
        }
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(serve_inbound(inner.clone(), stream, peer));
                }
                Err(e) => warn!(error = %e, "failed to accept connection"),
            },
        }
    }
    debug!("accept loop stopped");
}

async fn serve_inbound(inner: Arc<Inner>, mut stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);
    let handshake = tokio::time::timeout(
        inner.config.connect_timeout(),
        server_handshake(&mut stream, inner.preamble),
    )
    .await;
    let version = match handshake {
        Ok(Ok(version)) => version,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "rejecting inbound connection");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "inbound handshake timed out");
            return;
        }
    };

    let codec = version.codec(inner.config.max_frame_bytes);
    let (channel, inbound) =
        Channel::spawn(stream, codec, inner.config.outbound_queue_size, peer.to_string());
    inner.server_channels.insert(channel.id(), channel.clone());
    if *inner.shutdown.borrow() {
        channel.close();
    }

    RemoteServerConnection::new(channel.clone())
        .serve(inbound, inner.handlers.clone())
        .await;
    inner.server_channels.remove(&channel.id());
    debug!(peer = %peer, "inbound connection finished");
}

#[async_trait]
impl MessagingService for TcpMessagingService {
    fn address(&self) -> Address {
        self.inner.address.read().expect("address lock poisoned").clone()
    }

    async fn send_async(
        &self,
        address: &Address,
        subject: &str,
        payload: Bytes,
    ) -> MessagingResult<()> {
        self.ensure_running()?;
        let request = self.new_request(subject, payload);
        if self.is_local(address) {
            return self.inner.local.send_async(request).await;
        }
        let connection = self.inner.pool.get_channel(address, subject).await?;
        connection.send_async(request).await
    }

    async fn send_and_receive(
        &self,
        address: &Address,
        subject: &str,
        payload: Bytes,
    ) -> MessagingResult<Bytes> {
        let timeout = self.inner.config.request_timeout();
        self.send_and_receive_with_timeout(address, subject, payload, timeout)
            .await
    }

    async fn send_and_receive_with_timeout(
        &self,
        address: &Address,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> MessagingResult<Bytes> {
        self.ensure_running()?;
        let request = self.new_request(subject, payload);
        if self.is_local(address) {
            return self.inner.local.send_and_receive(request, timeout).await;
        }
        let connection = self.inner.pool.get_channel(address, subject).await?;
        connection.send_and_receive(request, timeout).await
    }

    fn register_handler(&self, subject: &str, handler: SyncHandler, executor: Handle) {
        self.inner
            .handlers
            .register(subject, sync_handler(subject, handler, executor));
    }

    fn register_async_handler(&self, subject: &str, handler: AsyncHandler, executor: Handle) {
        self.inner
            .handlers
            .register(subject, async_handler(subject, handler, executor));
    }

    fn register_consumer(&self, subject: &str, consumer: Consumer, executor: Handle) {
        self.inner
            .handlers
            .register(subject, consumer_handler(consumer, executor));
    }

    fn unregister_handler(&self, subject: &str) -> bool {
        self.inner.handlers.unregister(subject)
    }

    fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }
}
