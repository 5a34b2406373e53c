//! A framed, full-duplex message channel over any async byte stream.
//!
//! Each channel runs two tasks. The writer encodes outbound messages and
//! flushes them in submission order. The reader decodes inbound frames and
//! forwards them to the receiver handed back by [`Channel::spawn`]. Either
//! task failing closes the whole channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::codec::MessageCodec;
use crate::error::{CodecError, MessagingError, MessagingResult};
use crate::protocol::ProtocolMessage;

const READ_BUFFER_SIZE: usize = 64 * 1024;
const WRITE_BUFFER_SIZE: usize = 16 * 1024;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct Outbound {
    message: ProtocolMessage,
    done: oneshot::Sender<MessagingResult<()>>,
}

pub struct Channel {
    id: u64,
    peer: String,
    outbound: mpsc::Sender<Outbound>,
    closed: Arc<watch::Sender<bool>>,
}

impl Channel {
    /// Start the reader and writer tasks for `stream`.
    ///
    /// Returns the channel and the stream of decoded inbound messages. The
    /// receiver ends once the channel closes.
    pub fn spawn<S>(
        stream: S,
        codec: Arc<dyn MessageCodec>,
        queue_size: usize,
        peer: impl Into<String>,
    ) -> (Arc<Channel>, mpsc::Receiver<ProtocolMessage>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let peer = peer.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::channel(queue_size);
        let (in_tx, in_rx) = mpsc::channel(queue_size);
        let (closed_tx, _) = watch::channel(false);
        let closed = Arc::new(closed_tx);

        tokio::spawn(write_loop(
            write_half,
            out_rx,
            codec.clone(),
            closed.clone(),
            id,
        ));
        tokio::spawn(read_loop(read_half, in_tx, codec, closed.clone(), id));

        debug!(channel = id, peer = %peer, "channel opened");
        let channel = Arc::new(Channel {
            id,
            peer,
            outbound: out_tx,
            closed,
        });
        (channel, in_rx)
    }

    /// Process-unique id used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Description of the remote end.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// False once either task has stopped or `close` was called.
    pub fn is_active(&self) -> bool {
        !*self.closed.borrow()
    }

    /// Queue `message` and wait until it has been flushed to the stream.
    pub async fn send(&self, message: ProtocolMessage) -> MessagingResult<()> {
        if !self.is_active() {
            return Err(MessagingError::ConnectionClosed);
        }
        let (done, flushed) = oneshot::channel();
        self.outbound
            .send(Outbound { message, done })
            .await
            .map_err(|_| MessagingError::ConnectionClosed)?;
        flushed.await.map_err(|_| MessagingError::ConnectionClosed)?
    }

    /// Resolves once the channel has closed, for any reason.
    pub fn closed(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.closed.subscribe();
        Box::pin(async move { wait_closed(&mut rx).await })
    }

    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(channel = self.id, peer = %self.peer, "channel closed");
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Outbound>,
    codec: Arc<dyn MessageCodec>,
    closed: Arc<watch::Sender<bool>>,
    id: u64,
) where
    W: AsyncWrite + Unpin,
{
    let mut shutdown = closed.subscribe();
    let mut buf = BytesMut::with_capacity(WRITE_BUFFER_SIZE);

    loop {
        let outbound = tokio::select! {
            biased;
            _ = wait_closed(&mut shutdown) => break,
            next = rx.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };

        buf.clear();
        if let Err(e) = codec.encode(&outbound.message, &mut buf) {
            // Only this message is lost; the stream is still in sync.
            let _ = outbound.done.send(Err(e.into()));
            continue;
        }

        let written = match writer.write_all(&buf).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        match written {
            Ok(()) => {
                let _ = outbound.done.send(Ok(()));
            }
            Err(e) => {
                debug!(channel = id, error = %e, "write failed");
                let _ = outbound.done.send(Err(e.into()));
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    closed.send_replace(true);
}

async fn read_loop<R>(
    mut reader: R,
    inbound: mpsc::Sender<ProtocolMessage>,
    codec: Arc<dyn MessageCodec>,
    closed: Arc<watch::Sender<bool>>,
    id: u64,
) where
    R: AsyncRead + Unpin,
{
    let mut shutdown = closed.subscribe();
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    'read: loop {
        let read = tokio::select! {
            _ = wait_closed(&mut shutdown) => break,
            read = reader.read_buf(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                debug!(channel = id, "connection closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(channel = id, error = %e, "read failed");
                break;
            }
        }

        loop {
            match codec.decode(&buffer) {
                Ok((message, consumed)) => {
                    buffer.advance(consumed);
                    if inbound.send(message).await.is_err() {
                        break 'read;
                    }
                }
                Err(CodecError::InsufficientData { .. }) => break,
                Err(e) => {
                    warn!(channel = id, error = %e, "failed to decode frame, closing channel");
                    break 'read;
                }
            }
        }
    }

    closed.send_replace(true);
}
