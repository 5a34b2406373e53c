//! raftlink-messaging — request/reply messaging between cluster nodes.
//!
//! Layers, bottom up: the versioned wire [`codec`] and connection
//! [`handshake`], framed [`channel`]s, client/server [`connection`]s with
//! a subject-keyed handler registry, the per-destination channel [`pool`],
//! and the TCP [`service`] tying them together.

use std::future::Future;
use std::pin::Pin;

pub mod channel;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handshake;
pub mod pool;
pub mod protocol;
pub mod service;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub use codec::{CodecV1, MessageCodec, ProtocolVersion};
pub use connection::{ClientConnection, HandlerRegistry, ServerConnection};
pub use error::{CodecError, CodecResult, MessagingError, MessagingResult};
pub use pool::{ChannelPool, ConnectionFactory};
pub use protocol::{ProtocolMessage, ProtocolReply, ProtocolRequest, ReplyStatus};
pub use service::{
    AsyncHandler, Consumer, HandlerError, MessagingService, SyncHandler, TcpMessagingService,
};
