//! Error types for the wire codec and the messaging layer.

use raftlink_core::CoreError;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("unknown message type: {tag}")]
    UnknownMessageType { tag: u8 },

    #[error("unknown reply status: {code}")]
    UnknownStatus { code: u8 },

    /// Not enough bytes buffered yet; the caller should read more.
    #[error("insufficient data: need {need} bytes, have {have}")]
    InsufficientData { need: usize, have: usize },

    #[error("sender address {0} is not an IP literal")]
    UnresolvedAddress(String),

    #[error("{field} too long: {len} bytes (max {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Result type for messaging operations.
pub type MessagingResult<T> = Result<T, MessagingError>;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error(transparent)]
    Address(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("request '{subject}' timed out after {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u64 },

    #[error("no remote handler registered for '{subject}'")]
    NoRemoteHandler { subject: String },

    #[error("remote handler for '{subject}' failed: {message}")]
    RemoteHandlerFailure { subject: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("messaging service is not running")]
    NotRunning,

    #[error("messaging service has been shut down")]
    Shutdown,
}
