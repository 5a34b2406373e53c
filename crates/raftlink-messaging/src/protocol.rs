//! Protocol messages exchanged between nodes.

use bytes::Bytes;
use raftlink_core::Address;

use crate::error::{CodecError, CodecResult};

/// A request addressed to a handler on the remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolRequest {
    /// Correlation id, unique per sending node.
    pub id: u64,
    /// Address the reply should be attributed to.
    pub sender: Address,
    pub subject: String,
    pub payload: Bytes,
}

impl ProtocolRequest {
    pub fn new(id: u64, sender: Address, subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            id,
            sender,
            subject: subject.into(),
            payload,
        }
    }
}

/// A reply to a [`ProtocolRequest`] with the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolReply {
    pub id: u64,
    pub payload: Bytes,
    pub status: ReplyStatus,
}

impl ProtocolReply {
    pub fn new(id: u64, status: ReplyStatus, payload: Bytes) -> Self {
        Self { id, payload, status }
    }

    pub fn ok(id: u64, payload: Bytes) -> Self {
        Self::new(id, ReplyStatus::Ok, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyStatus {
    Ok = 0,
    ErrorNoHandler = 1,
    ErrorHandlerException = 2,
    ProtocolError = 3,
    ErrorNoRemoteHandler = 4,
}

impl ReplyStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(code: u8) -> CodecResult<Self> {
        match code {
            0 => Ok(ReplyStatus::Ok),
            1 => Ok(ReplyStatus::ErrorNoHandler),
            2 => Ok(ReplyStatus::ErrorHandlerException),
            3 => Ok(ReplyStatus::ProtocolError),
            4 => Ok(ReplyStatus::ErrorNoRemoteHandler),
            _ => Err(CodecError::UnknownStatus { code }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    Request(ProtocolRequest),
    Reply(ProtocolReply),
}

impl ProtocolMessage {
    pub fn id(&self) -> u64 {
        match self {
            ProtocolMessage::Request(r) => r.id,
            ProtocolMessage::Reply(r) => r.id,
        }
    }

    pub fn payload(&self) -> &Bytes {
        match self {
            ProtocolMessage::Request(r) => &r.payload,
            ProtocolMessage::Reply(r) => &r.payload,
        }
    }
}

impl From<ProtocolRequest> for ProtocolMessage {
    fn from(request: ProtocolRequest) -> Self {
        ProtocolMessage::Request(request)
    }
}

impl From<ProtocolReply> for ProtocolMessage {
    fn from(reply: ProtocolReply) -> Self {
        ProtocolMessage::Reply(reply)
    }
}
