//! Error types for the consensus RPC layer.

use std::fmt;

use raftlink_messaging::MessagingError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for RPC client calls.
pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Numeric error codes carried inside consensus responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaftErrorCode {
    /// Malformed request.
    ERequest,
    /// Transient failure; retry later.
    EAgain,
    /// Unknown reader or resource.
    ENoEnt,
    /// I/O failure.
    EIo,
}

impl RaftErrorCode {
    pub fn code(self) -> i32 {
        match self {
            RaftErrorCode::ERequest => 1000,
            RaftErrorCode::EAgain => 1002,
            RaftErrorCode::ENoEnt => 1012,
            RaftErrorCode::EIo => 1014,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1000 => Some(RaftErrorCode::ERequest),
            1002 => Some(RaftErrorCode::EAgain),
            1012 => Some(RaftErrorCode::ENoEnt),
            1014 => Some(RaftErrorCode::EIo),
            _ => None,
        }
    }
}

impl fmt::Display for RaftErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RaftErrorCode::ERequest => "EREQUEST",
            RaftErrorCode::EAgain => "EAGAIN",
            RaftErrorCode::ENoEnt => "ENOENT",
            RaftErrorCode::EIo => "EIO",
        };
        f.write_str(name)
    }
}

/// Application-level error carried in a response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error_code: i32,
    pub error_msg: String,
}

impl ErrorResponse {
    pub fn new(code: RaftErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code.code(),
            error_msg: message.into(),
        }
    }

    /// The known code, if this is one of [`RaftErrorCode`].
    pub fn code(&self) -> Option<RaftErrorCode> {
        RaftErrorCode::from_code(self.error_code)
    }
}
