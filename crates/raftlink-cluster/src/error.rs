//! Error types for discovery, membership, and cluster lifecycle.

use raftlink_core::CoreError;
use raftlink_messaging::MessagingError;
use thiserror::Error;

/// Result type alias for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("no subscribers for topic '{0}'")]
    NoSubscribers(String),

    #[error("unknown member {0}")]
    UnknownMember(String),

    #[error("{0} is not running")]
    NotRunning(&'static str),

    #[error("cluster has been stopped and cannot be restarted")]
    Stopped,
}
