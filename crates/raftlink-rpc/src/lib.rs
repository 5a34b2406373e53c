//! raftlink-rpc — consensus RPCs carried over raftlink messaging.
//!
//! The [`adapter`] maps each consensus verb onto a messaging subject, the
//! [`file_service`] serves snapshot files in chunks, and [`entry`] holds the
//! log entry model with its corruption checksum.

pub mod adapter;
mod encoding;
pub mod entry;
pub mod error;
pub mod file_service;
pub mod message;

pub use adapter::{RaftRpcService, RaftServerService};
pub use entry::{EntryType, LogEntry, LogId};
pub use error::{ErrorResponse, RaftErrorCode, RpcError, RpcResult};
pub use file_service::{FileReadError, FileReader, FileService, LocalDirReader, ReadOutcome};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, EntryMeta, GetFileRequest, GetFileResponse,
    InstallSnapshotRequest, InstallSnapshotResponse, ReadIndexRequest, ReadIndexResponse,
    RequestVoteRequest, RequestVoteResponse, SnapshotMeta, TimeoutNowRequest, TimeoutNowResponse,
};
