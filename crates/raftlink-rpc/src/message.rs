//! Typed consensus RPC messages. Encoded as JSON payloads on the wire.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::entry::{EntryType, LogEntry, LogId};
use crate::error::ErrorResponse;

// ── Vote ───────────────────────────────────────────────────────────

/// Used for both pre-vote and vote requests.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub group_id: String,
    pub server_id: String,
    pub peer_id: String,
    pub term: u64,
    pub last_log_term: u64,
    pub last_log_index: u64,
    #[serde(default)]
    pub pre_vote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_response: Option<ErrorResponse>,
}

// ── Replication ────────────────────────────────────────────────────

/// Entry metadata sent ahead of the concatenated entry payloads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntryMeta {
    pub term: u64,
    pub entry_type: EntryType,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub old_peers: Vec<String>,
    #[serde(default)]
    pub learners: Vec<String>,
    #[serde(default)]
    pub old_learners: Vec<String>,
    pub data_len: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u64>,
}

impl From<&LogEntry> for EntryMeta {
    fn from(entry: &LogEntry) -> Self {
        Self {
            term: entry.id.term,
            entry_type: entry.entry_type,
            peers: entry.peers.clone(),
            old_peers: entry.old_peers.clone(),
            learners: entry.learners.clone(),
            old_learners: entry.old_learners.clone(),
            data_len: entry.data.len() as u64,
            checksum: entry.checksum,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub group_id: String,
    pub server_id: String,
    pub peer_id: String,
    pub term: u64,
    pub prev_log_term: u64,
    pub prev_log_index: u64,
    #[serde(default)]
    pub entries: Vec<EntryMeta>,
    pub committed_index: u64,
    /// Payloads of `entries`, concatenated in order.
    #[serde(default, with = "crate::encoding::base64_bytes")]
    pub data: Bytes,
}

impl AppendEntriesRequest {
    /// Pack `entries` into metadata plus one data buffer.
    pub fn with_entries(mut self, entries: &[LogEntry]) -> Self {
        let mut data = Vec::with_capacity(entries.iter().map(|e| e.data.len()).sum());
        self.entries = entries
            .iter()
            .map(|e| {
                data.extend_from_slice(&e.data);
                EntryMeta::from(e)
            })
            .collect();
        self.data = Bytes::from(data);
        self
    }

    /// Rebuild the carried entries. The first entry follows `prev_log_index`.
    /// Returns `None` if the metadata claims more data than was sent.
    pub fn log_entries(&self) -> Option<Vec<LogEntry>> {
        let mut offset = 0usize;
        let mut out = Vec::with_capacity(self.entries.len());
        for (i, meta) in self.entries.iter().enumerate() {
            let len = usize::try_from(meta.data_len).ok()?;
            let end = offset.checked_add(len)?;
            if end > self.data.len() {
                return None;
            }
            out.push(LogEntry {
                entry_type: meta.entry_type,
                id: LogId::new(meta.term, self.prev_log_index + 1 + i as u64),
                peers: meta.peers.clone(),
                old_peers: meta.old_peers.clone(),
                learners: meta.learners.clone(),
                old_learners: meta.old_learners.clone(),
                data: self.data.slice(offset..end),
                checksum: meta.checksum,
            });
            offset = end;
        }
        Some(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub last_log_index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_response: Option<ErrorResponse>,
}

// ── Snapshots ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: u64,
    pub last_included_term: u64,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub old_peers: Vec<String>,
    #[serde(default)]
    pub learners: Vec<String>,
    #[serde(default)]
    pub old_learners: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub group_id: String,
    pub server_id: String,
    pub peer_id: String,
    pub term: u64,
    pub meta: SnapshotMeta,
    /// Where the follower fetches the snapshot from, e.g. `remote://host:port/<reader_id>`.
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_response: Option<ErrorResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetFileRequest {
    pub reader_id: i64,
    pub filename: String,
    pub count: i64,
    pub offset: i64,
    #[serde(default)]
    pub read_partly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GetFileResponse {
    /// True when the reader hit end of file.
    pub eof: bool,
    /// Always present; empty when nothing was read.
    #[serde(with = "crate::encoding::base64_bytes")]
    pub data: Bytes,
    #[serde(default)]
    pub read_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_response: Option<ErrorResponse>,
}

impl GetFileResponse {
    pub fn error(error: ErrorResponse) -> Self {
        Self {
            error_response: Some(error),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error_response.is_none()
    }
}

// ── Leadership and reads ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeoutNowRequest {
    pub group_id: String,
    pub server_id: String,
    pub peer_id: String,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeoutNowResponse {
    pub term: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_response: Option<ErrorResponse>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadIndexRequest {
    pub group_id: String,
    pub server_id: String,
    #[serde(default, with = "crate::encoding::base64_bytes_vec")]
    pub entries: Vec<Bytes>,
    #[serde(default)]
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReadIndexResponse {
    pub index: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_response: Option<ErrorResponse>,
}
