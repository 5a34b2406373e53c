//! Log entries as carried by append-entries and snapshot transfer.
//!
//! Only what the transport needs is modelled here: identity, peer lists,
//! the opaque payload, and the checksum that detects corruption in flight.
//! The checksum folds, in this order, the entry type, the log id, the four
//! peer lists, and a CRC of the payload. Changing the order changes every
//! checksum on the wire.

use bytes::Bytes;
use crc32c::crc32c;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    #[default]
    Unknown,
    NoOp,
    Data,
    Configuration,
}

impl EntryType {
    pub fn number(self) -> u64 {
        match self {
            EntryType::Unknown => 0,
            EntryType::NoOp => 1,
            EntryType::Data => 2,
            EntryType::Configuration => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    pub fn checksum(&self) -> u64 {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.term.to_be_bytes());
        buf[8..].copy_from_slice(&self.index.to_be_bytes());
        u64::from(crc32c(&buf))
    }
}

fn fold(acc: u64, value: u64) -> u64 {
    acc ^ value
}

fn fold_peers(acc: u64, peers: &[String]) -> u64 {
    peers
        .iter()
        .fold(acc, |acc, peer| fold(acc, u64::from(crc32c(peer.as_bytes()))))
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_type: EntryType,
    pub id: LogId,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub old_peers: Vec<String>,
    #[serde(default)]
    pub learners: Vec<String>,
    #[serde(default)]
    pub old_learners: Vec<String>,
    #[serde(default, with = "crate::encoding::base64_bytes")]
    pub data: Bytes,
    /// Stored checksum, if the writer computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u64>,
}

impl LogEntry {
    pub fn new(entry_type: EntryType, id: LogId, data: Bytes) -> Self {
        Self {
            entry_type,
            id,
            data,
            ..Self::default()
        }
    }

    /// Recompute the checksum from the entry's current contents.
    pub fn compute_checksum(&self) -> u64 {
        let mut c = fold(self.entry_type.number(), self.id.checksum());
        c = fold_peers(c, &self.peers);
        c = fold_peers(c, &self.old_peers);
        c = fold_peers(c, &self.learners);
        c = fold_peers(c, &self.old_learners);
        if !self.data.is_empty() {
            c = fold(c, u64::from(crc32c(&self.data)));
        }
        c
    }

    /// Store the current checksum on the entry.
    pub fn seal(&mut self) {
        self.checksum = Some(self.compute_checksum());
    }

    pub fn has_checksum(&self) -> bool {
        self.checksum.is_some()
    }

    /// True when a stored checksum no longer matches the contents. Entries
    /// without a checksum are never considered corrupted.
    pub fn is_corrupted(&self) -> bool {
        self.checksum
            .is_some_and(|stored| stored != self.compute_checksum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> LogEntry {
        let mut e = LogEntry::new(EntryType::Data, LogId::new(3, 42), Bytes::from_static(b"payload"));
        e.peers = vec!["10.0.0.1:8081:0".into(), "10.0.0.2:8081:0".into()];
        e
    }

    #[test]
    fn unsealed_entry_is_never_corrupted() {
        let mut e = entry();
        assert!(!e.has_checksum());
        e.data = Bytes::from_static(b"changed");
        assert!(!e.is_corrupted());
    }

    #[test]
    fn sealed_entry_detects_tampering() {
        let mut e = entry();
        e.seal();
        assert!(!e.is_corrupted());

        let mut data = e.clone();
        data.data = Bytes::from_static(b"pAyload");
        assert!(data.is_corrupted());

        let mut id = e.clone();
        id.id.index += 1;
        assert!(id.is_corrupted());

        let mut peers = e.clone();
        peers.old_learners.push("10.0.0.3:8081:0".into());
        assert!(peers.is_corrupted());

        let mut kind = e;
        kind.entry_type = EntryType::Configuration;
        assert!(kind.is_corrupted());
    }

    #[test]
    fn empty_data_does_not_contribute() {
        let a = LogEntry::new(EntryType::NoOp, LogId::new(1, 1), Bytes::new());
        let expected = EntryType::NoOp.number() ^ LogId::new(1, 1).checksum();
        assert_eq!(a.compute_checksum(), expected);
    }

    #[test]
    fn checksum_survives_serialization() {
        let mut e = entry();
        e.seal();
        let json = serde_json::to_vec(&e).unwrap();
        let back: LogEntry = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, e);
        assert!(!back.is_corrupted());
    }
}
