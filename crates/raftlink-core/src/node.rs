//! Nodes and cluster members.
//!
//! A [`Node`] is the minimal discoverable unit: an id and an address. A
//! [`Member`] extends it with placement metadata and liveness flags. Only the
//! liveness flags change after construction; a member that rejoins is a new
//! `Member` value.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::id::{MemberId, NodeId};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ── Node ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: Address,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, address: Address) -> Self {
        Self {
            id: id.into(),
            address,
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

// ── Member ─────────────────────────────────────────────────────────

/// A cluster participant.
#[derive(Debug)]
pub struct Member {
    id: MemberId,
    address: Address,
    zone: Option<String>,
    rack: Option<String>,
    host: Option<String>,
    properties: BTreeMap<String, String>,
    version: Option<semver::Version>,
    timestamp: u64,
    active: AtomicBool,
    reachable: AtomicBool,
}

impl Member {
    /// A member with no placement metadata, inactive and unreachable.
    pub fn new(id: impl Into<MemberId>, address: Address) -> Self {
        Member::builder(id, address).build()
    }

    pub fn builder(id: impl Into<MemberId>, address: Address) -> MemberBuilder {
        MemberBuilder::new(id, address)
    }

    /// Member for a node reported by discovery.
    pub fn from_node(node: &Node) -> Self {
        Member::new(&node.id, node.address.clone())
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    pub fn rack(&self) -> Option<&str> {
        self.rack.as_deref()
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn version(&self) -> Option<&semver::Version> {
        self.version.as_ref()
    }

    /// Creation time in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub fn set_active(&self, active: bool) -> bool {
        self.active.swap(active, Ordering::AcqRel)
    }

    /// Returns the previous value.
    pub fn set_reachable(&self, reachable: bool) -> bool {
        self.reachable.swap(reachable, Ordering::AcqRel)
    }

    /// The node view of this member.
    pub fn node(&self) -> Node {
        Node::new(self.id.clone(), self.address.clone())
    }
}

impl Clone for Member {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            address: self.address.clone(),
            zone: self.zone.clone(),
            rack: self.rack.clone(),
            host: self.host.clone(),
            properties: self.properties.clone(),
            version: self.version.clone(),
            timestamp: self.timestamp,
            active: AtomicBool::new(self.is_active()),
            reachable: AtomicBool::new(self.is_reachable()),
        }
    }
}

impl PartialEq for Member {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Member {}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Builder for [`Member`].
#[derive(Debug, Clone)]
pub struct MemberBuilder {
    id: MemberId,
    address: Address,
    zone: Option<String>,
    rack: Option<String>,
    host: Option<String>,
    properties: BTreeMap<String, String>,
    version: Option<semver::Version>,
}

impl MemberBuilder {
    pub fn new(id: impl Into<MemberId>, address: Address) -> Self {
        Self {
            id: id.into(),
            address,
            zone: None,
            rack: None,
            host: None,
            properties: BTreeMap::new(),
            version: None,
        }
    }

    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn rack(mut self, rack: impl Into<String>) -> Self {
        self.rack = Some(rack.into());
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn version(mut self, version: semver::Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn build(self) -> Member {
        Member {
            id: self.id,
            address: self.address,
            zone: self.zone,
            rack: self.rack,
            host: self.host,
            properties: self.properties,
            version: self.version,
            timestamp: now_millis(),
            active: AtomicBool::new(false),
            reachable: AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> Address {
        Address::new("127.0.0.1", port)
    }

    #[test]
    fn builder_sets_metadata() {
        let member = Member::builder("m1", addr(5000))
            .zone("us-east-1a")
            .rack("r12")
            .host("box-7")
            .property("role", "voter")
            .version(semver::Version::new(1, 2, 3))
            .build();

        assert_eq!(member.id().as_str(), "m1");
        assert_eq!(member.zone(), Some("us-east-1a"));
        assert_eq!(member.rack(), Some("r12"));
        assert_eq!(member.host(), Some("box-7"));
        assert_eq!(member.property("role"), Some("voter"));
        assert_eq!(member.version(), Some(&semver::Version::new(1, 2, 3)));
        assert!(member.timestamp() > 0);
    }

    #[test]
    fn liveness_flags_are_mutable() {
        let member = Member::new("m1", addr(5000));
        assert!(!member.is_active());
        assert!(!member.is_reachable());

        assert!(!member.set_active(true));
        assert!(!member.set_reachable(true));
        assert!(member.is_active());
        assert!(member.is_reachable());
    }

    #[test]
    fn clone_copies_flags() {
        let member = Member::new("m1", addr(5000));
        member.set_active(true);
        let copy = member.clone();
        assert!(copy.is_active());

        member.set_active(false);
        assert!(copy.is_active());
    }

    #[test]
    fn from_node_keeps_identity() {
        let node = Node::new("n7", addr(7000));
        let member = Member::from_node(&node);
        assert_eq!(member.id().as_str(), "n7");
        assert_eq!(member.node(), node);
        assert_eq!(member.to_string(), "n7@127.0.0.1:7000");
    }
}
