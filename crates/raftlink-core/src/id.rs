//! Opaque string-backed identifiers.
//!
//! Node and member ids share one representation, [`Identifier`], tagged
//! with a zero-sized marker type so the two cannot be mixed up by accident.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Marker for node identifiers.
#[derive(Debug)]
pub enum NodeTag {}

/// Marker for cluster member identifiers.
#[derive(Debug)]
pub enum MemberTag {}

/// A string identifier tagged with the kind of thing it identifies.
pub struct Identifier<Tag> {
    value: String,
    _tag: PhantomData<fn() -> Tag>,
}

pub type NodeId = Identifier<NodeTag>;
pub type MemberId = Identifier<MemberTag>;

impl<Tag> Identifier<Tag> {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            _tag: PhantomData,
        }
    }

    /// A fresh random identifier.
    pub fn anonymous() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn into_inner(self) -> String {
        self.value
    }
}

impl<Tag> Clone for Identifier<Tag> {
    fn clone(&self) -> Self {
        Self::new(self.value.clone())
    }
}

impl<Tag> PartialEq for Identifier<Tag> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<Tag> Eq for Identifier<Tag> {}

impl<Tag> PartialOrd for Identifier<Tag> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Tag> Ord for Identifier<Tag> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}

impl<Tag> Hash for Identifier<Tag> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<Tag> fmt::Debug for Identifier<Tag> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

impl<Tag> fmt::Display for Identifier<Tag> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

impl<Tag> From<&str> for Identifier<Tag> {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl<Tag> From<String> for Identifier<Tag> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<NodeId> for MemberId {
    fn from(id: NodeId) -> Self {
        MemberId::new(id.into_inner())
    }
}

impl From<&NodeId> for MemberId {
    fn from(id: &NodeId) -> Self {
        MemberId::new(id.as_str())
    }
}

impl From<MemberId> for NodeId {
    fn from(id: MemberId) -> Self {
        NodeId::new(id.into_inner())
    }
}

impl<Tag> Serialize for Identifier<Tag> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, Tag> Deserialize<'de> for Identifier<Tag> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn equality_and_hash_by_value() {
        let a = NodeId::new("node-1");
        let b = NodeId::from("node-1");
        assert_eq!(a, b);

        let set: HashSet<NodeId> = [a, b, NodeId::new("node-2")].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn ordering_is_lexicographic() {
        let mut ids = vec![MemberId::new("c"), MemberId::new("a"), MemberId::new("b")];
        ids.sort();
        let names: Vec<_> = ids.iter().map(|id| id.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
    }

    #[test]
    fn anonymous_ids_are_unique() {
        let a = MemberId::anonymous();
        let b = MemberId::anonymous();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn node_id_converts_to_member_id() {
        let node = NodeId::new("raft-3");
        let member: MemberId = (&node).into();
        assert_eq!(member.as_str(), "raft-3");
        let back: NodeId = member.into();
        assert_eq!(back, node);
    }

    #[test]
    fn serde_as_plain_string() {
        let id = MemberId::new("m1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"m1\"");
        let parsed: MemberId = serde_json::from_str("\"m1\"").unwrap();
        assert_eq!(parsed, id);
    }
}
