//! raftlink TOML configuration.
//!
//! Every section and field has a default, so an empty file describes a
//! single anonymous node listening on `127.0.0.1:5679`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::address::{Address, DEFAULT_PORT};
use crate::error::{CoreError, CoreResult};
use crate::id::{MemberId, NodeId};
use crate::node::{Member, Node};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    /// Peers from a different cluster id are rejected during handshake.
    pub cluster_id: String,
    pub node: MemberConfig,
    pub discovery: BootstrapDiscoveryConfig,
    pub messaging: MessagingConfig,
    pub event_service: EventServiceConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: "raftlink".to_string(),
            node: MemberConfig::default(),
            discovery: BootstrapDiscoveryConfig::default(),
            messaging: MessagingConfig::default(),
            event_service: EventServiceConfig::default(),
        }
    }
}

/// Identity and placement of the local member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemberConfig {
    /// Generated when absent.
    pub id: Option<String>,
    pub address: Address,
    pub zone: Option<String>,
    pub rack: Option<String>,
    pub host: Option<String>,
    pub version: Option<semver::Version>,
    pub properties: BTreeMap<String, String>,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            id: None,
            address: Address::new("127.0.0.1", DEFAULT_PORT),
            zone: None,
            rack: None,
            host: None,
            version: None,
            properties: BTreeMap::new(),
        }
    }
}

impl MemberConfig {
    pub fn member_id(&self) -> MemberId {
        match &self.id {
            Some(id) => MemberId::new(id.clone()),
            None => MemberId::anonymous(),
        }
    }

    /// Build the local [`Member`]. An anonymous id is drawn on every call.
    pub fn to_member(&self) -> Member {
        let mut builder = Member::builder(self.member_id(), self.address.clone())
            .properties(self.properties.clone());
        if let Some(zone) = &self.zone {
            builder = builder.zone(zone.clone());
        }
        if let Some(rack) = &self.rack {
            builder = builder.rack(rack.clone());
        }
        if let Some(host) = &self.host {
            builder = builder.host(host.clone());
        }
        if let Some(version) = &self.version {
            builder = builder.version(version.clone());
        }
        builder.build()
    }
}

/// Static peer list for the bootstrap discovery provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BootstrapDiscoveryConfig {
    pub nodes: Vec<NodeConfig>,
}

impl BootstrapDiscoveryConfig {
    pub fn to_nodes(&self) -> Vec<Node> {
        self.nodes.iter().map(NodeConfig::to_node).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Defaults to the address string.
    pub id: Option<String>,
    pub address: Address,
}

impl NodeConfig {
    pub fn to_node(&self) -> Node {
        let id = match &self.id {
            Some(id) => NodeId::new(id.clone()),
            None => NodeId::new(self.address.to_string()),
        };
        Node::new(id, self.address.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessagingConfig {
    /// Connections kept per destination.
    pub connection_pool_size: usize,
    pub connect_timeout_ms: u64,
    /// Default timeout for request/reply calls.
    pub request_timeout_ms: u64,
    pub max_frame_bytes: usize,
    /// Frames buffered per connection before senders wait.
    pub outbound_queue_size: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            connection_pool_size: 8,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 10_000,
            max_frame_bytes: 64 * 1024 * 1024,
            outbound_queue_size: 1024,
        }
    }
}

impl MessagingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventServiceConfig {
    /// Interval between periodic subscription announcements.
    pub subscription_sync_interval_ms: u64,
}

impl Default for EventServiceConfig {
    fn default() -> Self {
        Self {
            subscription_sync_interval_ms: 1_000,
        }
    }
}

impl EventServiceConfig {
    pub fn subscription_sync_interval(&self) -> Duration {
        Duration::from_millis(self.subscription_sync_interval_ms)
    }
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| CoreError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: ClusterConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::InvalidConfig(e.to_string()))
    }

    /// Reject values the messaging and cluster layers cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        if self.cluster_id.trim().is_empty() {
            return Err(CoreError::InvalidConfig("cluster_id must not be empty".into()));
        }
        if let Some(id) = &self.node.id {
            if id.trim().is_empty() {
                return Err(CoreError::InvalidConfig("node.id must not be empty".into()));
            }
        }
        let m = &self.messaging;
        if m.connection_pool_size == 0 {
            return Err(CoreError::InvalidConfig(
                "messaging.connection_pool_size must be > 0".into(),
            ));
        }
        if m.connect_timeout_ms == 0 || m.request_timeout_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "messaging timeouts must be > 0".into(),
            ));
        }
        if m.max_frame_bytes == 0 || m.outbound_queue_size == 0 {
            return Err(CoreError::InvalidConfig(
                "messaging.max_frame_bytes and outbound_queue_size must be > 0".into(),
            ));
        }
        if self.event_service.subscription_sync_interval_ms == 0 {
            return Err(CoreError::InvalidConfig(
                "event_service.subscription_sync_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ClusterConfig::from_toml_str("").unwrap();
        assert_eq!(config, ClusterConfig::default());
        assert_eq!(config.messaging.connection_pool_size, 8);
        assert_eq!(config.messaging.request_timeout(), Duration::from_secs(10));
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
cluster_id = "raft-prod"

[node]
id = "node-1"
address = "10.0.0.1:7000"
zone = "eu-west-1b"
version = "2.1.0"

[node.properties]
role = "voter"

[[discovery.nodes]]
id = "node-2"
address = "10.0.0.2:7000"

[[discovery.nodes]]
address = "10.0.0.3:7000"

[messaging]
connection_pool_size = 4
request_timeout_ms = 2500

[event_service]
subscription_sync_interval_ms = 250
"#;
        let config = ClusterConfig::from_toml_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cluster_id, "raft-prod");
        assert_eq!(config.messaging.connection_pool_size, 4);
        assert_eq!(config.messaging.connect_timeout_ms, 5_000);

        let member = config.node.to_member();
        assert_eq!(member.id().as_str(), "node-1");
        assert_eq!(member.zone(), Some("eu-west-1b"));
        assert_eq!(member.property("role"), Some("voter"));
        assert_eq!(member.version(), Some(&semver::Version::new(2, 1, 0)));

        let nodes = config.discovery.to_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id.as_str(), "node-2");
        assert_eq!(nodes[1].id.as_str(), "10.0.0.3:7000");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ClusterConfig::default();
        config.messaging.connection_pool_size = 0;
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.cluster_id = "  ".into();
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::default();
        config.messaging.request_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_and_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cluster_id = \"from-file\"").unwrap();
        let config = ClusterConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cluster_id, "from-file");

        let rendered = config.to_toml_string().unwrap();
        let reparsed = ClusterConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = ClusterConfig::from_file(Path::new("/nonexistent/raftlink.toml")).unwrap_err();
        assert!(matches!(err, CoreError::ConfigRead { .. }));
    }
}
