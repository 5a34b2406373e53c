//! raftlink-core — identity, addressing, listeners, and configuration
//! shared by every raftlink crate.

pub mod address;
pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod node;

pub use address::Address;
pub use config::{
    BootstrapDiscoveryConfig, ClusterConfig, EventServiceConfig, MemberConfig, MessagingConfig,
    NodeConfig,
};
pub use error::{CoreError, CoreResult};
pub use event::{EventListener, ListenerId, ListenerRegistry};
pub use id::{Identifier, MemberId, NodeId};
pub use node::{Member, MemberBuilder, Node, now_millis};
