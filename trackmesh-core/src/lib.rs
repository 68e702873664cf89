//! trackmesh core
//!
//! Content-addressed storage, peer discovery and the HTTP wire protocol for
//! a peer-to-peer media mesh node.

pub mod api;
pub mod catalog;
pub mod client;
pub mod config;
pub mod content_hash;
pub mod messages;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod runtime;
pub mod storage;
pub mod track;

pub use catalog::{Catalog, CatalogError, InsertOutcome};
pub use client::{ClientConfig, ProtocolClient, ProtocolError};
pub use config::{Cli, Commands, Config, ConfigError};
pub use content_hash::{ContentHash, ContentHashError, ContentHasher};
pub use messages::{DiscoverRequest, DiscoverResponse, NodeStats, PeerAddr, PingResponse};
pub use metrics::{Metrics, MetricsSnapshot};
pub use node::{GossipReport, Node, NodeConfig, NodeError, NodePhase};
pub use peer::{FailureOutcome, Peer, PeerDirectory};
pub use runtime::{run_node, run_until, RuntimeError};
pub use storage::{ContentStore, StorageError, StoreStats};
pub use track::{Track, TrackError, TrackMetadata};
