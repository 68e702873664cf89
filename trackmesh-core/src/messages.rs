//! Wire records for the peer protocol
//!
//! One explicit request/response type per endpoint, all JSON.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::content_hash::ContentHash;
use crate::metrics::MetricsSnapshot;

/// Network address of a node's protocol server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL of the peer's HTTP server
    pub fn base_url(&self) -> String {
        format!("http://{}", self)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid peer address '{0}': expected host:port")]
pub struct PeerAddrParseError(pub String);

impl FromStr for PeerAddr {
    type Err = PeerAddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PeerAddrParseError(s.to_string());
        let s_trim = s.trim().trim_start_matches("http://");
        let (host, port) = s_trim.rsplit_once(':').ok_or_else(err)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(err());
        }
        let port = port.parse::<u16>().map_err(|_| err())?;
        Ok(Self::new(host, port))
    }
}

/// Response to `GET /ping`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResponse {
    pub node_id: Uuid,
    pub status: String,
}

/// Body of `POST /discover`: who is calling and what it holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverRequest {
    pub node_id: Uuid,
    pub host: String,
    pub port: u16,
    pub known_hashes: Vec<ContentHash>,
}

impl DiscoverRequest {
    pub fn addr(&self) -> PeerAddr {
        PeerAddr::new(self.host.clone(), self.port)
    }
}

/// Reply to `POST /discover`: the responder's peers and holdings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub node_id: Uuid,
    pub peers: Vec<PeerAddr>,
    pub known_hashes: Vec<ContentHash>,
}

/// JSON error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Node summary served by `GET /api/v1/stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStats {
    pub node_id: Uuid,
    pub listen_addr: PeerAddr,
    pub phase: String,
    pub track_count: usize,
    pub peer_count: usize,
    pub pending_peers: usize,
    pub stored_entries: u64,
    pub stored_bytes: u64,
    pub metrics: MetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_addr_parse() {
        assert_eq!(
            "127.0.0.1:7070".parse::<PeerAddr>().unwrap(),
            PeerAddr::new("127.0.0.1", 7070)
        );
        assert_eq!(
            "http://node1:8080".parse::<PeerAddr>().unwrap(),
            PeerAddr::new("node1", 8080)
        );
        assert_eq!(
            "[::1]:9000".parse::<PeerAddr>().unwrap(),
            PeerAddr::new("::1", 9000)
        );

        assert!("node1".parse::<PeerAddr>().is_err());
        assert!(":8080".parse::<PeerAddr>().is_err());
        assert!("node1:notaport".parse::<PeerAddr>().is_err());
    }

    #[test]
    fn test_peer_addr_display() {
        assert_eq!(PeerAddr::new("10.0.0.1", 80).to_string(), "10.0.0.1:80");
        assert_eq!(PeerAddr::new("::1", 80).base_url(), "http://[::1]:80");
    }

    #[test]
    fn test_discover_request_shape() {
        let request = DiscoverRequest {
            node_id: Uuid::nil(),
            host: "127.0.0.1".to_string(),
            port: 7070,
            known_hashes: vec![ContentHash::of(b"a")],
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["host"], "127.0.0.1");
        assert_eq!(value["port"], 7070);
        assert_eq!(value["known_hashes"][0], ContentHash::of(b"a").to_hex());
    }

    #[test]
    fn test_malformed_discover_rejected() {
        // Missing port
        let body = r#"{"node_id":"00000000-0000-0000-0000-000000000000","host":"x","known_hashes":[]}"#;
        assert!(serde_json::from_str::<DiscoverRequest>(body).is_err());

        // Bad hash
        let body = r#"{"node_id":"00000000-0000-0000-0000-000000000000","host":"x","port":1,"known_hashes":["nope"]}"#;
        assert!(serde_json::from_str::<DiscoverRequest>(body).is_err());
    }
}
