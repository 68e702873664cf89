//! HTTP client for the peer protocol and the local admin API
//!
//! Every call is bounded by the configured timeout and retried at most
//! `retries` times on transport errors and 5xx responses. Failures come back
//! as a typed [`ProtocolError`] so the caller can move on to another peer.

use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::content_hash::{ContentHash, ContentHasher};
use crate::messages::{
    DiscoverRequest, DiscoverResponse, ErrorResponse, NodeStats, PeerAddr, PingResponse,
};
use crate::peer::Peer;
use crate::track::{Track, TrackMetadata};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 1;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Peer {addr} unreachable: {reason}")]
    Unreachable { addr: PeerAddr, reason: String },

    #[error("Not found on {addr}: {what}")]
    NotFound { addr: PeerAddr, what: String },

    #[error("Peer {addr} returned HTTP {status}: {message}")]
    Status {
        addr: PeerAddr,
        status: u16,
        message: String,
    },

    #[error("Malformed response from {addr}: {reason}")]
    Decode { addr: PeerAddr, reason: String },

    #[error("Peer {addr} served corrupted content: {reason}")]
    Integrity { addr: PeerAddr, reason: String },

    #[error("HTTP client error: {0}")]
    Client(String),
}

impl ProtocolError {
    /// Transport failures and server errors are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ProtocolError::Unreachable { .. } => true,
            ProtocolError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Timeout and retry policy for outbound calls
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }
}

/// Client for talking to other nodes
#[derive(Debug, Clone)]
pub struct ProtocolClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl ProtocolClient {
    pub fn new(config: ClientConfig) -> Result<Self, ProtocolError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| ProtocolError::Client(e.to_string()))?;

        Ok(Self { http, config })
    }

    pub fn config(&self) -> ClientConfig {
        self.config
    }

    // Peer protocol

    /// Liveness check (`GET /ping`)
    pub async fn ping(&self, addr: &PeerAddr) -> Result<PingResponse, ProtocolError> {
        self.get_json(addr, "/ping").await
    }

    /// The peer's known peer addresses (`GET /peers`)
    pub async fn peers(&self, addr: &PeerAddr) -> Result<Vec<PeerAddr>, ProtocolError> {
        self.get_json(addr, "/peers").await
    }

    /// Hashes the peer can serve (`GET /tracks`)
    pub async fn tracks(&self, addr: &PeerAddr) -> Result<Vec<ContentHash>, ProtocolError> {
        self.get_json(addr, "/tracks").await
    }

    /// The peer's metadata record for one hash (`GET /tracks/{hash}`)
    pub async fn track_metadata(
        &self,
        addr: &PeerAddr,
        hash: &ContentHash,
    ) -> Result<Track, ProtocolError> {
        self.get_json(addr, &format!("/tracks/{}", hash)).await
    }

    /// Symmetric handshake (`POST /discover`)
    pub async fn discover(
        &self,
        addr: &PeerAddr,
        request: &DiscoverRequest,
    ) -> Result<DiscoverResponse, ProtocolError> {
        let url = format!("{}/discover", addr.base_url());
        let url = url.as_str();
        self.with_retry(addr, "discover", || async move {
            let response = self
                .http
                .post(url)
                .json(request)
                .send()
                .await
                .map_err(|e| transport_error(addr, e))?;
            decode_json(addr, check_status(addr, response).await?).await
        })
        .await
    }

    /// Raw content bytes (`GET /content/{hash}`); not verified here
    pub async fn fetch_content(
        &self,
        addr: &PeerAddr,
        hash: &ContentHash,
    ) -> Result<Bytes, ProtocolError> {
        let path = format!("/content/{}", hash);
        let url = format!("{}{}", addr.base_url(), path);
        let url = url.as_str();
        self.with_retry(addr, &path, || async move {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| transport_error(addr, e))?;
            let mut response = check_status(addr, response).await?;

            // Verified as it arrives
            let mut hasher = ContentHasher::expecting(*hash);
            let mut body = BytesMut::new();
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| transport_error(addr, e))?
            {
                hasher.update(&chunk);
                body.extend_from_slice(&chunk);
            }
            hasher.finish().map_err(|e| ProtocolError::Integrity {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
            Ok(body.freeze())
        })
        .await
    }

    // Local admin API

    /// Upload a file to a running node (`POST /api/v1/tracks`)
    pub async fn upload_track(
        &self,
        api: &PeerAddr,
        data: Vec<u8>,
        metadata: &TrackMetadata,
    ) -> Result<Track, ProtocolError> {
        let url = format!("{}/api/v1/tracks", api.base_url());
        let url = url.as_str();
        let mut query: Vec<(&str, String)> = vec![("title", metadata.title.clone())];
        if let Some(artist) = &metadata.artist {
            query.push(("artist", artist.clone()));
        }
        if let Some(album) = &metadata.album {
            query.push(("album", album.clone()));
        }
        if let Some(duration) = metadata.duration_seconds {
            query.push(("duration_seconds", duration.to_string()));
        }

        let body = &Bytes::from(data);
        let query = &query;
        self.with_retry(api, "upload", || async move {
            let response = self
                .http
                .post(url)
                .query(query)
                .header("content-type", "application/octet-stream")
                .body(body.clone())
                .send()
                .await
                .map_err(|e| transport_error(api, e))?;
            decode_json(api, check_status(api, response).await?).await
        })
        .await
    }

    /// Tracks in a node's local catalog (`GET /api/v1/tracks`)
    pub async fn local_tracks(&self, api: &PeerAddr) -> Result<Vec<Track>, ProtocolError> {
        self.get_json(api, "/api/v1/tracks").await
    }

    /// Fetch a track through a node, which may pull it from the mesh
    pub async fn download(&self, api: &PeerAddr, hash: &ContentHash) -> Result<Bytes, ProtocolError> {
        self.get_bytes(api, &format!("/api/v1/tracks/{}/content", hash))
            .await
    }

    pub async fn stats(&self, api: &PeerAddr) -> Result<NodeStats, ProtocolError> {
        self.get_json(api, "/api/v1/stats").await
    }

    pub async fn list_peers(&self, api: &PeerAddr) -> Result<Vec<Peer>, ProtocolError> {
        self.get_json(api, "/api/v1/peers").await
    }

    /// Ask a node to handshake with `peer` (`POST /api/v1/peers`)
    pub async fn add_peer(&self, api: &PeerAddr, peer: &PeerAddr) -> Result<Peer, ProtocolError> {
        let url = format!("{}/api/v1/peers", api.base_url());
        let url = url.as_str();
        self.with_retry(api, "add_peer", || async move {
            let response = self
                .http
                .post(url)
                .json(peer)
                .send()
                .await
                .map_err(|e| transport_error(api, e))?;
            decode_json(api, check_status(api, response).await?).await
        })
        .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        addr: &PeerAddr,
        path: &str,
    ) -> Result<T, ProtocolError> {
        let url = format!("{}{}", addr.base_url(), path);
        let url = url.as_str();
        self.with_retry(addr, path, || async move {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| transport_error(addr, e))?;
            decode_json(addr, check_status(addr, response).await?).await
        })
        .await
    }

    async fn get_bytes(&self, addr: &PeerAddr, path: &str) -> Result<Bytes, ProtocolError> {
        let url = format!("{}{}", addr.base_url(), path);
        let url = url.as_str();
        self.with_retry(addr, path, || async move {
            let response = self
                .http
                .get(url)
                .send()
                .await
                .map_err(|e| transport_error(addr, e))?;
            check_status(addr, response)
                .await?
                .bytes()
                .await
                .map_err(|e| transport_error(addr, e))
        })
        .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        addr: &PeerAddr,
        op: &str,
        call: F,
    ) -> Result<T, ProtocolError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProtocolError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    debug!(peer = %addr, op, attempt, error = %e, "Retrying request");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn transport_error(addr: &PeerAddr, e: reqwest::Error) -> ProtocolError {
    if e.is_decode() {
        return ProtocolError::Decode {
            addr: addr.clone(),
            reason: e.to_string(),
        };
    }
    let reason = if e.is_timeout() {
        "request timed out".to_string()
    } else {
        e.to_string()
    };
    ProtocolError::Unreachable {
        addr: addr.clone(),
        reason,
    }
}

async fn check_status(
    addr: &PeerAddr,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProtocolError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = response
        .json::<ErrorResponse>()
        .await
        .map(|body| body.error)
        .unwrap_or_else(|_| status.to_string());

    if status == StatusCode::NOT_FOUND {
        return Err(ProtocolError::NotFound {
            addr: addr.clone(),
            what: message,
        });
    }
    Err(ProtocolError::Status {
        addr: addr.clone(),
        status: status.as_u16(),
        message,
    })
}

async fn decode_json<T: DeserializeOwned>(
    addr: &PeerAddr,
    response: reqwest::Response,
) -> Result<T, ProtocolError> {
    let body = response
        .bytes()
        .await
        .map_err(|e| transport_error(addr, e))?;
    serde_json::from_slice(&body).map_err(|e| ProtocolError::Decode {
        addr: addr.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Path, http::StatusCode, routing::get, Json, Router};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    async fn spawn_router(router: Router) -> PeerAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        PeerAddr::new("127.0.0.1", port)
    }

    fn fast_client(retries: u32) -> ProtocolClient {
        ProtocolClient::new(ClientConfig {
            request_timeout: Duration::from_millis(300),
            retries,
        })
        .unwrap()
    }

    async fn closed_port() -> PeerAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        PeerAddr::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let addr = closed_port().await;
        let client = fast_client(1);

        let err = client.tracks(&addr).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Unreachable { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_timeout_is_unreachable() {
        let router = Router::new().route(
            "/ping",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                "late"
            }),
        );
        let addr = spawn_router(router).await;
        let client = fast_client(0);

        let started = std::time::Instant::now();
        let err = client.ping(&addr).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Unreachable { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_retry_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/tracks",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    (StatusCode::SERVICE_UNAVAILABLE, "busy")
                }
            }),
        );
        let addr = spawn_router(router).await;

        let err = fast_client(1).tracks(&addr).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Status { status: 503, .. }));
        // One attempt plus one retry
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_found_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/content/:hash",
            get(move |Path(_hash): Path<String>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::NOT_FOUND
                }
            }),
        );
        let addr = spawn_router(router).await;

        let err = fast_client(3)
            .fetch_content(&addr, &ContentHash::of(b"x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_decode_error() {
        let router = Router::new().route(
            "/tracks",
            get(|| async { Json(serde_json::json!({"unexpected": true})) }),
        );
        let addr = spawn_router(router).await;

        let err = fast_client(1).tracks(&addr).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_fetch_content_verifies_body() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/content/:hash",
            get(move |Path(_hash): Path<String>| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    "forged bytes"
                }
            }),
        );
        let addr = spawn_router(router).await;
        let client = fast_client(2);

        let body = client
            .fetch_content(&addr, &ContentHash::of(b"forged bytes"))
            .await
            .unwrap();
        assert_eq!(&body[..], b"forged bytes");

        let err = client
            .fetch_content(&addr, &ContentHash::of(b"real bytes"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Integrity { .. }));
        assert!(!err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_peers_lists_addresses() {
        let router = Router::new().route(
            "/peers",
            get(|| async {
                Json(vec![
                    PeerAddr::new("10.0.0.1", 8070),
                    PeerAddr::new("10.0.0.2", 8071),
                ])
            }),
        );
        let addr = spawn_router(router).await;

        let peers = fast_client(0).peers(&addr).await.unwrap();
        assert_eq!(
            peers,
            vec![PeerAddr::new("10.0.0.1", 8070), PeerAddr::new("10.0.0.2", 8071)]
        );
    }
}
