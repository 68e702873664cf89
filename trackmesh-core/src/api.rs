//! HTTP surface of a node: the peer protocol plus the local admin API

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::content_hash::ContentHash;
use crate::messages::{DiscoverRequest, ErrorResponse, PeerAddr, PingResponse};
use crate::node::{Node, NodeError};
use crate::storage::StorageError;
use crate::track::TrackMetadata;

/// Largest body accepted by the upload endpoint
pub const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub track_count: usize,
    pub peer_count: usize,
    pub state: String,
}

/// Query string of `POST /api/v1/tracks`
#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub duration_seconds: Option<f64>,
}

impl From<UploadParams> for TrackMetadata {
    fn from(params: UploadParams) -> Self {
        TrackMetadata {
            title: params.title,
            artist: params.artist,
            album: params.album,
            duration_seconds: params.duration_seconds,
        }
    }
}

/// Create the router for one node
pub fn create_router(node: Node) -> Router {
    Router::new()
        // Peer protocol
        .route("/ping", get(ping))
        .route("/peers", get(peer_addresses))
        .route("/tracks", get(track_hashes))
        .route("/tracks/:hash", get(track_record))
        .route("/discover", post(discover))
        .route("/content/:hash", get(content))
        // Local admin API
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/stats", get(stats))
        .route(
            "/api/v1/tracks",
            get(list_tracks)
                .post(upload_track)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/v1/tracks/:hash/content", get(download_track))
        .route("/api/v1/peers", get(list_peers).post(add_peer))
        .with_state(node)
        .layer(TraceLayer::new_for_http())
}

async fn ping(State(node): State<Node>) -> Json<PingResponse> {
    Json(PingResponse {
        node_id: node.node_id(),
        status: "ok".to_string(),
    })
}

async fn peer_addresses(State(node): State<Node>) -> Json<Vec<PeerAddr>> {
    Json(node.peer_addresses().await)
}

async fn track_hashes(State(node): State<Node>) -> Json<Vec<ContentHash>> {
    Json(node.track_hashes().await)
}

/// Metadata record for one hash (GET /tracks/:hash)
async fn track_record(
    State(node): State<Node>,
    Path(hash): Path<String>,
) -> Result<Response, ApiError> {
    let hash = parse_hash(&hash)?;
    let track = node
        .track(&hash)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Track not found: {}", hash)))?;
    Ok(Json(track).into_response())
}

/// Handshake (POST /discover)
async fn discover(
    State(node): State<Node>,
    payload: Result<Json<DiscoverRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| {
        warn!(error = %e, "Rejected malformed discover request");
        ApiError::BadRequest(format!("Malformed discover request: {}", e))
    })?;

    info!(peer = %request.addr(), hashes = request.known_hashes.len(), "Discover request");
    Ok(Json(node.handle_discover(request).await).into_response())
}

/// Raw stored bytes (GET /content/:hash); never serves unverified data
async fn content(State(node): State<Node>, Path(hash): Path<String>) -> Result<Response, ApiError> {
    let hash = parse_hash(&hash)?;

    let data = node.store().get(&hash).await.map_err(|e| match e {
        StorageError::NotFound(_) => ApiError::NotFound(format!("Content not found: {}", hash)),
        StorageError::Integrity { .. } => {
            node.metrics().integrity_failed();
            ApiError::Internal(format!("Stored content for {} failed verification", hash))
        }
        other => ApiError::Internal(format!("Failed to read content: {}", other)),
    })?;

    node.metrics().content_served(data.len());
    Ok(octet_stream(data))
}

async fn health_check(State(node): State<Node>) -> Json<HealthResponse> {
    let tracks = node.track_hashes().await.len();
    let peers = node.peer_addresses().await.len();

    Json(HealthResponse {
        status: "ok".to_string(),
        track_count: tracks,
        peer_count: peers,
        state: node.phase().await.to_string(),
    })
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(node): State<Node>) -> Result<Response, ApiError> {
    let stats = node.stats().await?;
    let metrics = node
        .metrics()
        .to_prometheus(stats.track_count, stats.peer_count, stats.stored_bytes);

    Ok((
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics,
    )
        .into_response())
}

async fn stats(State(node): State<Node>) -> Result<Response, ApiError> {
    Ok(Json(node.stats().await?).into_response())
}

async fn list_tracks(State(node): State<Node>) -> Response {
    Json(node.list_tracks().await).into_response()
}

/// Add a track from the request body (POST /api/v1/tracks)
async fn upload_track(
    State(node): State<Node>,
    Query(params): Query<UploadParams>,
    body: bytes::Bytes,
) -> Result<Response, ApiError> {
    info!(size = body.len(), title = %params.title, "API: Uploading track");
    let track = node.add_track(&body, params.into()).await?;
    Ok(Json(track).into_response())
}

/// Fetch through the node, falling back to the mesh on a local miss
async fn download_track(
    State(node): State<Node>,
    Path(hash): Path<String>,
) -> Result<Response, ApiError> {
    let hash = parse_hash(&hash)?;
    let data = node.get_track(&hash).await?;
    Ok(octet_stream(data))
}

async fn list_peers(State(node): State<Node>) -> Response {
    Json(node.list_peers().await).into_response()
}

async fn add_peer(
    State(node): State<Node>,
    payload: Result<Json<PeerAddr>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(addr) = payload.map_err(|e| ApiError::BadRequest(format!("Malformed peer address: {}", e)))?;
    let peer = node.add_peer(addr).await?;
    Ok(Json(peer).into_response())
}

fn parse_hash(raw: &str) -> Result<ContentHash, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid content hash: {}", e)))
}

fn octet_stream(data: bytes::Bytes) -> Response {
    (
        StatusCode::OK,
        [("content-type", "application/octet-stream")],
        data,
    )
        .into_response()
}

/// API error type
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    BadGateway(String),
    Unavailable(String),
    Internal(String),
}

impl From<NodeError> for ApiError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::InvalidTrack(_) | NodeError::InvalidPeer(_) => ApiError::BadRequest(e.to_string()),
            NodeError::TrackNotFound(_) => ApiError::NotFound(e.to_string()),
            NodeError::Protocol(_) => ApiError::BadGateway(e.to_string()),
            NodeError::ShuttingDown => ApiError::Unavailable(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                error!("API error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}
