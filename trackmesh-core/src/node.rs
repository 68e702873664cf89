//! The mesh node: catalog, peer directory, content store and gossip
//!
//! A [`Node`] is a cheap, cloneable handle. The catalog and the peer
//! directory live behind one `RwLock` so that every mutation of either is
//! serialized; no lock is ever held across a network call.

use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api;
use crate::catalog::{self, Catalog, CatalogError, InsertOutcome};
use crate::client::{ClientConfig, ProtocolClient, ProtocolError};
use crate::content_hash::ContentHash;
use crate::messages::{DiscoverRequest, DiscoverResponse, NodeStats, PeerAddr};
use crate::metrics::Metrics;
use crate::peer::{FailureOutcome, Peer, PeerDirectory};
use crate::storage::{ContentStore, StorageError};
use crate::track::{Track, TrackError, TrackMetadata};

pub const CATALOG_FILE: &str = "catalog.json";
pub const PEERS_FILE: &str = "peers.json";
pub const CONTENT_DIR: &str = "content";

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("Invalid track: {0}")]
    InvalidTrack(#[from] TrackError),

    #[error("Track not found locally or on any peer: {0}")]
    TrackNotFound(ContentHash),

    #[error("Invalid peer: {0}")]
    InvalidPeer(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Failed to persist node state: {0}")]
    Persist(#[from] CatalogError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Node is shutting down")]
    ShuttingDown,
}

/// Runtime settings for one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// Address other nodes use to reach this node's protocol server
    pub advertise_addr: PeerAddr,
    pub seeds: Vec<PeerAddr>,
    pub gossip_interval: Duration,
    pub gossip_round_timeout: Duration,
    pub gossip_fanout: usize,
    pub failure_threshold: u32,
    pub stale_after: Duration,
    pub fetch_race_width: usize,
    pub client: ClientConfig,
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>, advertise_addr: PeerAddr) -> Self {
        Self {
            data_dir: data_dir.into(),
            advertise_addr,
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(30),
            gossip_round_timeout: Duration::from_secs(10),
            gossip_fanout: 8,
            failure_threshold: 5,
            stale_after: Duration::from_secs(600),
            fetch_race_width: 3,
            client: ClientConfig::default(),
        }
    }
}

/// Lifecycle phase: `Init -> Idle <-> Discovering`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Init,
    Idle,
    Discovering,
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodePhase::Init => "init",
            NodePhase::Idle => "idle",
            NodePhase::Discovering => "discovering",
        };
        f.write_str(name)
    }
}

/// Summary of one gossip round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GossipReport {
    pub contacted: usize,
    pub reached: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub evicted: usize,
    /// New addresses queued for the next round
    pub discovered: usize,
    /// Local hashes added since the previous round
    pub announced: usize,
}

struct NodeState {
    catalog: Catalog,
    directory: PeerDirectory,
    phase: NodePhase,
    unannounced: BTreeSet<ContentHash>,
}

struct NodeInner {
    node_id: Uuid,
    config: NodeConfig,
    store: ContentStore,
    client: ProtocolClient,
    metrics: Metrics,
    state: RwLock<NodeState>,
    // Fired once the server stops; aborts outbound calls still in flight
    shutdown: CancellationToken,
    // Serializes gossip rounds
    gossip_lock: Mutex<()>,
    // Orders snapshot-and-write of the state files
    persist_lock: Mutex<()>,
}

/// Handle to a running mesh node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Counts a fetch attempt as cancelled if it is dropped before finishing
struct AttemptGuard {
    metrics: Metrics,
    finished: bool,
}

impl AttemptGuard {
    fn new(metrics: Metrics) -> Self {
        Self {
            metrics,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.metrics.fetch_cancelled();
        }
    }
}

impl Node {
    /// Open (or create) the node's data directory and load persisted state
    pub async fn open(config: NodeConfig) -> Result<Self, NodeError> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let store = ContentStore::open(config.data_dir.join(CONTENT_DIR)).await?;

        let mut catalog = Catalog::load(&config.data_dir.join(CATALOG_FILE)).await?;
        let mut present = HashSet::new();
        for hash in catalog.hashes() {
            if store.contains(&hash).await {
                present.insert(hash);
            }
        }
        let before = catalog.len();
        catalog.retain(|track| present.contains(&track.content_hash()));
        if catalog.len() < before {
            warn!(
                dropped = before - catalog.len(),
                "Dropped catalog entries with missing content"
            );
        }
        let adopted = adopt_uncataloged(&store, &mut catalog).await?;

        let mut directory = PeerDirectory::new(config.advertise_addr.clone());
        for peer in catalog::load_peers(&config.data_dir.join(PEERS_FILE)).await? {
            if peer.addr() != config.advertise_addr {
                directory.restore(peer);
            }
        }
        for seed in &config.seeds {
            directory.add_pending(seed.clone());
        }

        let client = ProtocolClient::new(config.client)?;
        let node_id = Uuid::new_v4();

        info!(
            node_id = %node_id,
            addr = %config.advertise_addr,
            tracks = catalog.len(),
            peers = directory.len(),
            pending = directory.pending().len(),
            "Node initialized"
        );

        let node = Self {
            inner: Arc::new(NodeInner {
                node_id,
                config,
                store,
                client,
                metrics: Metrics::new(),
                state: RwLock::new(NodeState {
                    catalog,
                    directory,
                    phase: NodePhase::Idle,
                    unannounced: BTreeSet::new(),
                }),
                shutdown: CancellationToken::new(),
                gossip_lock: Mutex::new(()),
                persist_lock: Mutex::new(()),
            }),
        };

        if adopted > 0 {
            node.save_catalog().await?;
        }
        Ok(node)
    }

    pub fn node_id(&self) -> Uuid {
        self.inner.node_id
    }

    pub fn local_addr(&self) -> &PeerAddr {
        &self.inner.config.advertise_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.inner.store
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub async fn phase(&self) -> NodePhase {
        self.inner.state.read().await.phase
    }

    /// Abort outbound calls in flight; fetches and handshakes started after
    /// this fail with [`NodeError::ShuttingDown`]
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Ingest local bytes; returns the catalog's record for the hash
    ///
    /// Adding bytes that are already cataloged returns the existing record
    /// unchanged.
    pub async fn add_track(
        &self,
        raw_bytes: &[u8],
        metadata: TrackMetadata,
    ) -> Result<Track, NodeError> {
        let track = Track::create(raw_bytes, metadata)?;
        let hash = track.content_hash();

        self.inner.store.put(&hash, raw_bytes).await?;

        let inserted = {
            let mut state = self.inner.state.write().await;
            match state.catalog.insert(track.clone()) {
                InsertOutcome::Inserted => {
                    state.unannounced.insert(hash);
                    None
                }
                InsertOutcome::Existing(existing) => Some(existing),
            }
        };

        match inserted {
            Some(existing) => {
                debug!(hash = %hash, "Track already cataloged");
                Ok(existing)
            }
            None => {
                self.inner.metrics.track_added();
                info!(hash = %hash, title = track.title(), size = track.size_bytes(), "Added track");
                // The track is live either way; the next persist retries the write
                if let Err(e) = self.save_catalog().await {
                    warn!(hash = %hash, error = %e, "Failed to persist catalog after add");
                }
                Ok(track)
            }
        }
    }

    /// Return verified bytes for `hash`, fetching from peers on a local miss
    pub async fn get_track(&self, hash: &ContentHash) -> Result<Bytes, NodeError> {
        let mut previous = None;
        match self.inner.store.get(hash).await {
            Ok(bytes) => {
                self.inner.metrics.local_hit();
                return Ok(bytes);
            }
            Err(StorageError::NotFound(_)) => {}
            Err(StorageError::Integrity { .. }) => {
                self.inner.metrics.integrity_failed();
                warn!(hash = %hash, "Local copy is corrupted, refetching from peers");
                previous = self.evict_local(hash).await?;
            }
            Err(e) => return Err(e.into()),
        }
        self.inner.metrics.local_miss();
        if self.is_shutting_down() {
            return Err(NodeError::ShuttingDown);
        }

        let candidates = {
            let state = self.inner.state.read().await;
            state
                .directory
                .candidates_for(hash, self.inner.config.stale_after)
        };
        if candidates.is_empty() {
            debug!(hash = %hash, "No peer advertises this hash");
            return Err(NodeError::TrackNotFound(*hash));
        }

        let width = self.inner.config.fetch_race_width.max(1);
        for wave in candidates.chunks(width) {
            if let Some((peer, bytes)) = self.race_wave(*hash, wave).await {
                return self.accept_remote(*hash, &peer, bytes, previous).await;
            }
            if self.is_shutting_down() {
                info!(hash = %hash, "Fetch abandoned for shutdown");
                return Err(NodeError::ShuttingDown);
            }
        }

        info!(hash = %hash, candidates = candidates.len(), "Every candidate failed");
        Err(NodeError::TrackNotFound(*hash))
    }

    /// Drop a corrupted local copy and its catalog entry so the hash is no
    /// longer advertised; returns the removed record
    async fn evict_local(&self, hash: &ContentHash) -> Result<Option<Track>, NodeError> {
        self.inner.store.remove(hash).await?;
        let removed = {
            let mut state = self.inner.state.write().await;
            state.unannounced.remove(hash);
            state.catalog.remove(hash)
        };
        if removed.is_some() {
            self.save_catalog().await?;
        }
        Ok(removed)
    }

    /// Race one wave of candidates; the first verified response wins and the
    /// remaining attempts are aborted and reaped before returning. Shutdown
    /// aborts the whole wave.
    async fn race_wave(&self, hash: ContentHash, wave: &[Peer]) -> Option<(Peer, Bytes)> {
        let mut attempts = JoinSet::new();
        for peer in wave {
            let client = self.inner.client.clone();
            let guard = AttemptGuard::new(self.inner.metrics.clone());
            let peer = peer.clone();
            attempts.spawn(async move {
                let result = client.fetch_content(&peer.addr(), &hash).await;
                guard.finish();
                (peer, result)
            });
        }
        debug!(hash = %hash, racers = attempts.len(), "Racing peers for content");

        let mut winner = None;
        loop {
            let joined = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                joined = attempts.join_next() => match joined {
                    Some(joined) => joined,
                    None => break,
                },
            };
            match joined {
                Ok((peer, Ok(bytes))) => {
                    winner = Some((peer, bytes));
                    break;
                }
                Ok((peer, Err(e))) => self.note_attempt_failure(&peer, &hash, &e).await,
                Err(e) => warn!(hash = %hash, error = %e, "Fetch attempt panicked"),
            }
        }

        if winner.is_some() && !attempts.is_empty() {
            debug!(hash = %hash, losers = attempts.len(), "Cancelling losing fetch attempts");
        }
        attempts.abort_all();
        while let Some(joined) = attempts.join_next().await {
            // Attempts that finished before the abort still count
            if let Ok((peer, Err(e))) = joined {
                self.note_attempt_failure(&peer, &hash, &e).await;
            }
        }

        winner
    }

    async fn note_attempt_failure(&self, peer: &Peer, hash: &ContentHash, error: &ProtocolError) {
        self.inner.metrics.remote_failed();

        let mut state = self.inner.state.write().await;
        match error {
            ProtocolError::NotFound { .. } => {
                debug!(peer = %peer.addr(), hash = %hash, "Peer no longer holds content");
                state.directory.forget_hash(&peer.peer_id, hash);
            }
            _ => {
                if matches!(error, ProtocolError::Integrity { .. }) {
                    self.inner.metrics.integrity_failed();
                }
                warn!(peer = %peer.addr(), hash = %hash, error = %error, "Fetch attempt failed");
                let threshold = self.inner.config.failure_threshold;
                if state.directory.record_failure(&peer.peer_id, threshold)
                    == FailureOutcome::Evicted
                {
                    self.inner.metrics.peer_evicted();
                }
            }
        }
    }

    /// Store a verified remote copy and catalog it
    ///
    /// `previous` is the local record of a copy that was evicted as corrupted;
    /// it keeps its metadata instead of asking the peer.
    async fn accept_remote(
        &self,
        hash: ContentHash,
        peer: &Peer,
        bytes: Bytes,
        previous: Option<Track>,
    ) -> Result<Bytes, NodeError> {
        let addr = peer.addr();
        self.inner.store.put(&hash, &bytes).await?;
        self.inner.metrics.remote_fetched(bytes.len());

        let size = bytes.len() as u64;
        let track = match previous {
            Some(track) => track,
            None => self.remote_record(&addr, hash, size).await?,
        };

        let inserted = {
            let mut state = self.inner.state.write().await;
            state.directory.mark_seen(&peer.peer_id);
            state.catalog.insert(track) == InsertOutcome::Inserted
        };
        info!(hash = %hash, peer = %addr, size, "Fetched track from peer");

        if inserted {
            self.save_catalog().await?;
        }
        Ok(bytes)
    }

    /// Metadata for a fetched copy from the peer that served it, or a
    /// placeholder titled with the hash
    async fn remote_record(
        &self,
        addr: &PeerAddr,
        hash: ContentHash,
        size: u64,
    ) -> Result<Track, NodeError> {
        let placeholder = TrackMetadata::titled(hash.to_hex());
        let lookup = tokio::select! {
            _ = self.inner.shutdown.cancelled() => None,
            result = self.inner.client.track_metadata(addr, &hash) => Some(result),
        };
        let metadata = match lookup {
            Some(Ok(record)) if record.content_hash() == hash && record.size_bytes() == size => {
                record.metadata()
            }
            Some(Ok(_)) => {
                warn!(peer = %addr, hash = %hash, "Peer metadata does not describe the fetched content");
                placeholder.clone()
            }
            Some(Err(e)) => {
                debug!(peer = %addr, hash = %hash, error = %e, "No metadata from peer");
                placeholder.clone()
            }
            None => placeholder.clone(),
        };
        Ok(Track::from_parts(hash, size, metadata)
            .or_else(|_| Track::from_parts(hash, size, placeholder))?)
    }

    /// The cataloged record for `hash`, if any
    pub async fn track(&self, hash: &ContentHash) -> Option<Track> {
        self.inner.state.read().await.catalog.get(hash).cloned()
    }

    pub async fn list_tracks(&self) -> Vec<Track> {
        self.inner.state.read().await.catalog.tracks()
    }

    pub async fn track_hashes(&self) -> Vec<ContentHash> {
        self.inner.state.read().await.catalog.hashes()
    }

    pub async fn list_peers(&self) -> Vec<Peer> {
        self.inner.state.read().await.directory.snapshot()
    }

    pub async fn peer_addresses(&self) -> Vec<PeerAddr> {
        self.inner.state.read().await.directory.addresses(None)
    }

    pub async fn pending_peers(&self) -> Vec<PeerAddr> {
        self.inner.state.read().await.directory.pending()
    }

    /// Insert a peer record as-is
    pub async fn restore_peer(&self, peer: Peer) {
        self.inner.state.write().await.directory.restore(peer);
    }

    /// Register the caller of `POST /discover` and answer with local state
    pub async fn handle_discover(&self, request: DiscoverRequest) -> DiscoverResponse {
        let caller = request.addr();
        let mut state = self.inner.state.write().await;

        if request.node_id == self.inner.node_id || caller == self.inner.config.advertise_addr {
            debug!(addr = %caller, "Ignoring discover from self");
        } else {
            state
                .directory
                .upsert_handshake(request.node_id, caller.clone(), request.known_hashes);
        }

        DiscoverResponse {
            node_id: self.inner.node_id,
            peers: state.directory.addresses(Some(&caller)),
            known_hashes: state.catalog.hashes(),
        }
    }

    /// Manually add a peer and handshake with it immediately
    ///
    /// On failure the address stays queued for the next gossip round.
    pub async fn add_peer(&self, addr: PeerAddr) -> Result<Peer, NodeError> {
        if addr == self.inner.config.advertise_addr {
            return Err(NodeError::InvalidPeer(format!("{} is this node", addr)));
        }

        let request = self.discover_request().await;
        let result = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return Err(NodeError::ShuttingDown),
            result = self.inner.client.discover(&addr, &request) => result,
        };
        match result {
            Ok(response) => {
                if response.node_id == self.inner.node_id {
                    return Err(NodeError::InvalidPeer(format!("{} is this node", addr)));
                }
                let mut state = self.inner.state.write().await;
                let peer = merge_discover(&mut state.directory, &addr, response).0;
                drop(state);
                self.save_peers().await?;
                Ok(peer)
            }
            Err(e) => {
                self.inner.metrics.handshake_failed();
                self.inner
                    .state
                    .write()
                    .await
                    .directory
                    .add_pending(addr.clone());
                warn!(peer = %addr, error = %e, "Handshake with new peer failed");
                Err(e.into())
            }
        }
    }

    async fn discover_request(&self) -> DiscoverRequest {
        let state = self.inner.state.read().await;
        let addr = &self.inner.config.advertise_addr;
        DiscoverRequest {
            node_id: self.inner.node_id,
            host: addr.host.clone(),
            port: addr.port,
            known_hashes: state.catalog.hashes(),
        }
    }

    /// One gossip round: handshake with a bounded set of peers plus every
    /// pending address, merge what they report and record failures
    pub async fn gossip_round(&self) -> GossipReport {
        let _round = self.inner.gossip_lock.lock().await;
        let config = &self.inner.config;

        let mut report = GossipReport::default();
        let (targets, request) = {
            let mut state = self.inner.state.write().await;
            state.phase = NodePhase::Discovering;
            report.announced = std::mem::take(&mut state.unannounced).len();

            let mut targets: HashMap<PeerAddr, Option<Uuid>> = state
                .directory
                .gossip_targets(config.gossip_fanout)
                .into_iter()
                .map(|peer| (peer.addr(), Some(peer.peer_id)))
                .collect();
            for addr in state.directory.take_pending() {
                targets.entry(addr).or_insert(None);
            }

            let request = DiscoverRequest {
                node_id: self.inner.node_id,
                host: config.advertise_addr.host.clone(),
                port: config.advertise_addr.port,
                known_hashes: state.catalog.hashes(),
            };
            (targets, request)
        };
        report.contacted = targets.len();
        debug!(targets = targets.len(), "Starting gossip round");

        let request = Arc::new(request);
        let mut calls = JoinSet::new();
        for addr in targets.keys().cloned() {
            let client = self.inner.client.clone();
            let request = request.clone();
            calls.spawn(async move {
                let result = client.discover(&addr, &request).await;
                (addr, result)
            });
        }

        let mut outstanding = targets;
        let deadline = tokio::time::sleep(config.gossip_round_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = calls.join_next() => match joined {
                    None => break,
                    Some(Ok((addr, result))) => {
                        let known_id = outstanding.remove(&addr).flatten();
                        self.merge_gossip_result(addr, known_id, result, &mut report).await;
                    }
                    Some(Err(e)) => warn!(error = %e, "Gossip task panicked"),
                },
                _ = &mut deadline => {
                    warn!(remaining = calls.len(), "Gossip round timed out");
                    calls.abort_all();
                    break;
                }
            }
        }
        while calls.join_next().await.is_some() {}

        {
            let mut state = self.inner.state.write().await;
            for (addr, known_id) in outstanding {
                report.timed_out += 1;
                match known_id {
                    Some(id) => {
                        if state.directory.record_failure(&id, config.failure_threshold)
                            == FailureOutcome::Evicted
                        {
                            self.inner.metrics.peer_evicted();
                            report.evicted += 1;
                        }
                    }
                    None => {
                        state.directory.add_pending(addr);
                    }
                }
            }
            state.phase = NodePhase::Idle;
        }

        self.inner.metrics.gossip_round();
        if let Err(e) = self.save_peers().await {
            warn!(error = %e, "Failed to persist peers after gossip round");
        }

        info!(
            contacted = report.contacted,
            reached = report.reached,
            failed = report.failed,
            timed_out = report.timed_out,
            evicted = report.evicted,
            discovered = report.discovered,
            "Gossip round complete"
        );
        report
    }

    async fn merge_gossip_result(
        &self,
        addr: PeerAddr,
        known_id: Option<Uuid>,
        result: Result<DiscoverResponse, ProtocolError>,
        report: &mut GossipReport,
    ) {
        let mut state = self.inner.state.write().await;
        match result {
            Ok(response) if response.node_id == self.inner.node_id => {
                debug!(addr = %addr, "Address resolves to this node");
            }
            Ok(response) => {
                let (_, discovered) = merge_discover(&mut state.directory, &addr, response);
                report.reached += 1;
                report.discovered += discovered;
            }
            Err(e) => {
                self.inner.metrics.handshake_failed();
                report.failed += 1;
                match known_id {
                    Some(id) => {
                        debug!(peer = %addr, error = %e, "Gossip handshake failed");
                        let threshold = self.inner.config.failure_threshold;
                        if state.directory.record_failure(&id, threshold) == FailureOutcome::Evicted {
                            self.inner.metrics.peer_evicted();
                            report.evicted += 1;
                        }
                    }
                    None => {
                        debug!(addr = %addr, error = %e, "Pending address unreachable");
                        // Seeds stay queued until they answer
                        if self.inner.config.seeds.contains(&addr) {
                            state.directory.add_pending(addr);
                        }
                    }
                }
            }
        }
    }

    /// Run gossip rounds every `gossip_interval` until `cancel` fires
    pub async fn run_gossip(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.gossip_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.inner.config.gossip_interval, "Gossip loop started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = self.gossip_round() => {}
                    }
                }
            }
        }

        // A round dropped mid-flight leaves the phase behind
        self.inner.state.write().await.phase = NodePhase::Idle;
        info!("Gossip loop stopped");
    }

    /// Serve the protocol and admin API until `cancel` fires
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<(), NodeError> {
        let router = api::create_router(self.clone());
        info!(addr = %listener.local_addr()?, node_id = %self.inner.node_id, "Protocol server listening");

        // Open admin requests may be waiting on peers; release them so the
        // graceful shutdown does not wait out their timeouts
        let node = self.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
                node.shutdown();
            })
            .await?;

        info!("Protocol server stopped");
        Ok(())
    }

    /// Write the catalog and peer files
    pub async fn persist(&self) -> Result<(), NodeError> {
        self.save_catalog().await?;
        self.save_peers().await?;
        Ok(())
    }

    async fn save_catalog(&self) -> Result<(), NodeError> {
        let _guard = self.inner.persist_lock.lock().await;
        let catalog = self.inner.state.read().await.catalog.clone();
        catalog
            .save(&self.inner.config.data_dir.join(CATALOG_FILE))
            .await?;
        Ok(())
    }

    async fn save_peers(&self) -> Result<(), NodeError> {
        let _guard = self.inner.persist_lock.lock().await;
        let peers = self.list_peers().await;
        catalog::save_peers(&self.inner.config.data_dir.join(PEERS_FILE), &peers).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<NodeStats, NodeError> {
        let store_stats = self.inner.store.stats().await?;
        let state = self.inner.state.read().await;

        Ok(NodeStats {
            node_id: self.inner.node_id,
            listen_addr: self.inner.config.advertise_addr.clone(),
            phase: state.phase.to_string(),
            track_count: state.catalog.len(),
            peer_count: state.directory.len(),
            pending_peers: state.directory.pending().len(),
            stored_entries: store_stats.entry_count,
            stored_bytes: store_stats.total_bytes,
            metrics: self.inner.metrics.snapshot(),
        })
    }
}

/// Fold a successful discover response into the directory
///
/// Returns the registered peer and how many new addresses were queued.
fn merge_discover(
    directory: &mut PeerDirectory,
    addr: &PeerAddr,
    response: DiscoverResponse,
) -> (Peer, usize) {
    let peer = directory
        .upsert_handshake(response.node_id, addr.clone(), response.known_hashes)
        .clone();
    let discovered = response
        .peers
        .into_iter()
        .filter(|learned| directory.add_pending(learned.clone()))
        .count();
    (peer, discovered)
}

/// Catalog store entries that have no record, which happens when the node
/// stops between writing content and saving the catalog. Corrupted entries
/// are removed instead.
async fn adopt_uncataloged(store: &ContentStore, catalog: &mut Catalog) -> Result<usize, NodeError> {
    let mut orphans = Vec::new();
    let hashes = store.list_hashes();
    tokio::pin!(hashes);
    while let Some(hash) = hashes.next().await {
        let hash = hash?;
        if !catalog.contains(&hash) {
            orphans.push(hash);
        }
    }

    let mut adopted = 0;
    for hash in orphans {
        match store.get(&hash).await {
            Ok(bytes) => {
                let track =
                    Track::from_parts(hash, bytes.len() as u64, TrackMetadata::titled(hash.to_hex()))?;
                catalog.insert(track);
                adopted += 1;
            }
            Err(StorageError::Integrity { .. }) => {
                warn!(hash = %hash, "Removing corrupted uncataloged content");
                store.remove(&hash).await?;
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    if adopted > 0 {
        info!(adopted, "Cataloged stored content missing from the catalog");
    }
    Ok(adopted)
}
