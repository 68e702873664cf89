//! Local track catalog and its on-disk persistence

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

use crate::content_hash::ContentHash;
use crate::peer::Peer;
use crate::track::Track;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed state file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Outcome of inserting a track into the catalog
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// An entry for this hash already existed and was kept
    Existing(Track),
}

/// `hash -> Track` map; the first record for a hash wins
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    tracks: HashMap<ContentHash, Track>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, track: Track) -> InsertOutcome {
        let hash = track.content_hash();
        if let Some(existing) = self.tracks.get(&hash) {
            if existing.metadata() != track.metadata() {
                debug!(hash = %hash, "Keeping existing metadata for known track");
            }
            return InsertOutcome::Existing(existing.clone());
        }
        self.tracks.insert(hash, track);
        InsertOutcome::Inserted
    }

    pub fn get(&self, hash: &ContentHash) -> Option<&Track> {
        self.tracks.get(hash)
    }

    pub fn remove(&mut self, hash: &ContentHash) -> Option<Track> {
        self.tracks.remove(hash)
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.tracks.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Sorted list of every hash in the catalog
    pub fn hashes(&self) -> Vec<ContentHash> {
        let mut hashes: Vec<ContentHash> = self.tracks.keys().copied().collect();
        hashes.sort();
        hashes
    }

    /// Every track, oldest first
    pub fn tracks(&self) -> Vec<Track> {
        let mut tracks: Vec<Track> = self.tracks.values().cloned().collect();
        tracks.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then(a.content_hash().cmp(&b.content_hash()))
        });
        tracks
    }

    pub fn total_bytes(&self) -> u64 {
        self.tracks.values().map(Track::size_bytes).sum()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&Track) -> bool) {
        self.tracks.retain(|_, track| keep(track));
    }

    /// Load a catalog file; a missing file yields an empty catalog
    pub async fn load(path: &Path) -> Result<Self, CatalogError> {
        let Some(records) = read_json::<HashMap<ContentHash, Track>>(path).await? else {
            return Ok(Self::new());
        };

        let mut catalog = Self::new();
        for (hash, track) in records {
            // Keys are advisory; the record's own hash is authoritative
            if hash != track.content_hash() {
                debug!(key = %hash, "Catalog key does not match record hash");
            }
            catalog.insert(track);
        }

        info!(path = %path.display(), tracks = catalog.len(), "Loaded catalog");
        Ok(catalog)
    }

    pub async fn save(&self, path: &Path) -> Result<(), CatalogError> {
        let records: HashMap<String, &Track> = self
            .tracks
            .iter()
            .map(|(hash, track)| (hash.to_hex(), track))
            .collect();
        write_json_atomic(path, &records).await
    }
}

/// Persisted peer directory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PeerRecord {
    host: String,
    port: u16,
    last_seen: u64,
    #[serde(default)]
    known_hashes: Vec<ContentHash>,
    #[serde(default)]
    consecutive_failures: u32,
}

/// Load the peer file; a missing file yields no peers
pub async fn load_peers(path: &Path) -> Result<Vec<Peer>, CatalogError> {
    let Some(records) = read_json::<HashMap<uuid::Uuid, PeerRecord>>(path).await? else {
        return Ok(Vec::new());
    };

    let peers: Vec<Peer> = records
        .into_iter()
        .map(|(peer_id, record)| Peer {
            peer_id,
            host: record.host,
            port: record.port,
            last_seen: record.last_seen,
            known_hashes: record.known_hashes.into_iter().collect(),
            consecutive_failures: record.consecutive_failures,
        })
        .collect();

    info!(path = %path.display(), peers = peers.len(), "Loaded peers");
    Ok(peers)
}

pub async fn save_peers(path: &Path, peers: &[Peer]) -> Result<(), CatalogError> {
    let records: HashMap<String, PeerRecord> = peers
        .iter()
        .map(|peer| {
            (
                peer.peer_id.to_string(),
                PeerRecord {
                    host: peer.host.clone(),
                    port: peer.port,
                    last_seen: peer.last_seen,
                    known_hashes: peer.known_hashes.iter().copied().collect(),
                    consecutive_failures: peer.consecutive_failures,
                },
            )
        })
        .collect();
    write_json_atomic(path, &records).await
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, CatalogError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CatalogError> {
    let data = serde_json::to_vec_pretty(value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, &data).await?;
    if let Err(e) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}
