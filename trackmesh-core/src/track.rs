//! Content-addressed track records
//!
//! A [`Track`] is the immutable metadata record for one media item. Its
//! identity is the SHA-256 of the raw bytes; everything else is descriptive.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::content_hash::ContentHash;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("Track content is empty")]
    EmptyContent,

    #[error("Track title is required")]
    MissingTitle,
}

/// Caller-supplied descriptive fields for a new track
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl TrackMetadata {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<(), TrackError> {
        if self.title.trim().is_empty() {
            return Err(TrackError::MissingTitle);
        }
        Ok(())
    }
}

/// Immutable metadata for one media item, keyed by content hash
///
/// Equality and hashing only look at `content_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    content_hash: ContentHash,
    title: String,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    album: Option<String>,
    size_bytes: u64,
    #[serde(default)]
    duration_seconds: Option<f64>,
    created_at: u64,
}

impl Track {
    /// Create a track from raw bytes, computing its content hash
    pub fn create(raw_bytes: &[u8], metadata: TrackMetadata) -> Result<Self, TrackError> {
        if raw_bytes.is_empty() {
            return Err(TrackError::EmptyContent);
        }
        Self::from_parts(
            ContentHash::of(raw_bytes),
            raw_bytes.len() as u64,
            metadata,
        )
    }

    /// Build a track for content whose hash has already been verified
    pub fn from_parts(
        content_hash: ContentHash,
        size_bytes: u64,
        metadata: TrackMetadata,
    ) -> Result<Self, TrackError> {
        if size_bytes == 0 {
            return Err(TrackError::EmptyContent);
        }
        metadata.validate()?;

        Ok(Self {
            content_hash,
            title: metadata.title.trim().to_string(),
            artist: metadata.artist,
            album: metadata.album,
            size_bytes,
            duration_seconds: metadata.duration_seconds,
            created_at: unix_now(),
        })
    }

    pub fn content_hash(&self) -> ContentHash {
        self.content_hash
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn artist(&self) -> Option<&str> {
        self.artist.as_deref()
    }

    pub fn album(&self) -> Option<&str> {
        self.album.as_deref()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn duration_seconds(&self) -> Option<f64> {
        self.duration_seconds
    }

    /// Creation time in unix seconds
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn metadata(&self) -> TrackMetadata {
        TrackMetadata {
            title: self.title.clone(),
            artist: self.artist.clone(),
            album: self.album.clone(),
            duration_seconds: self.duration_seconds,
        }
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.content_hash == other.content_hash
    }
}

impl Eq for Track {}

impl Hash for Track {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.content_hash.hash(state);
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
