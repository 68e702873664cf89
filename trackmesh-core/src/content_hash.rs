//! SHA-256 content addressing
//!
//! Every track is identified by the SHA-256 digest of its raw bytes,
//! rendered as 64 lowercase hex characters on disk and on the wire.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a digest in bytes
pub const HASH_LEN: usize = 32;

/// Length of a digest rendered as hex
pub const HASH_HEX_LEN: usize = HASH_LEN * 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentHashError {
    #[error("Invalid content hash length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("Invalid content hash: {0}")]
    InvalidHex(String),

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    Mismatch {
        expected: ContentHash,
        actual: ContentHash,
    },
}

/// A 256-bit SHA-256 digest identifying a piece of content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Compute the hash of `data`
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Two-character prefix used as the shard directory name
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Check `data` against this hash
    pub fn verify(&self, data: &[u8]) -> Result<(), ContentHashError> {
        let actual = Self::of(data);
        if actual != *self {
            return Err(ContentHashError::Mismatch {
                expected: *self,
                actual,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl FromStr for ContentHash {
    type Err = ContentHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_HEX_LEN {
            return Err(ContentHashError::InvalidLength(s.len()));
        }
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| ContentHashError::InvalidHex(e.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 over content arriving in chunks
///
/// Used to verify a body while it downloads instead of hashing it again
/// once it is complete.
pub struct ContentHasher {
    hasher: Sha256,
    expected: ContentHash,
    bytes_hashed: u64,
}

impl ContentHasher {
    pub fn expecting(expected: ContentHash) -> Self {
        Self {
            hasher: Sha256::new(),
            expected,
            bytes_hashed: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes_hashed += chunk.len() as u64;
    }

    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed
    }

    /// Compare the digest of everything seen against the expected hash
    pub fn finish(self) -> Result<ContentHash, ContentHashError> {
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&self.hasher.finalize());
        let actual = ContentHash(bytes);

        if actual != self.expected {
            return Err(ContentHashError::Mismatch {
                expected: self.expected,
                actual,
            });
        }
        Ok(actual)
    }
}
