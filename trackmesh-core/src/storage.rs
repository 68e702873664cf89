//! Sharded on-disk content store
//!
//! Content lives at `<root>/<hash[0..2]>/<hash>`. Writes go to a temp file in
//! the shard directory and are renamed into place, so readers never observe a
//! partial file. Every read re-hashes the bytes before handing them out.

use bytes::Bytes;
use futures::stream::{self, Stream};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error, info};

use crate::content_hash::{ContentHash, HASH_HEX_LEN};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Content not found: {0}")]
    NotFound(ContentHash),

    #[error("Integrity check failed for {expected}: content hashes to {actual}")]
    Integrity {
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// File-backed, content-addressed byte store
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open a store rooted at `root`, creating the directory if needed
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        info!("Opened content store at {:?}", root);
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `hash`
    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.shard_prefix()).join(hash.to_hex())
    }

    /// Store `data` under `hash`
    ///
    /// Putting identical bytes twice is a no-op. Bytes that do not hash to
    /// `hash` are rejected with [`StorageError::Integrity`].
    pub async fn put(&self, hash: &ContentHash, data: &[u8]) -> Result<(), StorageError> {
        let actual = ContentHash::of(data);
        if actual != *hash {
            return Err(StorageError::Integrity {
                expected: *hash,
                actual,
            });
        }

        let path = self.path_for(hash);
        if fs::try_exists(&path).await? {
            debug!(hash = %hash, "Content already stored");
            return Ok(());
        }

        let shard_dir = self.root.join(hash.shard_prefix());
        fs::create_dir_all(&shard_dir).await?;

        // Unique temp name so concurrent writers of the same hash never share a file
        let tmp_path = shard_dir.join(format!("{}.{}.tmp", hash, uuid::Uuid::new_v4().simple()));
        if let Err(e) = fs::write(&tmp_path, data).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        info!(hash = %hash, size = data.len(), "Stored content");
        Ok(())
    }

    /// Store raw data, returning its hash
    pub async fn put_data(&self, data: &[u8]) -> Result<ContentHash, StorageError> {
        let hash = ContentHash::of(data);
        self.put(&hash, data).await?;
        Ok(hash)
    }

    /// Read and verify the content stored under `hash`
    pub async fn get(&self, hash: &ContentHash) -> Result<Bytes, StorageError> {
        let path = self.path_for(hash);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(*hash));
            }
            Err(e) => return Err(e.into()),
        };

        let actual = ContentHash::of(&data);
        if actual != *hash {
            error!(expected = %hash, actual = %actual, "Content corruption detected on read");
            return Err(StorageError::Integrity {
                expected: *hash,
                actual,
            });
        }

        Ok(Bytes::from(data))
    }

    /// Cheap existence check; does not read or verify the content
    pub async fn contains(&self, hash: &ContentHash) -> bool {
        fs::try_exists(self.path_for(hash)).await.unwrap_or(false)
    }

    /// Delete the entry for `hash`; returns false if it was absent
    pub async fn remove(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        match fs::remove_file(self.path_for(hash)).await {
            Ok(()) => {
                debug!(hash = %hash, "Removed content");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Full read and hash comparison
    pub async fn verify(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        match self.get(hash).await {
            Ok(_) => Ok(true),
            Err(StorageError::Integrity { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Lazily walk every stored hash
    ///
    /// The stream is finite and each call starts a fresh walk. Temp files
    /// and names that are not hashes are skipped.
    pub fn list_hashes(&self) -> impl Stream<Item = Result<ContentHash, StorageError>> + Send + '_ {
        let walk = HashWalk {
            root: self.root.clone(),
            shards: None,
            files: None,
        };

        stream::unfold(walk, |mut walk| async move {
            match walk.next_hash().await {
                Ok(Some(hash)) => Some((Ok(hash), walk)),
                Ok(None) => None,
                // Stop after reporting the error
                Err(e) => Some((Err(e), walk.finished())),
            }
        })
    }

    /// Number of stored entries and their total size
    pub async fn stats(&self) -> Result<StoreStats, StorageError> {
        use futures::StreamExt;

        let mut stats = StoreStats::default();
        let hashes = self.list_hashes();
        futures::pin_mut!(hashes);

        while let Some(hash) = hashes.next().await {
            let hash = hash?;
            match fs::metadata(self.path_for(&hash)).await {
                Ok(meta) => {
                    stats.entry_count += 1;
                    stats.total_bytes += meta.len();
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(stats)
    }
}

/// Statistics about the content store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entry_count: u64,
    pub total_bytes: u64,
}

/// Cursor over the two-level shard layout
struct HashWalk {
    root: PathBuf,
    shards: Option<std::vec::IntoIter<PathBuf>>,
    files: Option<fs::ReadDir>,
}

impl HashWalk {
    fn finished(self) -> Self {
        Self {
            root: self.root,
            shards: Some(Vec::new().into_iter()),
            files: None,
        }
    }

    async fn next_hash(&mut self) -> Result<Option<ContentHash>, StorageError> {
        if self.shards.is_none() {
            self.shards = Some(self.shard_dirs().await?.into_iter());
        }

        loop {
            if let Some(files) = self.files.as_mut() {
                while let Some(entry) = files.next_entry().await? {
                    if !entry.file_type().await?.is_file() {
                        continue;
                    }
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else {
                        continue;
                    };
                    if name.len() != HASH_HEX_LEN {
                        continue;
                    }
                    if let Ok(hash) = name.parse::<ContentHash>() {
                        return Ok(Some(hash));
                    }
                }
                self.files = None;
            }

            let next_shard = self.shards.as_mut().and_then(|shards| shards.next());
            match next_shard {
                Some(dir) => match fs::read_dir(&dir).await {
                    Ok(files) => self.files = Some(files),
                    // Shard removed between listing and reading
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                },
                None => return Ok(None),
            }
        }
    }

    async fn shard_dirs(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let is_shard = entry
                .file_name()
                .to_str()
                .map(|name| name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit()))
                .unwrap_or(false);
            if is_shard && entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }

        dirs.sort();
        Ok(dirs)
    }
}
