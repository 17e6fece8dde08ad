use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use dashmap::DashMap;
use dbsync_core::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

/// Cached digest of one file, valid while mtime and size are unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashCacheEntry {
    pub hash: String,
    pub mod_time_unix_nano: i64,
    pub size: u64,
}

/// Content hasher memoized by `(path, mtime, size)`.
///
/// The cache is an optimization only: a missing or corrupt cache file means
/// every file is hashed again, never that a stale digest is returned.
/// Lookups run concurrently; inserts lock a single shard.
#[derive(Debug, Default)]
pub struct HashCache {
    path: Option<PathBuf>,
    entries: DashMap<String, HashCacheEntry>,
}

impl HashCache {
    /// Load the cache persisted at `path`.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = DashMap::new();

        match std::fs::read(&path) {
            Ok(data) => match serde_json::from_slice::<BTreeMap<String, HashCacheEntry>>(&data) {
                Ok(loaded) => {
                    debug!("Loaded {} hash cache entries from {}", loaded.len(), path.display());
                    for (key, entry) in loaded {
                        entries.insert(key, entry);
                    }
                }
                Err(e) => {
                    warn!("Ignoring corrupt hash cache {}: {}", path.display(), e);
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to read hash cache {}: {}", path.display(), e);
            }
        }

        Self {
            path: Some(path),
            entries,
        }
    }

    /// A cache that is never persisted.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cached entry for `path`, if any (no validity check).
    pub fn get(&self, path: &Path) -> Option<HashCacheEntry> {
        let key = cache_key(path).ok()?;
        self.entries.get(&key).map(|e| e.value().clone())
    }

    /// Digest of `path`, served from the cache while its stat is unchanged.
    ///
    /// Stat and read failures are returned as-is.
    pub fn hash_file(&self, path: &Path) -> SyncResult<String> {
        let key = cache_key(path)?;
        let (mod_time_unix_nano, size) = stat(path)?;

        if let Some(entry) = self.entries.get(&key) {
            if entry.mod_time_unix_nano == mod_time_unix_nano && entry.size == size {
                return Ok(entry.hash.clone());
            }
        }

        let hash = compute_digest(path)
            .map_err(|e| SyncError::Io(format!("Failed to hash {}: {}", path.display(), e)))?;
        debug!("Hashed {} ({} bytes)", path.display(), size);

        self.entries.insert(
            key,
            HashCacheEntry {
                hash: hash.clone(),
                mod_time_unix_nano,
                size,
            },
        );
        Ok(hash)
    }

    /// Hash on the blocking pool.
    pub async fn hash(self: &Arc<Self>, path: &Path) -> SyncResult<String> {
        let cache = Arc::clone(self);
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || cache.hash_file(&path))
            .await
            .map_err(|e| SyncError::Internal(format!("Hash task failed: {}", e)))?
    }

    /// Drop entries whose file no longer exists.
    pub fn prune(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| Path::new(key).exists());
        before - self.entries.len()
    }

    /// Prune stale paths and persist the cache atomically.
    #[instrument(skip(self), level = "debug")]
    pub fn save(&self) -> SyncResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let pruned = self.prune();
        let snapshot: BTreeMap<String, HashCacheEntry> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .map_err(|e| SyncError::Io(format!("Failed to create dir {}: {}", dir.display(), e)))?;

        let mut temp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| SyncError::Io(format!("Failed to stage hash cache: {}", e)))?;
        temp.write_all(&json)
            .map_err(|e| SyncError::Io(format!("Failed to write hash cache: {}", e)))?;
        temp.persist(path).map_err(|e| {
            SyncError::Io(format!("Failed to persist {}: {}", path.display(), e))
        })?;

        debug!(
            "Saved {} hash cache entries to {} ({} pruned)",
            snapshot.len(),
            path.display(),
            pruned
        );
        Ok(())
    }

    /// End of the cache lifecycle: persist it.
    pub fn close(&self) -> SyncResult<()> {
        self.save()
    }
}

fn cache_key(path: &Path) -> SyncResult<String> {
    let absolute = std::path::absolute(path).map_err(|e| {
        SyncError::Io(format!("Failed to resolve {}: {}", path.display(), e))
    })?;
    Ok(absolute.to_string_lossy().into_owned())
}

fn stat(path: &Path) -> SyncResult<(i64, u64)> {
    let metadata = std::fs::metadata(path)
        .map_err(|e| SyncError::Io(format!("Failed to stat {}: {}", path.display(), e)))?;
    let modified = metadata
        .modified()
        .map_err(|e| SyncError::Io(format!("Failed to read mtime of {}: {}", path.display(), e)))?;
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Ok((nanos, metadata.len()))
}

/// SHA-256 of the whole file, hex encoded.
pub fn compute_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn touch(path: &Path, secs_ahead: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(secs_ahead))
            .unwrap();
    }

    #[test]
    fn test_hash_matches_digest() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.db");
        std::fs::write(&file, b"hello").unwrap();

        let cache = HashCache::in_memory();
        let hash = cache.hash_file(&file).unwrap();
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_hit_requires_same_stat() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.db");
        std::fs::write(&file, b"one").unwrap();

        let cache = HashCache::in_memory();
        let first = cache.hash_file(&file).unwrap();

        // Same size, new content and mtime: must be recomputed.
        std::fs::write(&file, b"two").unwrap();
        touch(&file, 5);
        let second = cache.hash_file(&file).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_cache_hit_skips_read() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.db");
        std::fs::write(&file, b"content").unwrap();

        let cache = HashCache::in_memory();
        cache.hash_file(&file).unwrap();

        // Poison the cached digest; an unchanged stat must return it.
        let key = cache_key(&file).unwrap();
        cache.entries.get_mut(&key).unwrap().hash = "cached".to_string();
        assert_eq!(cache.hash_file(&file).unwrap(), "cached");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp = TempDir::new().unwrap();
        let cache = HashCache::in_memory();
        let result = cache.hash_file(&temp.path().join("missing.db"));
        assert!(matches!(result, Err(SyncError::Io(_))));
    }

    #[test]
    fn test_save_prunes_and_reloads() {
        let temp = TempDir::new().unwrap();
        let cache_path = temp.path().join("cache.json");
        let keep = temp.path().join("keep.db");
        let gone = temp.path().join("gone.db");
        std::fs::write(&keep, b"keep").unwrap();
        std::fs::write(&gone, b"gone").unwrap();

        let cache = HashCache::open(&cache_path);
        cache.hash_file(&keep).unwrap();
        cache.hash_file(&gone).unwrap();
        std::fs::remove_file(&gone).unwrap();
        cache.close().unwrap();

        let reloaded = HashCache::open(&cache_path);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get(&keep).is_some());
        assert!(reloaded.get(&gone).is_none());
    }

    #[test]
    fn test_corrupt_cache_starts_empty() {
        let temp = TempDir::new().unwrap();
        let cache_path = temp.path().join("cache.json");
        std::fs::write(&cache_path, b"{not json").unwrap();

        let cache = HashCache::open(&cache_path);
        assert!(cache.is_empty());

        let file = temp.path().join("a.db");
        std::fs::write(&file, b"hello").unwrap();
        assert!(cache.hash_file(&file).is_ok());
    }

    #[test]
    fn test_persisted_shape() {
        let temp = TempDir::new().unwrap();
        let cache_path = temp.path().join("cache.json");
        let file = temp.path().join("a.db");
        std::fs::write(&file, b"hello").unwrap();

        let cache = HashCache::open(&cache_path);
        cache.hash_file(&file).unwrap();
        cache.save().unwrap();

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&cache_path).unwrap()).unwrap();
        let entry = json.as_object().unwrap().values().next().unwrap();
        assert_eq!(entry["size"], 5);
        assert!(entry["mod_time_unix_nano"].as_i64().unwrap() > 0);
        assert!(entry["hash"].is_string());
    }

    #[tokio::test]
    async fn test_async_hash() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("a.db");
        std::fs::write(&file, b"hello").unwrap();

        let cache = Arc::new(HashCache::in_memory());
        let hash = cache.hash(&file).await.unwrap();
        assert_eq!(hash, compute_digest(&file).unwrap());
    }
}
