use std::path::{Path, PathBuf};

use dbsync_core::{metadata_file_name, SyncError, SyncResult};

/// Local directories used by the engine.
///
/// The metadata mirror and the anchor directory share a file naming scheme
/// (`{file_id}.metadata.json`) but are kept apart: the mirror is a 1:1 copy
/// of the remote history, anchors record the last verified synchronized state.
#[derive(Debug, Clone)]
pub struct SyncPaths {
    /// Where the database payloads live.
    pub db_dir: PathBuf,
    /// Local copy of the remote `version/` directory.
    pub mirror_dir: PathBuf,
    /// Event-free sync anchors.
    pub anchor_dir: PathBuf,
    /// Persisted content hash cache.
    pub hash_cache_file: PathBuf,
}

impl SyncPaths {
    /// Lay out the engine's private directories under `data_dir`.
    pub fn new(db_dir: impl AsRef<Path>, data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            db_dir: db_dir.as_ref().to_path_buf(),
            mirror_dir: data_dir.join("metadata"),
            anchor_dir: data_dir.join("anchors"),
            hash_cache_file: data_dir.join("hash-cache.json"),
        }
    }

    /// Path of a database payload.
    pub fn db_path(&self, db: &str) -> PathBuf {
        self.db_dir.join(db)
    }

    /// Path of a mirrored remote metadata document.
    pub fn mirror_path(&self, file_id: &str) -> PathBuf {
        self.mirror_dir.join(metadata_file_name(file_id))
    }

    /// Path of a local anchor.
    pub fn anchor_path(&self, file_id: &str) -> PathBuf {
        self.anchor_dir.join(metadata_file_name(file_id))
    }

    /// Create every directory the engine writes to.
    pub async fn ensure_dirs(&self) -> SyncResult<()> {
        for dir in [&self.db_dir, &self.mirror_dir, &self.anchor_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                SyncError::Io(format!("Failed to create dir {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}
