use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dbsync_core::{
    CancellationToken, Location, Lock, LockManager, LockTable, RemoteStore, SyncError, SyncResult,
    TransferOptions, LOCK_DIR, LOCK_SUFFIX,
};
use tracing::{debug, info, instrument, warn};

/// Lock manager storing markers in the remote `lock/` directory.
///
/// The marker name carries the whole lock; its content is the free-text
/// intent and is never read back.
pub struct RemoteLockManager {
    remote: Arc<dyn RemoteStore>,
    /// Where marker files are staged before upload.
    staging_dir: PathBuf,
}

impl RemoteLockManager {
    /// Create a new RemoteLockManager staging markers in the system temp dir.
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote,
            staging_dir: std::env::temp_dir(),
        }
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    fn lock_dir() -> Location {
        Location::remote(LOCK_DIR)
    }

    fn marker_location(lock: &Lock) -> Location {
        Location::remote_join(&[LOCK_DIR, &lock.object_name()])
    }

    /// Exclusive markers currently present, sorted by object name.
    async fn markers(&self, cancel: &CancellationToken) -> SyncResult<Vec<Lock>> {
        let mut names = self.remote.list(&Self::lock_dir(), false, cancel).await?;
        names.sort();
        Ok(names
            .iter()
            .filter_map(|name| Lock::parse(name))
            .filter(|lock| lock.kind.is_exclusive())
            .collect())
    }

    /// Delete one marker, refusing anything without the lock suffix.
    async fn delete_marker(&self, lock: &Lock, cancel: &CancellationToken) -> SyncResult<()> {
        let object_name = lock.object_name();
        if !object_name.ends_with(&format!(".{}", LOCK_SUFFIX)) {
            return Err(SyncError::Internal(format!(
                "Refusing to delete non-lock object {}",
                object_name
            )));
        }
        self.remote
            .delete_file(&Self::marker_location(lock), cancel)
            .await
    }

    /// Stage `intent` in a temp file and upload it as the marker.
    async fn write_marker(
        &self,
        lock: &Lock,
        intent: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let mut staged = tempfile::Builder::new()
            .prefix("dbsync-lock-")
            .tempfile_in(&self.staging_dir)
            .map_err(|e| {
                SyncError::Io(format!(
                    "Failed to stage lock marker in {}: {}",
                    self.staging_dir.display(),
                    e
                ))
            })?;
        staged
            .write_all(intent.as_bytes())
            .and_then(|_| staged.flush())
            .map_err(|e| SyncError::Io(format!("Failed to write lock marker: {}", e)))?;

        // The staged file is removed when `staged` drops, on every path.
        self.remote
            .copy_to(
                &Location::local(staged.path()),
                &Self::marker_location(lock),
                TransferOptions::default(),
                cancel,
            )
            .await
    }
}

#[async_trait]
impl LockManager for RemoteLockManager {
    #[instrument(skip(self, cancel), level = "debug")]
    async fn lock(
        &self,
        db: &str,
        owner: &str,
        hostname: &str,
        intent: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let locks = self.list_locks(cancel).await?;

        if let Some(existing) = locks.get(db) {
            if !force && existing.owner != owner {
                return Err(SyncError::AlreadyLocked {
                    db: db.to_string(),
                    owner: existing.to_string(),
                });
            }
        }

        if force {
            if let Err(e) = self.unlock(db, owner, true, cancel).await {
                if e.is_cancelled() {
                    return Err(e);
                }
                warn!("Force unlock of {} before locking failed: {}", db, e);
            }
        }

        let lock = Lock::exclusive(db, owner, hostname);
        self.write_marker(&lock, intent, cancel).await?;
        info!("Locked {} for {}", db, lock);
        Ok(())
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn unlock(
        &self,
        db: &str,
        owner: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        if force {
            // Match on the decoded name so metacharacters and prefixed names
            // never select another database's markers.
            let held: Vec<Lock> = self
                .markers(cancel)
                .await?
                .into_iter()
                .filter(|lock| lock.db_name == db)
                .collect();
            for lock in &held {
                self.delete_marker(lock, cancel).await?;
            }
            info!("Force unlocked {} ({} marker(s) removed)", db, held.len());
            return Ok(());
        }

        let locks = self.list_locks(cancel).await?;
        let Some(existing) = locks.get(db) else {
            debug!("{} is not locked", db);
            return Ok(());
        };

        if existing.owner != owner {
            return Err(SyncError::NotOwner {
                db: db.to_string(),
                owner: existing.to_string(),
            });
        }

        self.delete_marker(existing, cancel).await?;
        info!("Unlocked {} held by {}", db, existing);
        Ok(())
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn list_locks(&self, cancel: &CancellationToken) -> SyncResult<LockTable> {
        let markers = self.markers(cancel).await?;
        let count = markers.len();

        let mut locks = LockTable::new();
        for lock in markers {
            match locks.get(&lock.db_name) {
                // First marker in name order wins.
                Some(kept) => warn!(
                    "{} has several lock markers, reporting {} and ignoring {}",
                    lock.db_name, kept, lock
                ),
                None => {
                    locks.insert(lock.db_name.clone(), lock);
                }
            }
        }

        debug!("Found {} lock(s) among {} marker(s)", locks.len(), count);
        Ok(locks)
    }
}
