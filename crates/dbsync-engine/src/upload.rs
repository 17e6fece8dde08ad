use std::path::Path;
use std::time::Instant;

use dbsync_core::{
    file_id, CancellationToken, Location, Metadata, ProgressSender, SyncError, SyncResult,
    TransferOptions, UploadStatus,
};
use tracing::{error, info, instrument, warn};

use crate::engine::{SyncEngine, UPLOAD_INTENT};

impl SyncEngine {
    /// Publish the local copy of `db`.
    ///
    /// Phases run strictly in order: lock, announce, transfer, anchor,
    /// unlock. Only lock and transfer failures are returned; a failed
    /// transfer records a cancelled event and releases the lock first.
    #[instrument(skip(self, progress, cancel), level = "debug")]
    pub async fn upload(
        &self,
        db: &str,
        force: bool,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        info!("[upload] phase 1/5: lock {}", db);
        self.lock(db, UPLOAD_INTENT, force, cancel).await?;
        let started = Instant::now();

        info!("[upload] phase 2/5: announce {}", db);
        let previous = match self.announce_upload(db, cancel).await {
            Ok(previous) => previous,
            Err(e) => {
                warn!("Failed to announce upload of {}: {}", db, e);
                None
            }
        };

        info!("[upload] phase 3/5: transfer {}", db);
        let published = match self.transfer_upload(db, started, progress, cancel).await {
            Ok(published) => published,
            Err(e) => {
                warn!("Upload of {} failed: {}", db, e);
                self.cleanup_failed_upload(db, previous.as_ref(), started).await;
                return Err(e);
            }
        };

        info!("[upload] phase 4/5: anchor {}", db);
        if let Err(e) = self.metadata.write_anchor(db, &published).await {
            warn!("Failed to write anchor for {}: {}", db, e);
        }

        info!("[upload] phase 5/5: unlock {}", db);
        if let Err(e) = self.unlock(db, true, &CancellationToken::new()).await {
            warn!(
                "Failed to release lock on {}, it must be force unlocked: {}",
                db, e
            );
        }

        info!(
            "Uploaded {} ({} bytes, {:.1}s)",
            db, published.size_bytes, published.upload_duration_sec
        );
        Ok(())
    }

    /// Mark `db` as being uploaded. Returns the record that was current before.
    async fn announce_upload(
        &self,
        db: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<Option<Metadata>> {
        let existing = self.metadata.read_remote(db, cancel).await?;

        let announced = match &existing {
            Some(current) => Metadata::new(
                file_id(db),
                &current.hash,
                current.size_bytes,
                &self.identity,
                0.0,
                UploadStatus::Uploading,
            ),
            None => {
                let size = local_size(&self.paths.db_path(db)).await.unwrap_or(0);
                Metadata::new(
                    file_id(db),
                    "",
                    size,
                    &self.identity,
                    0.0,
                    UploadStatus::Uploading,
                )
            }
        }
        .appended_to(existing.as_ref());

        self.metadata.write_remote(db, &announced, cancel).await?;
        Ok(existing)
    }

    /// Copy the payload, then publish the success record.
    async fn transfer_upload(
        &self,
        db: &str,
        started: Instant,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> SyncResult<Metadata> {
        let local_path = self.paths.db_path(db);
        let size = local_size(&local_path).await?;
        let hash = self.hasher.hash(&local_path).await?;

        self.remote
            .copy(
                &Location::local(&local_path),
                &Location::remote(""),
                TransferOptions::with_progress(progress),
                cancel,
            )
            .await?;

        let record = Metadata::new(
            file_id(db),
            &hash,
            size,
            &self.identity,
            started.elapsed().as_secs_f64(),
            UploadStatus::Success,
        );
        let published = self.metadata.append_event(db, record, cancel).await?;
        self.metadata.write_remote(db, &published, cancel).await?;
        Ok(published)
    }

    /// Record the aborted upload and release the lock.
    ///
    /// Runs on a fresh token: the caller's token has usually fired already.
    async fn cleanup_failed_upload(&self, db: &str, previous: Option<&Metadata>, started: Instant) {
        let cancel = CancellationToken::new();

        let (hash, size) = previous
            .map(|m| (m.hash.as_str(), m.size_bytes))
            .unwrap_or(("", 0));
        let record = Metadata::new(
            file_id(db),
            hash,
            size,
            &self.identity,
            started.elapsed().as_secs_f64(),
            UploadStatus::Cancelled,
        );
        let cancelled = match self.metadata.append_event(db, record.clone(), &cancel).await {
            Ok(cancelled) => cancelled,
            Err(e) => {
                warn!("Failed to read history of {}, recording cancellation alone: {}", db, e);
                record.appended_to(previous)
            }
        };
        if let Err(e) = self.metadata.write_remote(db, &cancelled, &cancel).await {
            warn!("Failed to record cancelled upload of {}: {}", db, e);
        }

        let token = &cancel;
        let released = self
            .unlock_retry
            .run_if(
                &format!("unlock {}", db),
                move |_| self.unlock(db, true, token),
                |e| !e.is_cancelled(),
            )
            .await;
        if let Err(e) = released {
            error!(
                "Failed to release lock on {} after {} attempts, manual unlock required: {}",
                db, self.unlock_retry.max_attempts, e
            );
        }
    }
}

async fn local_size(path: &Path) -> SyncResult<u64> {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SyncError::NotFound(path.display().to_string())
            } else {
                SyncError::Io(format!("Failed to stat {}: {}", path.display(), e))
            }
        })
}
