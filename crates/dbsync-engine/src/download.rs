use dbsync_core::{
    file_id, is_database_name, CancellationToken, Location, Metadata, ProgressSender, SyncError,
    SyncResult, TransferOptions, UploadStatus, DB_EXTENSION,
};
use tracing::{debug, info, instrument, warn};

use crate::engine::SyncEngine;

impl SyncEngine {
    /// Fetch the remote copy of `db` and anchor it.
    ///
    /// Refuses to run while `db` is exclusively locked: the remote payload
    /// may be half written.
    #[instrument(skip(self, progress, cancel), level = "debug")]
    pub async fn download(
        &self,
        db: &str,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        info!("[download] phase 1/3: safety check {}", db);
        let locks = self.locks.list_locks(cancel).await?;
        if let Some(lock) = locks.get(db).filter(|l| l.kind.is_exclusive()) {
            return Err(SyncError::UploadInProgress {
                db: db.to_string(),
                owner: lock.to_string(),
            });
        }

        info!("[download] phase 2/3: transfer {}", db);
        self.paths.ensure_dirs().await?;
        self.remote
            .copy(
                &Location::remote(db),
                &Location::local(&self.paths.db_dir),
                TransferOptions::with_progress(progress),
                cancel,
            )
            .await?;

        info!("[download] phase 3/3: anchor {}", db);
        self.anchor_download(db, cancel).await?;
        info!("Downloaded {}", db);
        Ok(())
    }

    /// Fetch every remote database in one transfer and anchor each of them.
    ///
    /// Returns the databases that were anchored.
    #[instrument(skip(self, progress, cancel), level = "debug")]
    pub async fn download_all(
        &self,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> SyncResult<Vec<String>> {
        let locks = self.locks.list_locks(cancel).await?;
        for (db, lock) in locks.iter().filter(|(_, l)| l.kind.is_exclusive()) {
            warn!("{} is locked by {}, its remote copy may be mid-upload", db, lock);
        }

        self.paths.ensure_dirs().await?;
        let remote_names: Vec<String> = self
            .remote
            .list(&Location::remote(""), false, cancel)
            .await?
            .into_iter()
            .filter(|n| is_database_name(n))
            .collect();

        info!("Downloading {} database(s)", remote_names.len());
        self.remote
            .copy(
                &Location::remote(""),
                &Location::local(&self.paths.db_dir),
                TransferOptions::with_progress(progress).include(format!("*.{}", DB_EXTENSION)),
                cancel,
            )
            .await?;

        let mirrored = self.metadata.read_all_remote(cancel).await?;
        debug!("Mirrored {} metadata record(s)", mirrored.len());

        let mut anchored = Vec::new();
        for db in remote_names {
            if !self.paths.db_path(&db).exists() {
                continue;
            }
            match self.anchor_download(&db, cancel).await {
                Ok(()) => anchored.push(db),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!("Failed to anchor {}: {}", db, e),
            }
        }

        info!("Downloaded and anchored {} database(s)", anchored.len());
        Ok(anchored)
    }

    /// Anchor a freshly downloaded file.
    ///
    /// The anchor carries the local hash and the uploader details of the
    /// remote record, never its history. Without any remote record the
    /// current time and identity are used.
    async fn anchor_download(&self, db: &str, cancel: &CancellationToken) -> SyncResult<()> {
        let local_path = self.paths.db_path(db);
        let hash = self.hasher.hash(&local_path).await?;
        let size = tokio::fs::metadata(&local_path)
            .await
            .map_err(|e| SyncError::Io(format!("Failed to stat {}: {}", local_path.display(), e)))?
            .len();

        let remote = match self.metadata.read_mirrored(db).await {
            Ok(Some(meta)) => Some(meta),
            Ok(None) | Err(_) => match self.metadata.read_remote(db, cancel).await {
                Ok(meta) => meta,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!("No remote metadata for {}, anchoring at current time: {}", db, e);
                    None
                }
            },
        };

        let mut anchor = Metadata::new(
            file_id(db),
            &hash,
            size,
            &self.identity,
            0.0,
            UploadStatus::Success,
        );
        if let Some(remote) = remote {
            anchor.timestamp = remote.timestamp;
            anchor.datetime = remote.datetime;
            anchor.uploader = remote.uploader;
            anchor.hostname = remote.hostname;
        }

        self.metadata.write_anchor(db, &anchor).await
    }
}
