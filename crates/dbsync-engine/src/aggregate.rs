use std::collections::BTreeMap;
use std::io;
use std::time::UNIX_EPOCH;

use dbsync_core::{
    is_database_name, run_cancellable, CancellationToken, DatabaseStatus, DbRecord, Location,
    MetadataMap, SyncError, SyncResult,
};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::engine::SyncEngine;

/// A database payload found in the local directory.
struct LocalDb {
    name: String,
    modified: Option<i64>,
}

impl SyncEngine {
    /// Status of every database known locally or remotely, sorted by name.
    ///
    /// The five reads run concurrently. Local, remote, lock and metadata
    /// failures abort the whole report; unreadable anchors only degrade it.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn fetch_all_statuses(
        &self,
        cancel: &CancellationToken,
    ) -> SyncResult<Vec<DatabaseStatus>> {
        let (local, remote, locks, remote_metas, anchors) = run_cancellable(cancel, async {
            let (local, remote, locks, remote_metas, anchors) = tokio::join!(
                self.list_local_databases(),
                self.list_remote_databases(cancel),
                self.locks.list_locks(cancel),
                self.metadata.read_all_remote(cancel),
                self.metadata.read_all_anchors(),
            );

            let anchors = anchors.unwrap_or_else(|e| {
                warn!("Failed to read local anchors, status will be degraded: {}", e);
                MetadataMap::new()
            });
            Ok::<_, SyncError>((local?, remote?, locks?, remote_metas?, anchors))
        })
        .await?;

        let mut records: BTreeMap<String, DbRecord> = BTreeMap::new();
        for db in local {
            let record = records
                .entry(db.name.clone())
                .or_insert_with(|| DbRecord::new(db.name));
            record.exists_local = true;
            record.local_modified = db.modified;
        }
        for name in remote {
            records
                .entry(name.clone())
                .or_insert_with(|| DbRecord::new(name))
                .exists_remote = true;
        }

        debug!(
            "Computing status for {} database(s), {} lock(s), {} remote record(s), {} anchor(s)",
            records.len(),
            locks.len(),
            remote_metas.len(),
            anchors.len()
        );

        let (locks, remote_metas, anchors) = (&locks, &remote_metas, &anchors);
        let statuses = join_all(records.values().map(|record| async move {
            let (status, message) = self
                .status
                .calculate_status(record, locks, remote_metas, anchors)
                .await;
            DatabaseStatus {
                db: record.name.clone(),
                status,
                message,
            }
        }))
        .await;

        Ok(statuses)
    }

    async fn list_local_databases(&self) -> SyncResult<Vec<LocalDb>> {
        let dir = &self.paths.db_dir;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SyncError::Io(format!(
                    "Failed to list {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut databases = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::Io(format!("Failed to read dir entry: {}", e)))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !is_database_name(&name) {
                continue;
            }
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| SyncError::Io(format!("Failed to stat {}: {}", name, e)))?;
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);
            databases.push(LocalDb { name, modified });
        }
        Ok(databases)
    }

    async fn list_remote_databases(&self, cancel: &CancellationToken) -> SyncResult<Vec<String>> {
        let names = self.remote.list(&Location::remote(""), false, cancel).await?;
        Ok(names.into_iter().filter(|n| is_database_name(n)).collect())
    }
}
