use std::sync::Arc;

use dbsync_core::{DbRecord, Identity, Lock, LockTable, Metadata, MetadataMap, StatusCode};
use tracing::{debug, warn};

use crate::hasher::HashCache;
use crate::metadata::MetadataStore;

/// Computes one status per database from a consistent snapshot of locks,
/// remote metadata and local anchors.
///
/// Evaluation is phased and the first matching rule wins:
/// lock, existence, history, consistency. The only side effect is auto-heal,
/// which records a missing anchor once local content is proven identical to
/// the remote.
pub struct StatusEngine {
    hasher: Arc<HashCache>,
    metadata: Arc<MetadataStore>,
    identity: Identity,
}

impl StatusEngine {
    /// Create a new StatusEngine.
    pub fn new(hasher: Arc<HashCache>, metadata: Arc<MetadataStore>, identity: Identity) -> Self {
        Self {
            hasher,
            metadata,
            identity,
        }
    }

    pub async fn calculate_status(
        &self,
        db: &DbRecord,
        locks: &LockTable,
        remote_metas: &MetadataMap,
        anchors: &MetadataMap,
    ) -> (StatusCode, String) {
        let remote = remote_metas.get(db.file_id());
        let anchor = anchors.get(db.file_id());

        if let Some(lock) = locks.get(&db.name) {
            return self.lock_status(lock, remote);
        }

        if db.exists_local && !db.exists_remote {
            return (StatusCode::NewLocal, "not uploaded yet".to_string());
        }
        if db.exists_remote && !db.exists_local {
            return (StatusCode::RemoteOnly, "not downloaded yet".to_string());
        }

        if let (Some(anchor), Some(remote)) = (anchor, remote) {
            if anchor.hash != remote.hash {
                return (StatusCode::RemoteNewer, remote_newer_message(remote));
            }
        }

        if let (true, Some(remote)) = (db.exists_local, remote) {
            return self.consistency_status(db, remote, anchor).await;
        }

        (StatusCode::Unknown, "unable to determine status".to_string())
    }

    fn lock_status(&self, lock: &Lock, remote: Option<&Metadata>) -> (StatusCode, String) {
        let activity = remote.map(|m| m.status).filter(|s| s.is_active());

        if !lock.is_held_by(&self.identity.owner, &self.identity.hostname) {
            let message = match activity {
                Some(status) => format!("being {} by {}", activity_verb(status.as_str()), lock),
                None => format!("locked by {}", lock),
            };
            return (StatusCode::LockedByOther, message);
        }

        let message = match activity {
            Some(status) => format!("you are {} it", status),
            None => "locked by you".to_string(),
        };
        (StatusCode::LockedByYou, message)
    }

    async fn consistency_status(
        &self,
        db: &DbRecord,
        remote: &Metadata,
        anchor: Option<&Metadata>,
    ) -> (StatusCode, String) {
        let local_path = self.metadata.paths().db_path(&db.name);
        let local_hash = match self.hasher.hash(&local_path).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!("Cannot hash {}: {}", local_path.display(), e);
                return (StatusCode::ErrorReadLocal, format!("cannot read local file: {}", e));
            }
        };

        if local_hash == remote.hash {
            if anchor.is_none() {
                match self.metadata.write_anchor(&db.name, remote).await {
                    Ok(()) => debug!("Auto-healed missing anchor for {}", db.name),
                    Err(e) => warn!("Failed to auto-heal anchor for {}: {}", db.name, e),
                }
            }
            return (StatusCode::UpToDate, "up to date".to_string());
        }

        match anchor {
            None => (StatusCode::RemoteNewer, remote_newer_message(remote)),
            Some(_) => (StatusCode::LocalNewer, "local changes not uploaded".to_string()),
        }
    }
}

/// `uploading` -> `uploaded`, `updating` -> `updated`.
fn activity_verb(status: &str) -> String {
    match status.strip_suffix("ing") {
        Some(stem) => format!("{}ed", stem),
        None => status.to_string(),
    }
}

fn remote_newer_message(remote: &Metadata) -> String {
    format!(
        "remote has a newer version ({}@{}, {})",
        remote.uploader, remote.hostname, remote.datetime
    )
}
