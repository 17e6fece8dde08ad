use std::io;
use std::path::Path;
use std::sync::Arc;

use dbsync_core::{
    file_id, metadata_file_name, CancellationToken, Location, Metadata, MetadataMap, RemoteStore,
    SyncError, SyncResult, TransferOptions, METADATA_SUFFIX, VERSION_DIR,
};
use tokio::fs;
use tracing::{debug, instrument, warn};

use crate::paths::SyncPaths;

/// Reads and writes remote metadata documents and local anchors.
///
/// Remote documents are always staged through the local mirror directory so
/// the mirror stays a 1:1 copy of what was last seen remotely.
pub struct MetadataStore {
    remote: Arc<dyn RemoteStore>,
    paths: SyncPaths,
}

impl MetadataStore {
    /// Create a new MetadataStore.
    pub fn new(remote: Arc<dyn RemoteStore>, paths: SyncPaths) -> Self {
        Self { remote, paths }
    }

    pub fn paths(&self) -> &SyncPaths {
        &self.paths
    }

    fn remote_location(db: &str) -> Location {
        Location::remote_join(&[VERSION_DIR, &metadata_file_name(file_id(db))])
    }

    /// Fetch the remote document for `db`; a missing document is `None`.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn read_remote(
        &self,
        db: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<Option<Metadata>> {
        let mirror = self.paths.mirror_path(file_id(db));
        match self
            .remote
            .copy_to(
                &Self::remote_location(db),
                &Location::local(&mirror),
                TransferOptions::default(),
                cancel,
            )
            .await
        {
            Ok(()) => read_document(&mirror).await,
            Err(SyncError::NotFound(_)) => {
                debug!("No remote metadata for {}", db);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Mirror the remote version directory, then parse every document.
    ///
    /// Mirroring failures are returned: a status computed against a stale
    /// mirror cannot be trusted.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn read_all_remote(&self, cancel: &CancellationToken) -> SyncResult<MetadataMap> {
        create_dir(&self.paths.mirror_dir).await?;

        match self
            .remote
            .sync(
                &Location::remote(VERSION_DIR),
                &Location::local(&self.paths.mirror_dir),
                TransferOptions::default(),
                cancel,
            )
            .await
        {
            Ok(()) => {}
            Err(SyncError::NotFound(_)) => {
                debug!("Remote has no {} directory yet", VERSION_DIR);
                return Ok(MetadataMap::new());
            }
            Err(e) => return Err(e),
        }

        read_document_dir(&self.paths.mirror_dir).await
    }

    /// Mirrored document for `db`, if present locally.
    pub async fn read_mirrored(&self, db: &str) -> SyncResult<Option<Metadata>> {
        read_document(&self.paths.mirror_path(file_id(db))).await
    }

    /// Write `meta` to the mirror, then upload it.
    #[instrument(skip(self, meta, cancel), level = "debug")]
    pub async fn write_remote(
        &self,
        db: &str,
        meta: &Metadata,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let mirror = self.paths.mirror_path(file_id(db));
        write_document(&mirror, meta).await?;
        self.remote
            .copy_to(
                &Location::local(&mirror),
                &Self::remote_location(db),
                TransferOptions::default(),
                cancel,
            )
            .await?;
        debug!(
            "Published metadata for {} (status {}, {} event(s))",
            db,
            meta.status,
            meta.events.len()
        );
        Ok(())
    }

    /// Attach `new_meta` as the next event of the remote history.
    ///
    /// The caller is responsible for writing the returned record.
    pub async fn append_event(
        &self,
        db: &str,
        new_meta: Metadata,
        cancel: &CancellationToken,
    ) -> SyncResult<Metadata> {
        let existing = self.read_remote(db, cancel).await?;
        Ok(new_meta.appended_to(existing.as_ref()))
    }

    /// Local anchor for `db`, if one was recorded.
    pub async fn read_anchor(&self, db: &str) -> SyncResult<Option<Metadata>> {
        read_document(&self.paths.anchor_path(file_id(db))).await
    }

    /// Persist the anchor for `db`. History is always stripped.
    #[instrument(skip(self, meta), level = "debug")]
    pub async fn write_anchor(&self, db: &str, meta: &Metadata) -> SyncResult<()> {
        let anchor = meta.to_anchor();
        write_document(&self.paths.anchor_path(file_id(db)), &anchor).await?;
        debug!("Anchored {} at {}", db, anchor.hash);
        Ok(())
    }

    /// Every local anchor, keyed by file ID.
    pub async fn read_all_anchors(&self) -> SyncResult<MetadataMap> {
        read_document_dir(&self.paths.anchor_dir).await
    }
}

async fn create_dir(dir: &Path) -> SyncResult<()> {
    fs::create_dir_all(dir)
        .await
        .map_err(|e| SyncError::Io(format!("Failed to create dir {}: {}", dir.display(), e)))
}

async fn read_document(path: &Path) -> SyncResult<Option<Metadata>> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SyncError::Io(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    let meta = serde_json::from_slice(&data).map_err(|e| {
        SyncError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
    })?;
    Ok(Some(meta))
}

/// Parse every `*.metadata.json` in `dir`. Unparseable documents are skipped.
async fn read_document_dir(dir: &Path) -> SyncResult<MetadataMap> {
    let mut documents = MetadataMap::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(documents),
        Err(e) => {
            return Err(SyncError::Io(format!(
                "Failed to read dir {}: {}",
                dir.display(),
                e
            )))
        }
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SyncError::Io(format!("Failed to read dir entry: {}", e)))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(fid) = name.strip_suffix(METADATA_SUFFIX) else {
            continue;
        };

        match read_document(&entry.path()).await {
            Ok(Some(meta)) => {
                documents.insert(fid.to_string(), meta);
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping metadata {}: {}", entry.path().display(), e),
        }
    }

    Ok(documents)
}

async fn write_document(path: &Path, meta: &Metadata) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent).await?;
    }

    let json = serde_json::to_vec_pretty(meta)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, json).await.map_err(|e| {
        SyncError::Io(format!(
            "Failed to write temp file {}: {}",
            temp_path.display(),
            e
        ))
    })?;
    fs::rename(&temp_path, path).await.map_err(|e| {
        SyncError::Io(format!(
            "Failed to rename temp file to {}: {}",
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::FsRemote;
    use dbsync_core::{Identity, UploadStatus};
    use tempfile::TempDir;

    fn setup() -> (MetadataStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let remote = Arc::new(FsRemote::new(temp.path().join("remote")));
        let paths = SyncPaths::new(temp.path().join("dbs"), temp.path().join("data"));
        (MetadataStore::new(remote, paths), temp)
    }

    fn record(hash: &str, status: UploadStatus) -> Metadata {
        Metadata::new("x", hash, 10, &Identity::new("alice", "h1"), 0.5, status)
    }

    #[tokio::test]
    async fn test_read_remote_absent() {
        let (store, _temp) = setup();
        let cancel = CancellationToken::new();
        assert!(store.read_remote("x.db", &cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_then_read_remote() {
        let (store, temp) = setup();
        let cancel = CancellationToken::new();
        let meta = record("abc", UploadStatus::Success).appended_to(None);

        store.write_remote("x.db", &meta, &cancel).await.unwrap();

        assert!(temp.path().join("remote/version/x.metadata.json").exists());
        let read = store.read_remote("x.db", &cancel).await.unwrap().unwrap();
        assert_eq!(read, meta);
    }

    #[tokio::test]
    async fn test_event_sequence_after_appends() {
        let (store, _temp) = setup();
        let cancel = CancellationToken::new();

        for i in 0..4 {
            let next = store
                .append_event("x.db", record(&format!("h{}", i), UploadStatus::Success), &cancel)
                .await
                .unwrap();
            store.write_remote("x.db", &next, &cancel).await.unwrap();
        }

        let meta = store.read_remote("x.db", &cancel).await.unwrap().unwrap();
        let ids: Vec<u64> = meta.events.iter().map(|e| e.sequence_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(meta.latest_event().unwrap().hash, meta.hash);
    }

    #[tokio::test]
    async fn test_anchor_never_has_events() {
        let (store, _temp) = setup();
        let with_history = record("abc", UploadStatus::Success)
            .appended_to(Some(&record("old", UploadStatus::Success).appended_to(None)));
        assert_eq!(with_history.events.len(), 2);

        store.write_anchor("x.db", &with_history).await.unwrap();

        let anchor = store.read_anchor("x.db").await.unwrap().unwrap();
        assert!(anchor.events.is_empty());
        assert_eq!(anchor.hash, "abc");
    }

    #[tokio::test]
    async fn test_read_all_remote_mirrors_and_keys_by_file_id() {
        let (store, temp) = setup();
        let cancel = CancellationToken::new();
        store
            .write_remote("a.db", &record("1", UploadStatus::Success), &cancel)
            .await
            .unwrap();
        store
            .write_remote("b.db", &record("2", UploadStatus::Uploading), &cancel)
            .await
            .unwrap();

        // A document that vanished remotely must vanish from the mirror.
        std::fs::remove_file(temp.path().join("remote/version/b.metadata.json")).unwrap();

        let all = store.read_all_remote(&cancel).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all["a"].hash, "1");
        assert!(!store.paths().mirror_path("b").exists());
    }

    #[tokio::test]
    async fn test_read_all_remote_without_version_dir() {
        let (store, _temp) = setup();
        let cancel = CancellationToken::new();
        assert!(store.read_all_remote(&cancel).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_anchor_is_skipped_in_bulk_read() {
        let (store, _temp) = setup();
        store
            .write_anchor("a.db", &record("1", UploadStatus::Success))
            .await
            .unwrap();
        std::fs::write(store.paths().anchor_path("b"), b"{oops").unwrap();

        let anchors = store.read_all_anchors().await.unwrap();
        assert_eq!(anchors.len(), 1);
        assert!(anchors.contains_key("a"));
        assert!(matches!(
            store.read_anchor("b.db").await,
            Err(SyncError::Serialization(_))
        ));
    }
}
