use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbsync_core::{
    CancellationToken, DatabaseStatus, Identity, Location, RemoteStore, RetryPolicy, StatusCode,
    SyncError, SyncResult, TransferOptions, UploadStatus,
};
use dbsync_engine::remote::FsRemote;
use dbsync_engine::{HashCache, SyncEngine, SyncPaths};
use tempfile::TempDir;

struct Operator {
    engine: SyncEngine,
    db_dir: PathBuf,
}

fn operator(root: &Path, remote: Arc<dyn RemoteStore>, owner: &str, host: &str) -> Operator {
    let db_dir = root.join(owner).join("dbs");
    std::fs::create_dir_all(&db_dir).unwrap();
    let paths = SyncPaths::new(&db_dir, root.join(owner).join("data"));
    let engine = SyncEngine::new(
        remote,
        Arc::new(HashCache::in_memory()),
        Identity::new(owner, host),
        paths,
    )
    .with_unlock_retry(RetryPolicy::fixed(3, Duration::ZERO));
    Operator { engine, db_dir }
}

/// Two operators sharing one directory-backed remote.
fn setup() -> (Operator, Operator, TempDir) {
    let temp = TempDir::new().unwrap();
    let remote: Arc<dyn RemoteStore> = Arc::new(FsRemote::new(temp.path().join("remote")));
    let alice = operator(temp.path(), Arc::clone(&remote), "alice", "h1");
    let bob = operator(temp.path(), remote, "bob", "h2");
    (alice, bob, temp)
}

fn status_of(statuses: &[DatabaseStatus], db: &str) -> StatusCode {
    statuses
        .iter()
        .find(|s| s.db == db)
        .map(|s| s.status)
        .unwrap_or_else(|| panic!("no status for {}", db))
}

async fn status(op: &Operator, db: &str) -> StatusCode {
    let statuses = op
        .engine
        .fetch_all_statuses(&CancellationToken::new())
        .await
        .unwrap();
    status_of(&statuses, db)
}

#[tokio::test]
async fn test_upload_publishes_payload_history_and_anchor() {
    let (alice, bob, temp) = setup();
    let cancel = CancellationToken::new();
    std::fs::write(alice.db_dir.join("x.db"), b"version one").unwrap();

    assert_eq!(status(&alice, "x.db").await, StatusCode::NewLocal);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    alice.engine.upload("x.db", false, Some(tx), &cancel).await.unwrap();

    assert_eq!(
        std::fs::read(temp.path().join("remote/x.db")).unwrap(),
        b"version one"
    );
    let mut last = None;
    while let Ok(p) = rx.try_recv() {
        last = Some(p);
    }
    assert!(last.unwrap().is_complete());

    let meta = alice.engine.metadata().read_remote("x.db", &cancel).await.unwrap().unwrap();
    let statuses: Vec<UploadStatus> = meta.events.iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![UploadStatus::Uploading, UploadStatus::Success]);
    assert_eq!(meta.status, UploadStatus::Success);
    assert_eq!(meta.uploader, "alice");

    let anchor = alice.engine.metadata().read_anchor("x.db").await.unwrap().unwrap();
    assert!(anchor.events.is_empty());
    assert_eq!(anchor.hash, meta.hash);

    assert!(alice.engine.list_locks(&cancel).await.unwrap().is_empty());
    assert_eq!(status(&alice, "x.db").await, StatusCode::UpToDate);
    assert_eq!(status(&bob, "x.db").await, StatusCode::RemoteOnly);
}

#[tokio::test]
async fn test_download_anchors_with_uploader_details() {
    let (alice, bob, _temp) = setup();
    let cancel = CancellationToken::new();
    std::fs::write(alice.db_dir.join("x.db"), b"shared").unwrap();
    alice.engine.upload("x.db", false, None, &cancel).await.unwrap();

    bob.engine.download("x.db", None, &cancel).await.unwrap();

    assert_eq!(std::fs::read(bob.db_dir.join("x.db")).unwrap(), b"shared");
    let anchor = bob.engine.metadata().read_anchor("x.db").await.unwrap().unwrap();
    assert!(anchor.events.is_empty());
    assert_eq!(anchor.uploader, "alice");
    assert_eq!(anchor.hostname, "h1");
    assert_eq!(status(&bob, "x.db").await, StatusCode::UpToDate);
}

#[tokio::test]
async fn test_remote_and_local_divergence() {
    let (alice, bob, _temp) = setup();
    let cancel = CancellationToken::new();
    std::fs::write(alice.db_dir.join("x.db"), b"v1").unwrap();
    alice.engine.upload("x.db", false, None, &cancel).await.unwrap();
    bob.engine.download("x.db", None, &cancel).await.unwrap();

    // Alice publishes a new version: Bob's anchor no longer matches.
    std::fs::write(alice.db_dir.join("x.db"), b"version two").unwrap();
    alice.engine.upload("x.db", false, None, &cancel).await.unwrap();
    assert_eq!(status(&bob, "x.db").await, StatusCode::RemoteNewer);

    // Alice edits again without uploading.
    std::fs::write(alice.db_dir.join("x.db"), b"version three, unpublished").unwrap();
    assert_eq!(status(&alice, "x.db").await, StatusCode::LocalNewer);
}

#[tokio::test]
async fn test_locks_block_other_operators() {
    let (alice, bob, _temp) = setup();
    let cancel = CancellationToken::new();
    std::fs::write(alice.db_dir.join("x.db"), b"data").unwrap();
    std::fs::write(bob.db_dir.join("x.db"), b"bob data").unwrap();
    alice.engine.upload("x.db", false, None, &cancel).await.unwrap();

    alice.engine.lock("x.db", "editing", false, &cancel).await.unwrap();
    assert_eq!(status(&alice, "x.db").await, StatusCode::LockedByYou);
    assert_eq!(status(&bob, "x.db").await, StatusCode::LockedByOther);

    let err = bob.engine.download("x.db", None, &cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::UploadInProgress { .. }));

    let err = bob.engine.upload("x.db", false, None, &cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::AlreadyLocked { .. }));

    let err = bob.engine.unlock("x.db", false, &cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::NotOwner { .. }));

    bob.engine.upload("x.db", true, None, &cancel).await.unwrap();
    assert!(bob.engine.list_locks(&cancel).await.unwrap().is_empty());
    assert_eq!(status(&bob, "x.db").await, StatusCode::UpToDate);
}

#[tokio::test]
async fn test_download_all() {
    let (alice, bob, _temp) = setup();
    let cancel = CancellationToken::new();
    for name in ["a.db", "b.db"] {
        std::fs::write(alice.db_dir.join(name), name.as_bytes()).unwrap();
        alice.engine.upload(name, false, None, &cancel).await.unwrap();
    }

    let mut anchored = bob.engine.download_all(None, &cancel).await.unwrap();
    anchored.sort();
    assert_eq!(anchored, vec!["a.db".to_string(), "b.db".to_string()]);

    let statuses = bob
        .engine
        .fetch_all_statuses(&cancel)
        .await
        .unwrap();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.status == StatusCode::UpToDate));
}

#[tokio::test]
async fn test_cancelled_status_query() {
    let (alice, _bob, _temp) = setup();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = alice.engine.fetch_all_statuses(&cancel).await.unwrap_err();
    assert!(err.is_cancelled());
}

/// How a faulty remote treats local to remote payload copies.
#[derive(Clone, Copy, PartialEq, Eq)]
enum UploadFault {
    None,
    Fail,
    HangUntilCancelled,
}

/// Directory remote with injectable failures.
struct FaultyRemote {
    inner: FsRemote,
    upload: UploadFault,
    fail_lock_deletes: bool,
    fail_list_of: Option<&'static str>,
    fail_sync_of: Option<&'static str>,
    lock_deletes: AtomicU32,
}

impl FaultyRemote {
    fn new(root: &Path) -> Self {
        Self {
            inner: FsRemote::new(root.join("remote")),
            upload: UploadFault::None,
            fail_lock_deletes: false,
            fail_list_of: None,
            fail_sync_of: None,
            lock_deletes: AtomicU32::new(0),
        }
    }
}

fn is_remote_key(location: &Location, key: &str) -> bool {
    matches!(location, Location::Remote(k) if k == key)
}

#[async_trait]
impl RemoteStore for FaultyRemote {
    fn backend_name(&self) -> &'static str {
        "faulty"
    }

    async fn copy(
        &self,
        src: &Location,
        dst_dir: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        if matches!(src, Location::Local(_)) {
            match self.upload {
                UploadFault::None => {}
                UploadFault::Fail => {
                    return Err(SyncError::Remote("connection reset".to_string()))
                }
                UploadFault::HangUntilCancelled => {
                    cancel.cancelled().await;
                    return Err(SyncError::Cancelled);
                }
            }
        }
        self.inner.copy(src, dst_dir, options, cancel).await
    }

    async fn copy_to(
        &self,
        src: &Location,
        dst_file: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        self.inner.copy_to(src, dst_file, options, cancel).await
    }

    async fn sync(
        &self,
        src_dir: &Location,
        dst_dir: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        if self.fail_sync_of.is_some_and(|key| is_remote_key(src_dir, key)) {
            return Err(SyncError::Remote("sync refused".to_string()));
        }
        self.inner.sync(src_dir, dst_dir, options, cancel).await
    }

    async fn delete_file(&self, path: &Location, cancel: &CancellationToken) -> SyncResult<()> {
        if let Location::Remote(key) = path {
            if key.starts_with("lock/") {
                self.lock_deletes.fetch_add(1, Ordering::SeqCst);
                if self.fail_lock_deletes {
                    return Err(SyncError::Remote("delete refused".to_string()));
                }
            }
        }
        self.inner.delete_file(path, cancel).await
    }

    async fn delete(
        &self,
        dir: &Location,
        include: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        self.inner.delete(dir, include, cancel).await
    }

    async fn list(
        &self,
        dir: &Location,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<Vec<String>> {
        if self.fail_list_of.is_some_and(|key| is_remote_key(dir, key)) {
            return Err(SyncError::Remote("listing refused".to_string()));
        }
        self.inner.list(dir, recursive, cancel).await
    }
}

#[tokio::test]
async fn test_failed_transfer_records_cancellation_and_retries_unlock() {
    let temp = TempDir::new().unwrap();
    let faulty = Arc::new(FaultyRemote {
        upload: UploadFault::Fail,
        fail_lock_deletes: true,
        ..FaultyRemote::new(temp.path())
    });
    let alice = operator(temp.path(), faulty.clone(), "alice", "h1");
    let cancel = CancellationToken::new();
    std::fs::write(alice.db_dir.join("x.db"), b"payload").unwrap();

    let err = alice.engine.upload("x.db", false, None, &cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::Remote(ref msg) if msg == "connection reset"));

    assert_eq!(faulty.lock_deletes.load(Ordering::SeqCst), 3);

    let meta = alice.engine.metadata().read_remote("x.db", &cancel).await.unwrap().unwrap();
    assert_eq!(meta.status, UploadStatus::Cancelled);
    let latest = meta.latest_event().unwrap();
    assert_eq!(latest.status, UploadStatus::Cancelled);
    assert_eq!(latest.sequence_id, meta.events.len() as u64);

    // The failed release leaves the marker for a manual unlock.
    assert!(alice
        .engine
        .list_locks(&cancel)
        .await
        .unwrap()
        .contains_key("x.db"));
    assert!(alice.engine.metadata().read_anchor("x.db").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancelled_upload_cleans_up_on_fresh_token() {
    let temp = TempDir::new().unwrap();
    let faulty = Arc::new(FaultyRemote {
        upload: UploadFault::HangUntilCancelled,
        ..FaultyRemote::new(temp.path())
    });
    let alice = operator(temp.path(), faulty, "alice", "h1");
    std::fs::write(alice.db_dir.join("x.db"), b"payload").unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = alice.engine.upload("x.db", false, None, &cancel).await.unwrap_err();
    assert!(err.is_cancelled());

    let fresh = CancellationToken::new();
    assert!(alice.engine.list_locks(&fresh).await.unwrap().is_empty());
    let meta = alice.engine.metadata().read_remote("x.db", &fresh).await.unwrap().unwrap();
    assert_eq!(meta.status, UploadStatus::Cancelled);
    let statuses: Vec<UploadStatus> = meta.events.iter().map(|e| e.status).collect();
    assert_eq!(statuses, vec![UploadStatus::Uploading, UploadStatus::Cancelled]);
    assert!(alice.engine.metadata().read_anchor("x.db").await.unwrap().is_none());
}

async fn status_query_with(
    faulty: FaultyRemote,
    temp: &TempDir,
) -> SyncResult<Vec<DatabaseStatus>> {
    let alice = operator(temp.path(), Arc::new(faulty), "alice", "h1");
    std::fs::write(alice.db_dir.join("x.db"), b"data").unwrap();
    alice.engine.fetch_all_statuses(&CancellationToken::new()).await
}

#[tokio::test]
async fn test_status_fails_when_locks_cannot_be_listed() {
    let temp = TempDir::new().unwrap();
    let faulty = FaultyRemote {
        fail_list_of: Some("lock"),
        ..FaultyRemote::new(temp.path())
    };
    let err = status_query_with(faulty, &temp).await.unwrap_err();
    assert!(matches!(err, SyncError::Remote(ref msg) if msg == "listing refused"));
}

#[tokio::test]
async fn test_status_fails_when_remote_cannot_be_listed() {
    let temp = TempDir::new().unwrap();
    let faulty = FaultyRemote {
        fail_list_of: Some(""),
        ..FaultyRemote::new(temp.path())
    };
    let err = status_query_with(faulty, &temp).await.unwrap_err();
    assert!(matches!(err, SyncError::Remote(ref msg) if msg == "listing refused"));
}

#[tokio::test]
async fn test_status_fails_when_metadata_cannot_be_mirrored() {
    let temp = TempDir::new().unwrap();
    let faulty = FaultyRemote {
        fail_sync_of: Some("version"),
        ..FaultyRemote::new(temp.path())
    };
    let err = status_query_with(faulty, &temp).await.unwrap_err();
    assert!(matches!(err, SyncError::Remote(ref msg) if msg == "sync refused"));
}

#[tokio::test]
async fn test_unreadable_anchors_degrade_status() {
    let (alice, _bob, _temp) = setup();
    let cancel = CancellationToken::new();
    std::fs::write(alice.db_dir.join("x.db"), b"data").unwrap();
    alice.engine.upload("x.db", false, None, &cancel).await.unwrap();

    // A plain file where the anchor directory should be cannot be listed.
    let anchor_dir = alice.engine.paths().anchor_dir.clone();
    std::fs::remove_dir_all(&anchor_dir).unwrap();
    std::fs::write(&anchor_dir, b"not a directory").unwrap();

    let statuses = alice.engine.fetch_all_statuses(&cancel).await.unwrap();
    assert_eq!(status_of(&statuses, "x.db"), StatusCode::UpToDate);
}

#[tokio::test]
async fn test_download_without_metadata_anchors_at_current_time() {
    let (_alice, bob, temp) = setup();
    let cancel = CancellationToken::new();
    let remote_dir = temp.path().join("remote");
    std::fs::create_dir_all(&remote_dir).unwrap();
    std::fs::write(remote_dir.join("x.db"), b"untracked").unwrap();

    let before = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    bob.engine.download("x.db", None, &cancel).await.unwrap();

    assert_eq!(std::fs::read(bob.db_dir.join("x.db")).unwrap(), b"untracked");
    let anchor = bob.engine.metadata().read_anchor("x.db").await.unwrap().unwrap();
    assert!(anchor.events.is_empty());
    assert_eq!(anchor.uploader, "bob");
    assert_eq!(anchor.hostname, "h2");
    assert_eq!(anchor.size_bytes, b"untracked".len() as u64);
    assert!(anchor.timestamp >= before);
}
