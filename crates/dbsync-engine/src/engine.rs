use std::sync::Arc;

use dbsync_core::{
    CancellationToken, Identity, LockManager, LockTable, RemoteStore, RetryPolicy, SyncResult,
};
use tracing::instrument;

use crate::hasher::HashCache;
use crate::lock::RemoteLockManager;
use crate::metadata::MetadataStore;
use crate::paths::SyncPaths;
use crate::status::StatusEngine;

/// Intent recorded in lock markers taken by the upload workflow.
pub const UPLOAD_INTENT: &str = "upload-flow";

/// Entry point tying the sync services together.
///
/// Every collaborator is injected at construction; nothing is global. The
/// hash cache outlives the engine and is closed by its owner.
pub struct SyncEngine {
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) metadata: Arc<MetadataStore>,
    pub(crate) hasher: Arc<HashCache>,
    pub(crate) status: StatusEngine,
    pub(crate) identity: Identity,
    pub(crate) paths: SyncPaths,
    pub(crate) unlock_retry: RetryPolicy,
}

impl SyncEngine {
    /// Create a new SyncEngine keeping locks and metadata in `remote`.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        hasher: Arc<HashCache>,
        identity: Identity,
        paths: SyncPaths,
    ) -> Self {
        let locks: Arc<dyn LockManager> = Arc::new(RemoteLockManager::new(Arc::clone(&remote)));
        let metadata = Arc::new(MetadataStore::new(Arc::clone(&remote), paths.clone()));
        let status = StatusEngine::new(
            Arc::clone(&hasher),
            Arc::clone(&metadata),
            identity.clone(),
        );

        Self {
            remote,
            locks,
            metadata,
            hasher,
            status,
            identity,
            paths,
            unlock_retry: RetryPolicy::unlock(),
        }
    }

    /// Replace the lock manager.
    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    /// Replace the policy used to release locks after a failed upload.
    pub fn with_unlock_retry(mut self, policy: RetryPolicy) -> Self {
        self.unlock_retry = policy;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn paths(&self) -> &SyncPaths {
        &self.paths
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn list_locks(&self, cancel: &CancellationToken) -> SyncResult<LockTable> {
        self.locks.list_locks(cancel).await
    }

    /// Take the lock on `db` as this engine's identity.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn lock(
        &self,
        db: &str,
        intent: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        self.locks
            .lock(
                db,
                &self.identity.owner,
                &self.identity.hostname,
                intent,
                force,
                cancel,
            )
            .await
    }

    /// Release the lock on `db` as this engine's identity.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn unlock(
        &self,
        db: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        self.locks
            .unlock(db, &self.identity.owner, force, cancel)
            .await
    }
}
