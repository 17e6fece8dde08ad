use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cancel::CancellationToken;
use crate::error::SyncResult;

/// Remote directory holding lock markers.
pub const LOCK_DIR: &str = "lock";

/// Remote directory holding versioned metadata documents.
pub const VERSION_DIR: &str = "version";

/// Either side of a transfer.
///
/// Remote keys are `/`-separated and relative to the store root; the empty
/// key is the root itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Local(PathBuf),
    Remote(String),
}

impl Location {
    pub fn local(path: impl AsRef<Path>) -> Self {
        Location::Local(path.as_ref().to_path_buf())
    }

    pub fn remote(key: impl Into<String>) -> Self {
        Location::Remote(key.into())
    }

    /// Remote key built from path segments, skipping empty ones.
    pub fn remote_join(segments: &[&str]) -> Self {
        let key = segments
            .iter()
            .map(|s| s.trim_matches('/'))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Location::Remote(key)
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote(_))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local(path) => write!(f, "{}", path.display()),
            Location::Remote(key) => write!(f, "remote:{}", key),
        }
    }
}

/// Snapshot of a running transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub bytes: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    pub fn new(bytes: u64, total_bytes: u64) -> Self {
        Self { bytes, total_bytes }
    }

    /// Completion in percent, 0 when the total is not yet known.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.bytes >= self.total_bytes
    }
}

/// Channel on which transfers publish progress.
pub type ProgressSender = mpsc::UnboundedSender<TransferProgress>;

/// Per-transfer options.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// Only transfer names matching this glob.
    pub include: Option<String>,
    /// Receives progress snapshots while the transfer runs.
    pub progress: Option<ProgressSender>,
}

impl TransferOptions {
    pub fn with_progress(progress: Option<ProgressSender>) -> Self {
        Self {
            include: None,
            progress,
        }
    }

    pub fn include(mut self, glob: impl Into<String>) -> Self {
        self.include = Some(glob.into());
        self
    }

    /// Publish a snapshot, ignoring a receiver that went away.
    pub fn report(&self, progress: TransferProgress) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(progress);
        }
    }
}

/// Object store reachable through a transfer tool or SDK.
///
/// Every call accepts a cancellation token and must return
/// `SyncError::Cancelled` promptly once it fires.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Returns the backend identifier (e.g., "fs", "rclone", "s3").
    fn backend_name(&self) -> &'static str;

    /// Copy a file or the contents of a directory into directory `dst_dir`.
    async fn copy(
        &self,
        src: &Location,
        dst_dir: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()>;

    /// Copy a single file to exactly `dst_file`.
    ///
    /// Fails with `NotFound` when `src` does not exist.
    async fn copy_to(
        &self,
        src: &Location,
        dst_file: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()>;

    /// Make `dst_dir` an exact mirror of `src_dir`.
    async fn sync(
        &self,
        src_dir: &Location,
        dst_dir: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()>;

    /// Delete one remote object.
    async fn delete_file(&self, path: &Location, cancel: &CancellationToken) -> SyncResult<()>;

    /// Delete every object directly in `dir` whose name matches `include`.
    async fn delete(
        &self,
        dir: &Location,
        include: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<()>;

    /// Names of the objects in `dir`, relative to it.
    ///
    /// A missing directory lists as empty.
    async fn list(
        &self,
        dir: &Location,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_join() {
        assert_eq!(
            Location::remote_join(&["", "lock", "x.db.a.h.lock"]),
            Location::Remote("lock/x.db.a.h.lock".to_string())
        );
        assert_eq!(
            Location::remote_join(&["/version/", "x.metadata.json"]),
            Location::Remote("version/x.metadata.json".to_string())
        );
        assert_eq!(Location::remote_join(&[""]), Location::Remote(String::new()));
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(TransferProgress::new(0, 0).percent(), 0.0);
        assert_eq!(TransferProgress::new(50, 200).percent(), 25.0);
        assert!(TransferProgress::new(200, 200).is_complete());
        assert!(!TransferProgress::new(10, 0).is_complete());
    }

    #[test]
    fn test_report_without_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        TransferOptions::with_progress(Some(tx)).report(TransferProgress::new(1, 2));
        TransferOptions::default().report(TransferProgress::new(1, 2));
    }
}
