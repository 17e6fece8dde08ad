//! Synchronization engine for shared, file-based databases.
//!
//! Components, leaf first:
//! - `HashCache`: content digests memoized by path, mtime and size
//! - `remote`: `RemoteStore` backends (directory, rclone, S3)
//! - `RemoteLockManager`: advisory locks as marker objects
//! - `MetadataStore`: remote versioned records and local anchors
//! - `StatusEngine`: phased status computation
//! - `SyncEngine`: status aggregation and the upload/download workflows

mod aggregate;
mod download;
mod engine;
mod hasher;
mod lock;
mod metadata;
mod paths;
pub mod remote;
mod status;
mod upload;

pub use engine::{SyncEngine, UPLOAD_INTENT};
pub use hasher::{compute_digest, HashCache, HashCacheEntry};
pub use lock::RemoteLockManager;
pub use metadata::MetadataStore;
pub use paths::SyncPaths;
pub use status::StatusEngine;
