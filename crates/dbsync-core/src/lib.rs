//! Core traits and types for the dbsync engine.
//!
//! This crate defines the abstractions shared by every remote backend and workflow:
//! - `RemoteStore`: list/copy/sync/delete against the object store
//! - `LockManager`: advisory per-database locks encoded in marker names
//! - `Metadata`: versioned upload records and their event history
//! - `StatusCode`: the computed sync state of a database
//! - `RetryPolicy`: bounded retries for compensating actions

pub mod cancel;
mod database;
mod error;
mod identity;
mod lock;
mod metadata;
mod remote;
mod retry;
mod status;

pub use cancel::{run_cancellable, CancellationToken};
pub use database::{file_id, is_database_name, DbRecord, DB_EXTENSION};
pub use error::{SyncError, SyncResult};
pub use identity::Identity;
pub use lock::{Lock, LockKind, LockManager, LockTable, LOCK_SUFFIX};
pub use metadata::{
    format_datetime, metadata_file_name, Metadata, MetadataEvent, MetadataMap, UploadStatus,
    METADATA_SUFFIX,
};
pub use remote::{
    Location, ProgressSender, RemoteStore, TransferOptions, TransferProgress, LOCK_DIR,
    VERSION_DIR,
};
pub use retry::{Backoff, RetryPolicy};
pub use status::{DatabaseStatus, StatusCode};
