use std::future::Future;

pub use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};

/// Run `operation` until it completes or `cancel` fires.
///
/// A fired token always wins: an operation that failed because its
/// underlying process or connection was torn down reports `Cancelled`
/// rather than the incidental error.
pub async fn run_cancellable<T, F>(cancel: &CancellationToken, operation: F) -> SyncResult<T>
where
    F: Future<Output = SyncResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = operation => match result {
            Err(_) if cancel.is_cancelled() => Err(SyncError::Cancelled),
            other => other,
        },
    }
}
