mod fs;
mod rclone;
#[cfg(feature = "cloud")]
mod s3;

pub use fs::FsRemote;
pub use rclone::{parse_rclone_stats, RcloneRemote};
#[cfg(feature = "cloud")]
pub use s3::S3Remote;

use dbsync_core::{SyncError, SyncResult};
use globset::{Glob, GlobMatcher};

/// Compile an optional include filter.
pub(crate) fn include_matcher(include: Option<&str>) -> SyncResult<Option<GlobMatcher>> {
    include
        .map(|pattern| {
            Glob::new(pattern)
                .map(|glob| glob.compile_matcher())
                .map_err(|e| SyncError::InvalidArgument(format!("Invalid glob {}: {}", pattern, e)))
        })
        .transpose()
}

/// True when `name` passes the optional filter.
pub(crate) fn included(matcher: &Option<GlobMatcher>, name: &str) -> bool {
    matcher.as_ref().is_none_or(|m| m.is_match(name))
}

/// Last `/`-separated segment of a remote key.
pub(crate) fn key_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
