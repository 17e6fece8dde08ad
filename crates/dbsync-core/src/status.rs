use std::fmt;

use serde::{Deserialize, Serialize};

/// Sync-state classification of one database at query time.
///
/// Always computed fresh, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    LockedByOther,
    LockedByYou,
    NewLocal,
    RemoteOnly,
    RemoteNewer,
    LocalNewer,
    UpToDate,
    ErrorReadLocal,
    Unknown,
}

impl StatusCode {
    pub fn label(&self) -> &'static str {
        match self {
            StatusCode::LockedByOther => "locked",
            StatusCode::LockedByYou => "locked by you",
            StatusCode::NewLocal => "new local",
            StatusCode::RemoteOnly => "remote only",
            StatusCode::RemoteNewer => "remote newer",
            StatusCode::LocalNewer => "local newer",
            StatusCode::UpToDate => "up to date",
            StatusCode::ErrorReadLocal => "read error",
            StatusCode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One row of a status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStatus {
    pub db: String,
    pub status: StatusCode,
    pub message: String,
}
