use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::SyncResult;

/// Kind segment of an exclusive lock marker.
pub const LOCK_SUFFIX: &str = "lock";

/// Marker kind encoded in the last segment of a marker name.
///
/// Only exclusive locks carry meaning today. Anything else is parsed into
/// `Unknown` and ignored by readers, so new marker kinds can be introduced
/// without breaking older clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    Exclusive,
    Unknown(String),
}

impl LockKind {
    pub fn parse(segment: &str) -> Self {
        if segment == LOCK_SUFFIX {
            LockKind::Exclusive
        } else {
            LockKind::Unknown(segment.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            LockKind::Exclusive => LOCK_SUFFIX,
            LockKind::Unknown(kind) => kind,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockKind::Exclusive)
    }
}

/// An advisory lock marker decoded from its remote object name.
///
/// Wire format: `{db_name}.{owner}.{hostname}.{kind}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub db_name: String,
    pub owner: String,
    pub hostname: String,
    pub kind: LockKind,
}

impl Lock {
    /// Create an exclusive lock for `db_name`.
    pub fn exclusive(db_name: &str, owner: &str, hostname: &str) -> Self {
        Self {
            db_name: db_name.to_string(),
            owner: owner.to_string(),
            hostname: hostname.to_string(),
            kind: LockKind::Exclusive,
        }
    }

    /// Decode a marker object name.
    ///
    /// The last three `.`-separated segments are owner, hostname and kind;
    /// everything before them is the database name. Returns `None` when the
    /// name has too few segments.
    pub fn parse(object_name: &str) -> Option<Self> {
        let mut segments = object_name.rsplitn(4, '.');
        let kind = segments.next()?;
        let hostname = segments.next()?;
        let owner = segments.next()?;
        let db_name = segments.next()?;

        if db_name.is_empty() || owner.is_empty() || hostname.is_empty() || kind.is_empty() {
            return None;
        }

        Some(Self {
            db_name: db_name.to_string(),
            owner: owner.to_string(),
            hostname: hostname.to_string(),
            kind: LockKind::parse(kind),
        })
    }

    /// Encode the marker object name.
    pub fn object_name(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.db_name,
            self.owner,
            self.hostname,
            self.kind.as_str()
        )
    }

    /// True when this lock was taken by `owner` on `hostname`.
    pub fn is_held_by(&self, owner: &str, hostname: &str) -> bool {
        self.owner == owner && self.hostname == hostname
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.owner, self.hostname)
    }
}

/// Current locks keyed by database name.
pub type LockTable = HashMap<String, Lock>;

/// Advisory, per-database mutual exclusion between cooperating operators.
///
/// Implementations hold no in-process state: the remote marker namespace is
/// the single source of truth.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire the exclusive lock on `db`.
    ///
    /// Fails with `AlreadyLocked` when another owner holds it and `force` is
    /// false. With `force`, existing markers are cleared first.
    async fn lock(
        &self,
        db: &str,
        owner: &str,
        hostname: &str,
        intent: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<()>;

    /// Release the lock on `db`.
    ///
    /// Without `force`, only the owner may release it and a missing lock is
    /// success. With `force`, every marker of `db` is removed.
    async fn unlock(
        &self,
        db: &str,
        owner: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<()>;

    /// List the exclusive locks currently held.
    async fn list_locks(&self, cancel: &CancellationToken) -> SyncResult<LockTable>;
}
