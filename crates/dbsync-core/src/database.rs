use serde::{Deserialize, Serialize};

/// Extension carried by every managed database payload.
pub const DB_EXTENSION: &str = "db";

/// Strip the extension from a database name (`inventory.db` -> `inventory`).
///
/// Names without an extension are returned unchanged.
pub fn file_id(db_name: &str) -> &str {
    match db_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => db_name,
    }
}

/// True when `name` looks like a managed database payload.
pub fn is_database_name(name: &str) -> bool {
    name.strip_suffix(DB_EXTENSION)
        .and_then(|stem| stem.strip_suffix('.'))
        .is_some_and(|stem| !stem.is_empty())
}

/// A database as observed on one status query.
///
/// Existence is purely observational and refreshed on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbRecord {
    /// Database name including its extension.
    pub name: String,
    pub exists_local: bool,
    pub exists_remote: bool,
    /// Local modification time (Unix seconds), when the file exists locally.
    #[serde(default)]
    pub local_modified: Option<i64>,
}

impl DbRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists_local: false,
            exists_remote: false,
            local_modified: None,
        }
    }

    pub fn file_id(&self) -> &str {
        file_id(&self.name)
    }
}
