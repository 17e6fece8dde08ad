use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Configuration for the dbsync command line.
#[derive(Parser, Debug, Clone)]
#[command(name = "dbsync")]
#[command(about = "Lock, upload, download and reconcile shared database files")]
pub struct Config {
    /// Remote store backend
    #[arg(long, default_value = "fs", env = "DBSYNC_BACKEND", global = true)]
    pub backend: Backend,

    /// Remote root: a directory (fs) or an rclone path such as `remote:bucket/dbs`
    #[arg(long, env = "DBSYNC_REMOTE", global = true)]
    pub remote: Option<String>,

    /// Directory holding the local database files
    #[arg(long, default_value = ".", env = "DBSYNC_DB_DIR", global = true)]
    pub db_dir: PathBuf,

    /// Directory for the metadata mirror, anchors and hash cache
    #[arg(long, env = "DBSYNC_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Act as this owner instead of the current user
    #[arg(long, env = "DBSYNC_OWNER", global = true)]
    pub owner: Option<String>,

    /// rclone binary (rclone backend)
    #[arg(long, default_value = "rclone", env = "DBSYNC_RCLONE_BIN", global = true)]
    pub rclone_bin: PathBuf,

    /// Transfer retries passed to rclone (rclone backend)
    #[arg(long, default_value = "3", env = "DBSYNC_RCLONE_RETRIES", global = true)]
    pub rclone_retries: u32,

    /// Bucket name (s3 backend)
    #[arg(long, env = "DBSYNC_S3_BUCKET", global = true)]
    pub s3_bucket: Option<String>,

    /// Key prefix inside the bucket (s3 backend)
    #[arg(long, default_value = "", env = "DBSYNC_S3_PREFIX", global = true)]
    pub s3_prefix: String,

    /// Custom endpoint for S3-compatible stores (s3 backend)
    #[arg(long, env = "DBSYNC_S3_ENDPOINT", global = true)]
    pub s3_endpoint: Option<String>,

    /// Region (s3 backend)
    #[arg(long, env = "DBSYNC_S3_REGION", global = true)]
    pub s3_region: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the sync status of every database
    Status,
    /// Upload a local database
    Upload {
        db: String,
        /// Take over an existing lock
        #[arg(long)]
        force: bool,
    },
    /// Download a remote database
    Download { db: String },
    /// Download every remote database
    DownloadAll,
    /// List current locks
    Locks,
    /// Lock a database
    Lock {
        db: String,
        /// Take over an existing lock
        #[arg(long)]
        force: bool,
        /// Free-text intent stored in the marker
        #[arg(long, default_value = "manual")]
        intent: String,
    },
    /// Release a lock
    Unlock {
        db: String,
        /// Remove every marker regardless of owner
        #[arg(long)]
        force: bool,
    },
}

impl Config {
    /// Get the effective data directory.
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dbsync")
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    Fs,
    Rclone,
    S3,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Fs => write!(f, "fs"),
            Backend::Rclone => write!(f, "rclone"),
            Backend::S3 => write!(f, "s3"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload() {
        let config = Config::try_parse_from([
            "dbsync",
            "--remote",
            "/mnt/share",
            "upload",
            "x.db",
            "--force",
        ])
        .unwrap();
        assert_eq!(config.backend, Backend::Fs);
        assert!(matches!(config.command, Command::Upload { ref db, force: true } if db == "x.db"));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let config =
            Config::try_parse_from(["dbsync", "status", "--backend", "rclone", "--remote", "r:dbs"])
                .unwrap();
        assert_eq!(config.backend, Backend::Rclone);
        assert_eq!(config.remote.as_deref(), Some("r:dbs"));
    }

    #[test]
    fn test_explicit_data_dir() {
        let config =
            Config::try_parse_from(["dbsync", "--data-dir", "/var/dbsync", "locks"]).unwrap();
        assert_eq!(config.effective_data_dir(), PathBuf::from("/var/dbsync"));
    }
}
