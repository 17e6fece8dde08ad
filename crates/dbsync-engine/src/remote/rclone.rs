use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use dbsync_core::{
    CancellationToken, Location, ProgressSender, RemoteStore, SyncError, SyncResult,
    TransferOptions, TransferProgress,
};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

/// rclone exit codes for a missing directory and a missing file.
const EXIT_DIR_NOT_FOUND: i32 = 3;
const EXIT_FILE_NOT_FOUND: i32 = 4;

const DEFAULT_RETRIES: u32 = 3;

/// Remote store backed by the `rclone` command line tool.
///
/// `root` is an rclone path such as `myremote:bucket/databases`.
#[derive(Debug, Clone)]
pub struct RcloneRemote {
    root: String,
    binary: PathBuf,
    retries: u32,
}

/// One line of `rclone --use-json-log` output.
#[derive(Debug, Deserialize)]
struct LogLine {
    #[serde(default)]
    level: String,
    #[serde(default)]
    msg: String,
    stats: Option<LogStats>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogStats {
    bytes: u64,
    #[serde(default)]
    total_bytes: u64,
}

/// Extract transfer progress from a JSON log line, if it carries stats.
pub fn parse_rclone_stats(line: &str) -> Option<TransferProgress> {
    let parsed: LogLine = serde_json::from_str(line.trim()).ok()?;
    parsed
        .stats
        .map(|s| TransferProgress::new(s.bytes, s.total_bytes))
}

struct RcloneOutput {
    status: ExitStatus,
    stdout: String,
    errors: Vec<String>,
}

impl RcloneRemote {
    /// Create a new RcloneRemote using `rclone` from `PATH`.
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            binary: PathBuf::from("rclone"),
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Passed through as `--retries`.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// rclone argument for a location.
    fn target(&self, location: &Location) -> String {
        match location {
            Location::Local(path) => path.display().to_string(),
            Location::Remote(key) if key.is_empty() => self.root.clone(),
            Location::Remote(key) => {
                if self.root.ends_with(':') || self.root.ends_with('/') {
                    format!("{}{}", self.root, key)
                } else {
                    format!("{}/{}", self.root, key)
                }
            }
        }
    }

    fn command(&self, args: &[String], with_stats: bool) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .arg("--use-json-log")
            .arg("--retries")
            .arg(self.retries.to_string());
        if with_stats {
            cmd.args(["--stats", "500ms", "--stats-log-level", "NOTICE"]);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run rclone to completion, forwarding stats to `progress`.
    async fn run(
        &self,
        args: Vec<String>,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> SyncResult<RcloneOutput> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        debug!("rclone {}", args.join(" "));
        let mut child = self
            .command(&args, progress.is_some())
            .spawn()
            .map_err(|e| {
                SyncError::Remote(format!(
                    "Failed to spawn {}: {}",
                    self.binary.display(),
                    e
                ))
            })?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SyncError::Internal("rclone stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SyncError::Internal("rclone stderr not captured".to_string()))?;
        let log_task = tokio::spawn(drain_log(stderr, progress));

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = async {
                let mut out = String::new();
                stdout
                    .read_to_string(&mut out)
                    .await
                    .map_err(|e| SyncError::Io(format!("Failed to read rclone output: {}", e)))?;
                let status = child
                    .wait()
                    .await
                    .map_err(|e| SyncError::Io(format!("Failed to wait for rclone: {}", e)))?;
                Ok::<_, SyncError>((status, out))
            } => Some(result),
        };

        let Some(result) = finished else {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill rclone: {}", e);
            }
            log_task.abort();
            return Err(SyncError::Cancelled);
        };

        let (status, stdout) = result?;
        let errors = log_task
            .await
            .map_err(|e| SyncError::Internal(format!("rclone log task failed: {}", e)))?;

        Ok(RcloneOutput {
            status,
            stdout,
            errors,
        })
    }

    /// Run and map a non-zero exit to an error naming `subject`.
    async fn run_checked(
        &self,
        args: Vec<String>,
        subject: &str,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> SyncResult<String> {
        let command = args.first().cloned().unwrap_or_default();
        let output = self.run(args, progress, cancel).await?;

        match output.status.code() {
            Some(0) => Ok(output.stdout),
            Some(EXIT_DIR_NOT_FOUND) | Some(EXIT_FILE_NOT_FOUND) => {
                Err(SyncError::NotFound(subject.to_string()))
            }
            code => {
                let detail = output
                    .errors
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "no error output".to_string());
                Err(SyncError::Remote(format!(
                    "rclone {} {} failed (exit {:?}): {}",
                    command, subject, code, detail
                )))
            }
        }
    }
}

/// Consume rclone's log stream, sending stats and collecting error messages.
async fn drain_log<R>(stream: R, progress: Option<ProgressSender>) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    let mut errors = Vec::new();

    while let Ok(Some(line)) = lines.next_line().await {
        match serde_json::from_str::<LogLine>(line.trim()) {
            Ok(entry) => {
                if let (Some(stats), Some(tx)) = (&entry.stats, &progress) {
                    let _ = tx.send(TransferProgress::new(stats.bytes, stats.total_bytes));
                } else if entry.level == "error" || entry.level == "critical" {
                    errors.push(entry.msg);
                }
            }
            Err(_) if !line.trim().is_empty() => errors.push(line),
            Err(_) => {}
        }
    }
    errors
}

#[async_trait]
impl RemoteStore for RcloneRemote {
    fn backend_name(&self) -> &'static str {
        "rclone"
    }

    #[instrument(skip(self, options, cancel), level = "debug")]
    async fn copy(
        &self,
        src: &Location,
        dst_dir: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let src = self.target(src);
        let mut args = vec!["copy".to_string(), src.clone(), self.target(dst_dir)];
        if let Some(include) = &options.include {
            args.extend(["--include".to_string(), include.clone()]);
        }
        self.run_checked(args, &src, options.progress.clone(), cancel)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, options, cancel), level = "debug")]
    async fn copy_to(
        &self,
        src: &Location,
        dst_file: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let src = self.target(src);
        let args = vec!["copyto".to_string(), src.clone(), self.target(dst_file)];
        self.run_checked(args, &src, options.progress.clone(), cancel)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, options, cancel), level = "debug")]
    async fn sync(
        &self,
        src_dir: &Location,
        dst_dir: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let src = self.target(src_dir);
        let mut args = vec!["sync".to_string(), src.clone(), self.target(dst_dir)];
        if let Some(include) = &options.include {
            args.extend(["--include".to_string(), include.clone()]);
        }
        self.run_checked(args, &src, options.progress.clone(), cancel)
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn delete_file(&self, path: &Location, cancel: &CancellationToken) -> SyncResult<()> {
        let target = self.target(path);
        let args = vec!["deletefile".to_string(), target.clone()];
        self.run_checked(args, &target, None, cancel).await.map(|_| ())
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn delete(
        &self,
        dir: &Location,
        include: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let target = self.target(dir);
        let args = vec![
            "delete".to_string(),
            target.clone(),
            "--include".to_string(),
            include.to_string(),
        ];
        match self.run_checked(args, &target, None, cancel).await {
            Ok(_) | Err(SyncError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn list(
        &self,
        dir: &Location,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<Vec<String>> {
        let target = self.target(dir);
        let mut args = vec!["lsf".to_string(), "--files-only".to_string(), target.clone()];
        if recursive {
            args.push("-R".to_string());
        }

        let stdout = match self.run_checked(args, &target, None, cancel).await {
            Ok(stdout) => stdout,
            Err(SyncError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }
}
