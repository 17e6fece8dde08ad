use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dbsync_core::{
    run_cancellable, CancellationToken, Location, RemoteStore, SyncError, SyncResult,
    TransferOptions, TransferProgress,
};
use tokio::fs;
use tracing::{debug, instrument};

use super::{include_matcher, included};

/// Remote store rooted at a directory (network share, mounted bucket, tests).
///
/// Layout under the root:
/// ```text
/// {root}/
///   {db}.db
///   lock/{db}.{owner}.{hostname}.lock
///   version/{file_id}.metadata.json
/// ```
#[derive(Debug, Clone)]
pub struct FsRemote {
    root: PathBuf,
}

impl FsRemote {
    /// Create a new FsRemote rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, location: &Location) -> PathBuf {
        match location {
            Location::Local(path) => path.clone(),
            Location::Remote(key) if key.is_empty() => self.root.clone(),
            Location::Remote(key) => self.root.join(key),
        }
    }

    /// Files directly inside `dir` passing the include filter, with sizes.
    async fn dir_files(dir: &Path, include: Option<&str>) -> SyncResult<Vec<(PathBuf, u64)>> {
        let matcher = include_matcher(include)?;
        let mut files = Vec::new();
        let mut entries = fs::read_dir(dir).await.map_err(|e| io_error(dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::Io(format!("Failed to read dir entry: {}", e)))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|e| SyncError::Io(format!("Failed to get metadata: {}", e)))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if metadata.is_file() && included(&matcher, &name) {
                files.push((entry.path(), metadata.len()));
            }
        }

        files.sort();
        Ok(files)
    }

    /// Copy via a temp file next to the target so readers never see a partial file.
    async fn copy_file(src: &Path, dst: &Path) -> SyncResult<u64> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).await.map_err(|e| io_error(parent, e))?;
        }

        let file_name = dst
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = dst.with_file_name(format!(".{}.partial", file_name));

        let copied = fs::copy(src, &temp_path).await.map_err(|e| io_error(src, e))?;
        fs::rename(&temp_path, dst).await.map_err(|e| {
            SyncError::Io(format!("Failed to rename to {}: {}", dst.display(), e))
        })?;
        Ok(copied)
    }

    async fn copy_files(
        files: &[(PathBuf, u64)],
        dst_dir: &Path,
        options: &TransferOptions,
    ) -> SyncResult<()> {
        let total: u64 = files.iter().map(|(_, size)| size).sum();
        let mut done = 0;
        options.report(TransferProgress::new(0, total));

        for (path, _) in files {
            let Some(name) = path.file_name() else {
                continue;
            };
            done += Self::copy_file(path, &dst_dir.join(name)).await?;
            options.report(TransferProgress::new(done, total));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FsRemote {
    fn backend_name(&self) -> &'static str {
        "fs"
    }

    #[instrument(skip(self, options, cancel), level = "debug")]
    async fn copy(
        &self,
        src: &Location,
        dst_dir: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let src_path = self.resolve(src);
        let dst_path = self.resolve(dst_dir);

        run_cancellable(cancel, async {
            let metadata = fs::metadata(&src_path)
                .await
                .map_err(|e| io_error(&src_path, e))?;

            let files = if metadata.is_dir() {
                Self::dir_files(&src_path, options.include.as_deref()).await?
            } else {
                vec![(src_path.clone(), metadata.len())]
            };

            Self::copy_files(&files, &dst_path, &options).await?;
            debug!(
                "Copied {} file(s) from {} to {}",
                files.len(),
                src_path.display(),
                dst_path.display()
            );
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, options, cancel), level = "debug")]
    async fn copy_to(
        &self,
        src: &Location,
        dst_file: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let src_path = self.resolve(src);
        let dst_path = self.resolve(dst_file);

        run_cancellable(cancel, async {
            let size = Self::copy_file(&src_path, &dst_path).await?;
            options.report(TransferProgress::new(size, size));
            debug!("Copied {} to {}", src_path.display(), dst_path.display());
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, options, cancel), level = "debug")]
    async fn sync(
        &self,
        src_dir: &Location,
        dst_dir: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let src_path = self.resolve(src_dir);
        let dst_path = self.resolve(dst_dir);

        run_cancellable(cancel, async {
            let files = Self::dir_files(&src_path, options.include.as_deref()).await?;
            fs::create_dir_all(&dst_path)
                .await
                .map_err(|e| io_error(&dst_path, e))?;
            Self::copy_files(&files, &dst_path, &options).await?;

            // Remove anything the source no longer has.
            let keep: Vec<_> = files.iter().filter_map(|(p, _)| p.file_name()).collect();
            let mut removed = 0;
            for (path, _) in Self::dir_files(&dst_path, options.include.as_deref()).await? {
                let stale = path.file_name().is_some_and(|n| !keep.contains(&n));
                if stale {
                    fs::remove_file(&path).await.map_err(|e| io_error(&path, e))?;
                    removed += 1;
                }
            }

            debug!(
                "Synced {} file(s) from {} to {} ({} removed)",
                files.len(),
                src_path.display(),
                dst_path.display(),
                removed
            );
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn delete_file(&self, path: &Location, cancel: &CancellationToken) -> SyncResult<()> {
        let target = self.resolve(path);
        run_cancellable(cancel, async {
            fs::remove_file(&target)
                .await
                .map_err(|e| io_error(&target, e))?;
            debug!("Deleted {}", target.display());
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn delete(
        &self,
        dir: &Location,
        include: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let dir_path = self.resolve(dir);
        run_cancellable(cancel, async {
            let files = match Self::dir_files(&dir_path, Some(include)).await {
                Ok(files) => files,
                Err(SyncError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            for (path, _) in &files {
                fs::remove_file(path).await.map_err(|e| io_error(path, e))?;
            }
            debug!(
                "Deleted {} file(s) matching {} in {}",
                files.len(),
                include,
                dir_path.display()
            );
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn list(
        &self,
        dir: &Location,
        recursive: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<Vec<String>> {
        let dir_path = self.resolve(dir);
        run_cancellable(cancel, async {
            let mut names = Vec::new();
            let mut pending = vec![(dir_path.clone(), String::new())];

            while let Some((current, prefix)) = pending.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(io_error(&current, e)),
                };

                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| SyncError::Io(format!("Failed to read dir entry: {}", e)))?
                {
                    let name = format!("{}{}", prefix, entry.file_name().to_string_lossy());
                    let file_type = entry
                        .file_type()
                        .await
                        .map_err(|e| SyncError::Io(format!("Failed to get file type: {}", e)))?;

                    if file_type.is_dir() {
                        if recursive {
                            pending.push((entry.path(), format!("{}/", name)));
                        }
                    } else if !is_partial(&name) {
                        names.push(name);
                    }
                }
            }

            names.sort();
            Ok(names)
        })
        .await
    }
}

fn is_partial(name: &str) -> bool {
    super::key_file_name(name).ends_with(".partial")
}

fn io_error(path: &Path, e: io::Error) -> SyncError {
    if e.kind() == io::ErrorKind::NotFound {
        SyncError::NotFound(path.display().to_string())
    } else {
        SyncError::Io(format!("{}: {}", path.display(), e))
    }
}
