use std::path::Path;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use dbsync_core::{
    run_cancellable, CancellationToken, Location, RemoteStore, SyncError, SyncResult,
    TransferOptions, TransferProgress,
};
use tracing::{debug, instrument};

use super::{include_matcher, included, key_file_name};

/// Remote store backed by an S3-compatible bucket.
///
/// Remote keys are resolved under `prefix` inside `bucket`.
#[derive(Debug, Clone)]
pub struct S3Remote {
    client: S3Client,
    bucket: String,
    prefix: String,
}

/// One object seen by a listing: name relative to the listed directory.
struct Entry {
    name: String,
    size: u64,
}

impl S3Remote {
    /// Create a new S3Remote from an existing client.
    pub fn new(client: S3Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Build a client from the ambient AWS configuration.
    ///
    /// `endpoint` switches to path-style addressing for S3-compatible stores.
    pub async fn from_env(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        endpoint: Option<String>,
        region: Option<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self::new(S3Client::from_conf(builder.build()), bucket, prefix)
    }

    fn key(&self, key: &str) -> String {
        let key = key.trim_matches('/');
        match (self.prefix.is_empty(), key.is_empty()) {
            (true, _) => key.to_string(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, key),
        }
    }

    fn dir_prefix(&self, key: &str) -> String {
        let full = self.key(key);
        if full.is_empty() {
            full
        } else {
            format!("{}/", full)
        }
    }

    /// Objects under a remote directory, paginated.
    async fn list_entries(&self, key: &str, recursive: bool) -> SyncResult<Vec<Entry>> {
        let prefix = self.dir_prefix(key);
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix);

            if !recursive {
                request = request.delimiter("/");
            }
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| SyncError::Remote(format!("S3 list_objects error: {}", e)))?;

            for object in output.contents() {
                let Some(full_key) = object.key() else {
                    continue;
                };
                let name = full_key.strip_prefix(&prefix).unwrap_or(full_key);
                if !name.is_empty() {
                    entries.push(Entry {
                        name: name.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Files directly in a local or remote directory, filtered.
    async fn dir_entries(&self, dir: &Location, include: Option<&str>) -> SyncResult<Vec<Entry>> {
        let matcher = include_matcher(include)?;
        let entries = match dir {
            Location::Remote(key) => self.list_entries(key, false).await?,
            Location::Local(path) => local_entries(path).await?,
        };
        Ok(entries
            .into_iter()
            .filter(|e| included(&matcher, &e.name))
            .collect())
    }

    async fn object_exists(&self, key: &str) -> SyncResult<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(key))
            .send()
            .await
        {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(SyncError::Remote(format!("S3 head_object error: {}", service_error)))
                }
            }
        }
    }

    /// Fail with `NotFound` when a non-root remote key has no object under it.
    ///
    /// Object stores have no directories, so a missing file and an empty
    /// directory look alike until something is listed beneath the key.
    async fn ensure_remote_dir(&self, dir: &Location) -> SyncResult<()> {
        let Location::Remote(key) = dir else {
            return Ok(());
        };
        if !key.is_empty() && self.list_entries(key, true).await?.is_empty() {
            return Err(SyncError::NotFound(self.key(key)));
        }
        Ok(())
    }

    /// Move one file between any two locations.
    async fn transfer(&self, src: &Location, dst: &Location) -> SyncResult<u64> {
        match (src, dst) {
            (Location::Local(from), Location::Remote(to)) => {
                let size = tokio::fs::metadata(from)
                    .await
                    .map_err(|e| local_error(from, e))?
                    .len();
                let body = ByteStream::from_path(from).await.map_err(|e| {
                    SyncError::Io(format!("Failed to read {}: {}", from.display(), e))
                })?;
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(self.key(to))
                    .body(body)
                    .send()
                    .await
                    .map_err(|e| SyncError::Remote(format!("S3 put_object error: {}", e)))?;
                Ok(size)
            }
            (Location::Remote(from), Location::Local(to)) => {
                let output = match self
                    .client
                    .get_object()
                    .bucket(&self.bucket)
                    .key(self.key(from))
                    .send()
                    .await
                {
                    Ok(output) => output,
                    Err(e) => {
                        let service_error = e.into_service_error();
                        return Err(if service_error.is_no_such_key() {
                            SyncError::NotFound(self.key(from))
                        } else {
                            SyncError::Remote(format!("S3 get_object error: {}", service_error))
                        });
                    }
                };
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| {
                        SyncError::Remote(format!("Failed to read S3 object body: {}", e))
                    })?
                    .into_bytes();
                write_local(to, &bytes).await?;
                Ok(bytes.len() as u64)
            }
            (Location::Remote(from), Location::Remote(to)) => {
                let Some(size) = self.object_exists(from).await? else {
                    return Err(SyncError::NotFound(self.key(from)));
                };
                self.client
                    .copy_object()
                    .bucket(&self.bucket)
                    .copy_source(format!("{}/{}", self.bucket, self.key(from)))
                    .key(self.key(to))
                    .send()
                    .await
                    .map_err(|e| SyncError::Remote(format!("S3 copy_object error: {}", e)))?;
                Ok(size)
            }
            (Location::Local(from), Location::Local(to)) => {
                if let Some(parent) = to.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| local_error(parent, e))?;
                }
                tokio::fs::copy(from, to).await.map_err(|e| local_error(from, e))
            }
        }
    }

    async fn remove(&self, location: &Location) -> SyncResult<()> {
        match location {
            Location::Remote(key) => {
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(self.key(key))
                    .send()
                    .await
                    .map_err(|e| SyncError::Remote(format!("S3 delete_object error: {}", e)))?;
                Ok(())
            }
            Location::Local(path) => tokio::fs::remove_file(path)
                .await
                .map_err(|e| local_error(path, e)),
        }
    }

    async fn transfer_all(
        &self,
        names: &[Entry],
        src_dir: &Location,
        dst_dir: &Location,
        options: &TransferOptions,
    ) -> SyncResult<()> {
        let total: u64 = names.iter().map(|e| e.size).sum();
        let mut done = 0;
        options.report(TransferProgress::new(0, total));

        for entry in names {
            done += self
                .transfer(&child(src_dir, &entry.name), &child(dst_dir, &entry.name))
                .await?;
            options.report(TransferProgress::new(done, total));
        }
        Ok(())
    }
}

/// `name` inside a local or remote directory.
fn child(dir: &Location, name: &str) -> Location {
    match dir {
        Location::Local(path) => Location::Local(path.join(name)),
        Location::Remote(key) => Location::remote_join(&[key, name]),
    }
}

fn file_name_of(location: &Location) -> String {
    match location {
        Location::Local(path) => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        Location::Remote(key) => key_file_name(key).to_string(),
    }
}

async fn local_entries(dir: &Path) -> SyncResult<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| local_error(dir, e))?;
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| SyncError::Io(format!("Failed to read dir entry: {}", e)))?
    {
        let metadata = entry
            .metadata()
            .await
            .map_err(|e| SyncError::Io(format!("Failed to get metadata: {}", e)))?;
        if metadata.is_file() {
            entries.push(Entry {
                name: entry.file_name().to_string_lossy().into_owned(),
                size: metadata.len(),
            });
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

async fn write_local(path: &Path, bytes: &[u8]) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| local_error(parent, e))?;
    }
    let temp_path = path.with_extension("partial");
    tokio::fs::write(&temp_path, bytes)
        .await
        .map_err(|e| local_error(&temp_path, e))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .map_err(|e| SyncError::Io(format!("Failed to rename to {}: {}", path.display(), e)))
}

fn local_error(path: &Path, e: std::io::Error) -> SyncError {
    if e.kind() == std::io::ErrorKind::NotFound {
        SyncError::NotFound(path.display().to_string())
    } else {
        SyncError::Io(format!("{}: {}", path.display(), e))
    }
}

#[async_trait]
impl RemoteStore for S3Remote {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    #[instrument(skip(self, options, cancel), level = "debug")]
    async fn copy(
        &self,
        src: &Location,
        dst_dir: &Location,
        options: TransferOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        run_cancellable(cancel, async {
            let is_file = match src {
                Location::Local(path) => tokio::fs::metadata(path)
                    .await
                    .map_err(|e| local_error(path, e))?
                    .is_file(),
                Location::Remote(key) => {
                    !key.is_empty() && self.object_exists(key).await?.is_some()
                }
            };

            if !is_file {
                self.ensure_remote_dir(src).await?;
            }

            if is_file {
                let name = file_name_of(src);
                let size = self.transfer(src, &child(dst_dir, &name)).await?;
                options.report(TransferProgress::new(size, size));
            } else {
                let entries = self.dir_entries(src, options.include.as_deref()).await?;
                self.transfer_all(&entries, src, dst_dir, &options).await?;
                debug!("Copied {} object(s) from {} to {}", entries.len(), src, dst_dir);
            }
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
        run_cancellable(cancel, async {
            let size = self.transfer(src, dst_file).await?;
            options.report(TransferProgress::new(size, size));
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
        run_cancellable(cancel, async {
            let source = self.dir_entries(src_dir, options.include.as_deref()).await?;
            self.transfer_all(&source, src_dir, dst_dir, &options).await?;

            let existing = match self.dir_entries(dst_dir, options.include.as_deref()).await {
                Ok(existing) => existing,
                Err(SyncError::NotFound(_)) => Vec::new(),
                Err(e) => return Err(e),
            };
            for stale in existing
                .iter()
                .filter(|e| !source.iter().any(|s| s.name == e.name))
            {
                self.remove(&child(dst_dir, &stale.name)).await?;
            }

            debug!("Synced {} object(s) from {} to {}", source.len(), src_dir, dst_dir);
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn delete_file(&self, path: &Location, cancel: &CancellationToken) -> SyncResult<()> {
        run_cancellable(cancel, self.remove(path)).await
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn delete(
        &self,
        dir: &Location,
        include: &str,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        run_cancellable(cancel, async {
            let entries = match self.dir_entries(dir, Some(include)).await {
                Ok(entries) => entries,
                Err(SyncError::NotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            for entry in &entries {
                self.remove(&child(dir, &entry.name)).await?;
            }
            debug!("Deleted {} object(s) matching {} in {}", entries.len(), include, dir);
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
        let Location::Remote(key) = dir else {
            return Err(SyncError::InvalidArgument(format!(
                "S3 listing needs a remote location, got {}",
                dir
            )));
        };
        run_cancellable(cancel, async {
            let entries = self.list_entries(key, recursive).await?;
            Ok(entries.into_iter().map(|e| e.name).collect())
        })
        .await
    }
}
