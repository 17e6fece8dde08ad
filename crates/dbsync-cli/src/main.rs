mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dbsync_core::{CancellationToken, Identity, ProgressSender, RemoteStore, TransferProgress};
use dbsync_engine::remote::{FsRemote, RcloneRemote};
use dbsync_engine::{HashCache, SyncEngine, SyncPaths};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::{Backend, Command, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let data_dir = config.effective_data_dir();

    info!("dbsync {}", env!("CARGO_PKG_VERSION"));
    info!("  Backend: {}", config.backend);
    info!("  Database dir: {}", config.db_dir.display());
    info!("  Data dir: {}", data_dir.display());

    let remote = build_remote(&config).await?;
    let identity = Identity::detect(config.owner.as_deref());
    info!("  Identity: {}", identity.display_name());

    let paths = SyncPaths::new(&config.db_dir, &data_dir);
    paths.ensure_dirs().await?;
    let hasher = Arc::new(HashCache::open(&paths.hash_cache_file));
    let engine = SyncEngine::new(remote, Arc::clone(&hasher), identity, paths);

    let cancel = create_shutdown_signal();
    let result = run(&engine, config.command, &cancel).await;

    if let Err(e) = hasher.close() {
        warn!("Failed to save hash cache: {}", e);
    }
    result
}

async fn build_remote(config: &Config) -> anyhow::Result<Arc<dyn RemoteStore>> {
    let remote: Arc<dyn RemoteStore> = match config.backend {
        Backend::Fs => {
            let root = config
                .remote
                .as_deref()
                .context("--remote is required for the fs backend")?;
            Arc::new(FsRemote::new(root))
        }
        Backend::Rclone => {
            let root = config
                .remote
                .clone()
                .context("--remote is required for the rclone backend")?;
            Arc::new(
                RcloneRemote::new(root)
                    .with_binary(&config.rclone_bin)
                    .with_retries(config.rclone_retries),
            )
        }
        #[cfg(feature = "cloud")]
        Backend::S3 => {
            let bucket = config
                .s3_bucket
                .clone()
                .context("--s3-bucket is required for the s3 backend")?;
            Arc::new(
                dbsync_engine::remote::S3Remote::from_env(
                    bucket,
                    config.s3_prefix.clone(),
                    config.s3_endpoint.clone(),
                    config.s3_region.clone(),
                )
                .await,
            )
        }
        #[cfg(not(feature = "cloud"))]
        Backend::S3 => {
            anyhow::bail!("The s3 backend requires building with the `cloud` feature.");
        }
    };
    Ok(remote)
}

async fn run(
    engine: &SyncEngine,
    command: Command,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Command::Status => {
            let statuses = engine.fetch_all_statuses(cancel).await?;
            if statuses.is_empty() {
                println!("No databases found");
            }
            for row in statuses {
                println!("{:<32} {:<14} {}", row.db, row.status.label(), row.message);
            }
        }
        Command::Upload { db, force } => {
            let (tx, logger) = progress_logger(format!("upload {}", db));
            let result = engine.upload(&db, force, Some(tx), cancel).await;
            let _ = logger.await;
            result?;
            println!("Uploaded {}", db);
        }
        Command::Download { db } => {
            let (tx, logger) = progress_logger(format!("download {}", db));
            let result = engine.download(&db, Some(tx), cancel).await;
            let _ = logger.await;
            result?;
            println!("Downloaded {}", db);
        }
        Command::DownloadAll => {
            let (tx, logger) = progress_logger("download all".to_string());
            let result = engine.download_all(Some(tx), cancel).await;
            let _ = logger.await;
            for db in result? {
                println!("Downloaded {}", db);
            }
        }
        Command::Locks => {
            let mut locks: Vec<_> = engine.list_locks(cancel).await?.into_values().collect();
            locks.sort_by(|a, b| a.db_name.cmp(&b.db_name));
            if locks.is_empty() {
                println!("No locks");
            }
            for lock in locks {
                println!("{:<32} {}", lock.db_name, lock);
            }
        }
        Command::Lock { db, force, intent } => {
            engine.lock(&db, &intent, force, cancel).await?;
            println!("Locked {}", db);
        }
        Command::Unlock { db, force } => {
            engine.unlock(&db, force, cancel).await?;
            println!("Unlocked {}", db);
        }
    }
    Ok(())
}

/// Log transfer progress at every 10% step.
///
/// The task ends once every sender has been dropped.
fn progress_logger(label: String) -> (ProgressSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<TransferProgress>();
    let handle = tokio::spawn(async move {
        let mut next_step = 10.0;
        while let Some(progress) = rx.recv().await {
            let percent = progress.percent();
            if percent >= next_step {
                info!(
                    "{}: {:.0}% ({} / {} bytes)",
                    label, percent, progress.bytes, progress.total_bytes
                );
                next_step = (percent / 10.0).floor() * 10.0 + 10.0;
            }
        }
    });
    (tx, handle)
}

/// Create a token cancelled on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, cancelling");
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, cancelling");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        trigger.cancel();
    });

    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_logger_ends_with_senders() {
        let (tx, logger) = progress_logger("upload x.db".to_string());
        for bytes in [0, 15, 50, 100] {
            tx.send(TransferProgress::new(bytes, 100)).unwrap();
        }
        drop(tx);
        logger.await.unwrap();
    }
}
