use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cachefs::cadapter::{LocalFsBackend, ObjectBackend, S3Backend};
use cachefs::config::{Args, Command, Config, RemoteTarget};
use cachefs::daemon::SyncWorker;
use cachefs::fuse::CacheFuse;
use cachefs::fuse::mount::mount_unprivileged;
use cachefs::meta::{MetaStore, SqliteMetaStore};
use cachefs::sync::{self, ObjectReplicator, Replicator};
use cachefs::vfs::cache::FrequencyCache;
use cachefs::vfs::fs::CacheFs;
use cachefs::vfs::path::PathTranslator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_args(Args::parse())?;

    let filter = if config.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_filter()))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tokio::fs::create_dir_all(&config.storage_path)
        .await
        .with_context(|| format!("creating storage dir {}", config.storage_path.display()))?;

    let meta: Arc<dyn MetaStore> = Arc::new(
        SqliteMetaStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening metadata database {}", config.database_url))?,
    );

    match config.command.clone() {
        Command::Mount => mount(config, meta).await,
        Command::Sync => {
            let replicator = build_replicator(&config).await?;
            let worker = SyncWorker::new(meta, replicator, config.sync_interval)
                .with_batch(config.sync_batch);
            let report = worker.run_once(&CancellationToken::new()).await?;
            info!(?report, "sync batch finished");
            Ok(())
        }
        Command::Download { path, remote_id } => {
            let replicator = build_replicator(&config).await?;
            let remote_id = match remote_id {
                Some(id) => id,
                None => sync::lookup_remote_id(meta.as_ref(), &path).await?,
            };
            let bytes = replicator.download(&path, &remote_id).await?;
            info!(%path, %remote_id, bytes, "downloaded");
            Ok(())
        }
        Command::Restore => {
            let replicator = build_replicator(&config).await?;
            let translator = PathTranslator::new(&config.storage_path);
            let restored = sync::restore_missing(meta.as_ref(), replicator.as_ref(), |path| {
                !translator.resolve(path).exists()
            })
            .await?;
            info!(restored, "restore finished");
            Ok(())
        }
    }
}

async fn mount(config: Config, meta: Arc<dyn MetaStore>) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.mount_point)
        .await
        .with_context(|| format!("creating mount point {}", config.mount_point.display()))?;

    let translator = PathTranslator::new(&config.storage_path);
    let cache = if config.cache_enabled {
        Some(
            FrequencyCache::new(&config.cache_dir, config.cache_size)
                .await
                .with_context(|| format!("preparing cache dir {}", config.cache_dir.display()))?,
        )
    } else {
        info!("content cache disabled");
        None
    };

    let mut fs = CacheFs::new(translator, cache, meta.clone());
    if config.prewarm > 0 {
        let admitted = fs.prewarm(config.prewarm).await;
        info!(admitted, "cache prewarmed from access history");
    }

    let token = CancellationToken::new();
    let worker = start_worker(&config, meta, &token).await;

    info!(
        mount_point = %config.mount_point.display(),
        storage = %config.storage_path.display(),
        "mounting cachefs"
    );
    let handle = match mount_unprivileged(CacheFuse::new(fs), &config.mount_point).await {
        Ok(handle) => handle,
        Err(e) => {
            token.cancel();
            if let Some(worker) = worker {
                let _ = worker.await;
            }
            return Err(e).context("mount failed (is fusermount3 available?)");
        }
    };

    shutdown_signal().await;
    info!("unmounting");
    token.cancel();
    if let Err(e) = handle.unmount().await {
        error!(error = %e, "unmount failed");
    }
    if let Some(worker) = worker {
        if let Err(e) = worker.await {
            error!(error = %e, "sync worker panicked");
        }
    }
    Ok(())
}

/// Spawn the replication worker if it is enabled and the object store can be
/// reached. A failing store is logged and the mount continues without sync.
async fn start_worker(
    config: &Config,
    meta: Arc<dyn MetaStore>,
    token: &CancellationToken,
) -> Option<JoinHandle<()>> {
    if !config.sync_enabled {
        info!("sync disabled by --no-sync");
        return None;
    }
    if config.remote == RemoteTarget::Disabled {
        info!("no REMOTE_DIR or S3_BUCKET configured, sync disabled");
        return None;
    }
    match build_replicator(config).await {
        Ok(replicator) => Some(
            SyncWorker::new(meta, replicator, config.sync_interval)
                .with_batch(config.sync_batch)
                .spawn(token.child_token()),
        ),
        Err(e) => {
            error!(error = %e, "cannot initialise object store, continuing without sync");
            None
        }
    }
}

async fn build_replicator(config: &Config) -> anyhow::Result<Arc<dyn Replicator>> {
    let backend: Arc<dyn ObjectBackend> = match &config.remote {
        RemoteTarget::Local(dir) => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating remote dir {}", dir.display()))?;
            Arc::new(LocalFsBackend::new(dir))
        }
        RemoteTarget::S3 { .. } => {
            let Some((bucket, s3)) = config.s3_config() else {
                anyhow::bail!("S3 target without bucket");
            };
            Arc::new(
                S3Backend::new(bucket, s3)
                    .await
                    .map_err(|e| anyhow::anyhow!("S3 client: {e}"))?,
            )
        }
        RemoteTarget::Disabled => anyhow::bail!("no object store configured"),
    };
    if config.encryption_enabled {
        info!("replicated content is encrypted");
    } else {
        warn!("replicated content is stored in plaintext");
    }
    Ok(Arc::new(ObjectReplicator::new(
        PathTranslator::new(&config.storage_path),
        backend,
        config.cipher(),
    )))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
