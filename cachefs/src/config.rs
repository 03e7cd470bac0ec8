//! Command line and environment configuration.
//!
//! Every option can come from a flag or an environment variable; a `.env`
//! file in the working directory is loaded first by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::cadapter::S3Config;
use crate::crypto::Cipher;

pub const DEFAULT_CACHE_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "cachefs", version)]
#[command(about = "Passthrough FUSE filesystem with an LFU content cache and object-store replication", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Mount point
    #[arg(short = 'm', long = "mount", env = "MOUNT_POINT", global = true)]
    pub mount_point: Option<PathBuf>,

    /// Backing storage directory
    #[arg(short = 's', long = "storage", env = "STORAGE_PATH", global = true)]
    pub storage: Option<PathBuf>,

    /// Directory holding cached copies
    #[arg(long, env = "CACHE_DIR", global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Cache capacity in bytes
    #[arg(long, env = "CACHE_SIZE", default_value_t = DEFAULT_CACHE_SIZE, global = true)]
    pub cache_size: u64,

    /// Files to load into the cache at mount time, by access count
    #[arg(long, env = "CACHE_PREWARM", default_value_t = 0, global = true)]
    pub prewarm: usize,

    /// SQLite URL of the metadata database
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,

    /// Replicate into this local directory
    #[arg(long, env = "REMOTE_DIR", global = true, conflicts_with = "s3_bucket")]
    pub remote_dir: Option<PathBuf>,

    /// Replicate into this S3 bucket
    #[arg(long, env = "S3_BUCKET", global = true)]
    pub s3_bucket: Option<String>,

    /// Custom S3 endpoint (MinIO, ...)
    #[arg(long, env = "S3_ENDPOINT", global = true)]
    pub s3_endpoint: Option<String>,

    #[arg(long, env = "S3_REGION", default_value = "us-east-1", global = true)]
    pub s3_region: String,

    /// Seconds between replication batches
    #[arg(long, env = "SYNC_INTERVAL", default_value_t = 300, global = true)]
    pub sync_interval: u64,

    /// Files per replication batch
    #[arg(long, env = "SYNC_BATCH", default_value_t = 10, global = true)]
    pub sync_batch: usize,

    /// Retries per object store request
    #[arg(long, env = "MAX_SYNC_RETRIES", default_value_t = 3, global = true)]
    pub max_sync_retries: u32,

    /// Encrypt replicated content
    #[arg(long, env = "ENCRYPTION_ENABLED", global = true)]
    pub encryption_enabled: bool,

    /// Passphrase the encryption key is derived from
    #[arg(long, env = "ENCRYPTION_KEY", hide_env_values = true, global = true)]
    pub encryption_key: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Do not start the replication worker
    #[arg(long, global = true)]
    pub no_sync: bool,

    /// Serve every read from the backing store
    #[arg(long, global = true)]
    pub no_cache: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Mount the filesystem and run until interrupted (default)
    Mount,
    /// Run one replication batch and exit
    Sync,
    /// Fetch one file back from the object store
    Download {
        #[arg(value_name = "PATH")]
        path: String,
        /// Object key; looked up in the metadata store when omitted
        #[arg(value_name = "REMOTE_ID")]
        remote_id: Option<String>,
    },
    /// Fetch every replicated file missing from the backing store
    Restore,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteTarget {
    Disabled,
    Local(PathBuf),
    S3 {
        bucket: String,
        endpoint: Option<String>,
        region: String,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub command: Command,
    pub mount_point: PathBuf,
    pub storage_path: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_size: u64,
    pub cache_enabled: bool,
    pub prewarm: usize,
    pub database_url: String,
    pub remote: RemoteTarget,
    pub sync_enabled: bool,
    pub sync_interval: Duration,
    pub sync_batch: usize,
    pub max_sync_retries: u32,
    pub encryption_enabled: bool,
    pub encryption_key: Option<String>,
    pub log_level: String,
    pub debug: bool,
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

/// `sqlite://` URL of the database kept next to the storage directory.
fn default_database_url(storage: &Path) -> String {
    let dir = storage.parent().unwrap_or(storage);
    format!("sqlite://{}", dir.join("cachefs-meta.db").display())
}

impl Config {
    /// Fill in defaults and reject inconsistent settings. All problems are
    /// reported at once.
    pub fn from_args(args: Args) -> anyhow::Result<Self> {
        let mut validation_errors = Vec::new();

        let storage_path = args
            .storage
            .unwrap_or_else(|| home_dir().join("fuse_storage"));
        let mount_point = args
            .mount_point
            .unwrap_or_else(|| home_dir().join("fuse_mount"));
        let cache_dir = args.cache_dir.unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| storage_path.join(".cache"))
                .join("cachefs")
        });

        if cache_dir.starts_with(&storage_path) {
            validation_errors.push(format!(
                "CACHE_DIR `{}` must not live inside STORAGE_PATH `{}`",
                cache_dir.display(),
                storage_path.display()
            ));
        }
        if mount_point == storage_path {
            validation_errors.push(format!(
                "MOUNT_POINT and STORAGE_PATH must differ (both `{}`)",
                mount_point.display()
            ));
        }
        if !args.no_cache && args.cache_size == 0 {
            validation_errors.push("CACHE_SIZE must be positive (or pass --no-cache)".to_string());
        }
        if args.sync_interval == 0 {
            validation_errors.push("SYNC_INTERVAL must be at least one second".to_string());
        }
        if args.encryption_enabled
            && args.encryption_key.as_deref().is_some_and(|k| k.is_empty())
        {
            validation_errors.push("ENCRYPTION_KEY is set but empty".to_string());
        }

        let remote = match (args.remote_dir, args.s3_bucket) {
            (Some(dir), _) => RemoteTarget::Local(dir),
            (None, Some(bucket)) => RemoteTarget::S3 {
                bucket,
                endpoint: args.s3_endpoint,
                region: args.s3_region,
            },
            (None, None) => RemoteTarget::Disabled,
        };

        let command = args.command.unwrap_or(Command::Mount);
        if command != Command::Mount && remote == RemoteTarget::Disabled {
            validation_errors.push(
                "this command needs an object store: set REMOTE_DIR or S3_BUCKET".to_string(),
            );
        }

        if !validation_errors.is_empty() {
            anyhow::bail!(validation_errors.join("\n"));
        }

        Ok(Self {
            database_url: args
                .database_url
                .unwrap_or_else(|| default_database_url(&storage_path)),
            command,
            mount_point,
            storage_path,
            cache_dir,
            cache_size: args.cache_size,
            cache_enabled: !args.no_cache,
            prewarm: args.prewarm,
            sync_enabled: !args.no_sync,
            remote,
            sync_interval: Duration::from_secs(args.sync_interval),
            sync_batch: args.sync_batch.max(1),
            max_sync_retries: args.max_sync_retries,
            encryption_enabled: args.encryption_enabled,
            encryption_key: args.encryption_key,
            log_level: args.log_level,
            debug: args.debug,
        })
    }

    /// Filter directive for tracing-subscriber.
    pub fn log_filter(&self) -> String {
        if self.debug {
            "debug".to_string()
        } else {
            self.log_level.to_lowercase()
        }
    }

    pub fn cipher(&self) -> Cipher {
        match (&self.encryption_enabled, &self.encryption_key) {
            (false, _) => Cipher::disabled(),
            (true, Some(key)) => Cipher::from_passphrase(key),
            (true, None) => {
                tracing::warn!(
                    "ENCRYPTION_KEY is not set, using a random key; replicated data will not be readable after restart"
                );
                Cipher::random()
            }
        }
    }

    pub fn s3_config(&self) -> Option<(String, S3Config)> {
        match &self.remote {
            RemoteTarget::S3 {
                bucket,
                endpoint,
                region,
            } => Some((
                bucket.clone(),
                S3Config {
                    max_retries: self.max_sync_retries,
                    region: region.clone(),
                    endpoint: endpoint.clone(),
                    ..S3Config::default()
                },
            )),
            _ => None,
        }
    }
}
