//! Metadata store
//!
//! Responsibilities:
//! - Persist file and directory attributes keyed by virtual path so that
//!   directory listings can include entries not (yet) on the backing store.
//! - Track which files changed since their last replication ("dirty") and a
//!   per-file version that the replication worker uses as a fencing token:
//!   a sync result only clears the dirty flag if no write bumped the version
//!   while the upload was in flight.
//! - Keep access and sync history rows for prewarming and diagnostics.
//!
//! Submodules:
//! - `memory`: in-memory implementation used by tests
//! - `sqlite`: SQLx/SQLite implementation
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::MetaResult;
use crate::vfs::attr::FileAttr;

pub use memory::InMemoryMetaStore;
pub use sqlite::SqliteMetaStore;

/// A file waiting for replication, as read by the sync worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirtyFile {
    pub id: i64,
    pub path: String,
    pub size: u64,
    pub mtime: i64,
    /// Version observed when the row was read.
    pub version: i64,
}

/// Result of replicating one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    pub success: bool,
    pub remote_id: Option<String>,
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn uploaded(remote_id: impl Into<String>) -> Self {
        Self {
            success: true,
            remote_id: Some(remote_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            remote_id: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessCount {
    pub path: String,
    pub size: u64,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFile {
    pub path: String,
    pub remote_id: String,
}

/// Metadata bookkeeping consumed by the dispatcher and the sync worker.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Record a new (or recreated) regular file; marks it dirty.
    async fn record_file_created(&self, path: &str, mode: u32) -> MetaResult<()>;

    async fn record_directory_created(&self, path: &str, mode: u32) -> MetaResult<()>;

    /// Forget `path` and everything below it.
    async fn record_removed(&self, path: &str) -> MetaResult<()>;

    /// Move `old` (and its descendants) to `new`, replacing whatever was
    /// recorded at `new`. Renamed files are marked dirty.
    async fn record_renamed(&self, old: &str, new: &str) -> MetaResult<()>;

    /// Upsert the attributes observed on the backing store.
    async fn update_attributes(&self, path: &str, attr: &FileAttr) -> MetaResult<()>;

    async fn update_size(&self, path: &str, size: u64) -> MetaResult<()>;

    /// Bump atime and append an access-history row.
    async fn update_access_time(&self, path: &str) -> MetaResult<()>;

    async fn update_modify_time(&self, path: &str) -> MetaResult<()>;

    /// Names recorded directly under `dir`.
    async fn list_directory_children(&self, dir: &str) -> MetaResult<Vec<String>>;

    /// Flag `path` for replication and bump its version.
    async fn mark_dirty(&self, path: &str) -> MetaResult<()>;

    /// Dirty regular files, least recently modified first.
    async fn list_dirty_files(&self, limit: usize) -> MetaResult<Vec<DirtyFile>>;

    /// Record a replication attempt. Returns true when the dirty flag was
    /// cleared, false when the attempt failed or the file changed meanwhile.
    async fn record_sync_result(&self, file: &DirtyFile, outcome: &SyncOutcome)
    -> MetaResult<bool>;

    /// Regular files ordered by access-history count, most accessed first.
    async fn most_accessed(&self, limit: usize) -> MetaResult<Vec<AccessCount>>;

    async fn files_with_remote_ids(&self) -> MetaResult<Vec<RemoteFile>>;
}

pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
