//! Replication of backing files to a remote object store.
//!
//! The dispatcher only marks files dirty; the worker in `daemon::worker`
//! drives a `Replicator` over the dirty set. Restoring goes the other way:
//! remote ids recorded in the metadata store are fetched back into the
//! backing tree.

pub mod replicator;

use async_trait::async_trait;

use crate::error::{SyncError, SyncResult};
use crate::meta::{MetaStore, SyncOutcome};

pub use replicator::ObjectReplicator;

#[async_trait]
pub trait Replicator: Send + Sync {
    /// Push the current content of `path`. Never fails outright; problems
    /// are reported in the outcome so the worker can record them.
    async fn upload_or_update(&self, path: &str) -> SyncOutcome;

    /// Fetch `remote_id` into the backing file for `path`, returning the
    /// number of bytes written.
    async fn download(&self, path: &str, remote_id: &str) -> SyncResult<u64>;
}

/// Remote id last recorded for `path`.
pub async fn lookup_remote_id(meta: &dyn MetaStore, path: &str) -> SyncResult<String> {
    meta.files_with_remote_ids()
        .await?
        .into_iter()
        .find(|f| f.path == path)
        .map(|f| f.remote_id)
        .ok_or_else(|| SyncError::NotFound(format!("remote copy of {path}")))
}

/// Download every replicated file for which `is_missing` holds.
///
/// Failures are logged per file; the count of restored files is returned.
pub async fn restore_missing<F>(
    meta: &dyn MetaStore,
    replicator: &dyn Replicator,
    is_missing: F,
) -> SyncResult<usize>
where
    F: Fn(&str) -> bool,
{
    let mut restored = 0;
    for file in meta.files_with_remote_ids().await? {
        if !is_missing(&file.path) {
            continue;
        }
        match replicator.download(&file.path, &file.remote_id).await {
            Ok(bytes) => {
                tracing::info!(path = %file.path, bytes, "restored from remote");
                restored += 1;
            }
            Err(e) => tracing::warn!(path = %file.path, error = %e, "restore failed"),
        }
    }
    Ok(restored)
}
