//! Replication worker.
//!
//! Every `interval` the worker reads up to `batch` dirty files (oldest
//! modification first), uploads each through the `Replicator` and records
//! the outcome. Cancellation is observed between files and while idle, so
//! shutdown waits for at most one in-flight upload.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::MetaResult;
use crate::meta::MetaStore;
use crate::sync::Replicator;

pub const DEFAULT_BATCH: usize = 10;
pub const ERROR_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Uploads that succeeded but raced with a write; they stay dirty.
    pub stale: usize,
}

pub struct SyncWorker {
    meta: Arc<dyn MetaStore>,
    replicator: Arc<dyn Replicator>,
    interval: Duration,
    batch: usize,
    error_cooldown: Duration,
}

impl SyncWorker {
    pub fn new(meta: Arc<dyn MetaStore>, replicator: Arc<dyn Replicator>, interval: Duration) -> Self {
        Self {
            meta,
            replicator,
            interval,
            batch: DEFAULT_BATCH,
            error_cooldown: ERROR_COOLDOWN,
        }
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch.max(1);
        self
    }

    pub fn with_error_cooldown(mut self, cooldown: Duration) -> Self {
        self.error_cooldown = cooldown;
        self
    }

    pub fn spawn(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }

    pub async fn run(self, token: CancellationToken) {
        info!(interval = ?self.interval, batch = self.batch, "sync worker started");
        loop {
            if token.is_cancelled() {
                break;
            }
            let pause = match self.run_once(&token).await {
                Ok(report) => {
                    if report.attempted > 0 {
                        info!(
                            synced = report.synced,
                            failed = report.failed,
                            stale = report.stale,
                            "sync batch finished"
                        );
                    }
                    self.interval
                }
                Err(e) => {
                    error!(error = %e, "sync batch failed");
                    self.error_cooldown
                }
            };
            tokio::select! {
                _ = sleep(pause) => {}
                _ = token.cancelled() => break,
            }
        }
        info!("sync worker stopped");
    }

    /// Process one batch of dirty files.
    pub async fn run_once(&self, token: &CancellationToken) -> MetaResult<BatchReport> {
        let files = self.meta.list_dirty_files(self.batch).await?;
        let mut report = BatchReport::default();
        if !files.is_empty() {
            debug!(count = files.len(), "found files to sync");
        }
        for file in files {
            if token.is_cancelled() {
                break;
            }
            report.attempted += 1;
            let outcome = self.replicator.upload_or_update(&file.path).await;
            let cleared = match self.meta.record_sync_result(&file, &outcome).await {
                Ok(cleared) => cleared,
                Err(e) => {
                    warn!(path = %file.path, error = %e, "cannot record sync result, will retry");
                    report.failed += 1;
                    continue;
                }
            };
            match (outcome.success, cleared) {
                (true, true) => report.synced += 1,
                (true, false) => {
                    debug!(path = %file.path, "file changed during upload, keeping dirty");
                    report.stale += 1;
                }
                (false, _) => {
                    warn!(
                        path = %file.path,
                        error = outcome.error.as_deref().unwrap_or("unknown"),
                        "sync failed, will retry"
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::LocalFsBackend;
    use crate::crypto::Cipher;
    use crate::error::{MetaError, SyncResult};
    use crate::meta::{AccessCount, DirtyFile, InMemoryMetaStore, RemoteFile, SyncOutcome};
    use crate::vfs::attr::FileAttr;
    use crate::sync::ObjectReplicator;
    use crate::vfs::path::PathTranslator;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Fails every path listed in `failing`, and bumps the file's version
    /// mid-upload for paths in `racing`.
    #[derive(Default)]
    struct ScriptedReplicator {
        meta: Option<Arc<InMemoryMetaStore>>,
        failing: Vec<String>,
        racing: Vec<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Replicator for ScriptedReplicator {
        async fn upload_or_update(&self, path: &str) -> SyncOutcome {
            self.seen.lock().unwrap().push(path.to_string());
            if self.racing.iter().any(|p| p == path) {
                if let Some(meta) = &self.meta {
                    meta.mark_dirty(path).await.unwrap();
                }
            }
            if self.failing.iter().any(|p| p == path) {
                SyncOutcome::failed("remote unavailable")
            } else {
                SyncOutcome::uploaded(format!("objects/{path}"))
            }
        }

        async fn download(&self, _path: &str, _remote_id: &str) -> SyncResult<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn batch_reports_success_failure_and_races() {
        let meta = Arc::new(InMemoryMetaStore::new());
        for p in ["/ok", "/bad", "/busy"] {
            meta.record_file_created(p, 0o100644).await.unwrap();
        }
        let replicator = Arc::new(ScriptedReplicator {
            meta: Some(meta.clone()),
            failing: vec!["/bad".into()],
            racing: vec!["/busy".into()],
            ..Default::default()
        });
        let worker = SyncWorker::new(meta.clone(), replicator.clone(), Duration::from_secs(1));

        let report = worker.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report,
            BatchReport {
                attempted: 3,
                synced: 1,
                failed: 1,
                stale: 1
            }
        );
        let mut dirty: Vec<String> = meta
            .list_dirty_files(10)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        dirty.sort();
        assert_eq!(dirty, vec!["/bad", "/busy"]);
        assert_eq!(meta.sync_history().len(), 3);
    }

    #[tokio::test]
    async fn batch_size_and_cancellation_are_respected() {
        let meta = Arc::new(InMemoryMetaStore::new());
        for i in 0..5 {
            meta.record_file_created(&format!("/f{i}"), 0o100644)
                .await
                .unwrap();
        }
        let replicator = Arc::new(ScriptedReplicator::default());
        let worker =
            SyncWorker::new(meta.clone(), replicator.clone(), Duration::from_secs(1)).with_batch(2);

        let report = worker.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.attempted, 2);

        let token = CancellationToken::new();
        token.cancel();
        let report = worker.run_once(&token).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(replicator.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn run_loop_drains_and_stops_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = tmp.path().join("storage");
        std::fs::create_dir_all(&storage).unwrap();
        std::fs::write(storage.join("a.txt"), b"payload").unwrap();

        let meta = Arc::new(InMemoryMetaStore::new());
        meta.record_file_created("/a.txt", 0o100644).await.unwrap();
        let replicator = Arc::new(ObjectReplicator::new(
            PathTranslator::new(&storage),
            Arc::new(LocalFsBackend::new(tmp.path().join("remote"))),
            Cipher::disabled(),
        ));

        let token = CancellationToken::new();
        let handle = SyncWorker::new(meta.clone(), replicator, Duration::from_secs(3600))
            .spawn(token.clone());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !meta.list_dirty_files(10).await.unwrap().is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(meta.record("/a.txt").unwrap().remote_id.is_some());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    /// Delegates to an in-memory store but cannot record sync results for
    /// `broken`.
    struct BrokenResultStore {
        inner: InMemoryMetaStore,
        broken: String,
    }

    #[async_trait]
    impl MetaStore for BrokenResultStore {
        async fn record_file_created(&self, path: &str, mode: u32) -> MetaResult<()> {
            self.inner.record_file_created(path, mode).await
        }
        async fn record_directory_created(&self, path: &str, mode: u32) -> MetaResult<()> {
            self.inner.record_directory_created(path, mode).await
        }
        async fn record_removed(&self, path: &str) -> MetaResult<()> {
            self.inner.record_removed(path).await
        }
        async fn record_renamed(&self, old: &str, new: &str) -> MetaResult<()> {
            self.inner.record_renamed(old, new).await
        }
        async fn update_attributes(&self, path: &str, attr: &FileAttr) -> MetaResult<()> {
            self.inner.update_attributes(path, attr).await
        }
        async fn update_size(&self, path: &str, size: u64) -> MetaResult<()> {
            self.inner.update_size(path, size).await
        }
        async fn update_access_time(&self, path: &str) -> MetaResult<()> {
            self.inner.update_access_time(path).await
        }
        async fn update_modify_time(&self, path: &str) -> MetaResult<()> {
            self.inner.update_modify_time(path).await
        }
        async fn list_directory_children(&self, dir: &str) -> MetaResult<Vec<String>> {
            self.inner.list_directory_children(dir).await
        }
        async fn mark_dirty(&self, path: &str) -> MetaResult<()> {
            self.inner.mark_dirty(path).await
        }
        async fn list_dirty_files(&self, limit: usize) -> MetaResult<Vec<DirtyFile>> {
            self.inner.list_dirty_files(limit).await
        }
        async fn record_sync_result(
            &self,
            file: &DirtyFile,
            outcome: &SyncOutcome,
        ) -> MetaResult<bool> {
            if file.path == self.broken {
                return Err(MetaError::NotFound(file.path.clone()));
            }
            self.inner.record_sync_result(file, outcome).await
        }
        async fn most_accessed(&self, limit: usize) -> MetaResult<Vec<AccessCount>> {
            self.inner.most_accessed(limit).await
        }
        async fn files_with_remote_ids(&self) -> MetaResult<Vec<RemoteFile>> {
            self.inner.files_with_remote_ids().await
        }
    }

    #[tokio::test]
    async fn unrecordable_result_does_not_abort_batch() {
        let meta = Arc::new(BrokenResultStore {
            inner: InMemoryMetaStore::new(),
            broken: "/first".into(),
        });
        for p in ["/first", "/second", "/third"] {
            meta.record_file_created(p, 0o100644).await.unwrap();
        }
        let replicator = Arc::new(ScriptedReplicator::default());
        let worker = SyncWorker::new(meta.clone(), replicator.clone(), Duration::from_secs(1));

        let report = worker.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(
            report,
            BatchReport {
                attempted: 3,
                synced: 2,
                failed: 1,
                stale: 0
            }
        );
        assert_eq!(replicator.seen.lock().unwrap().len(), 3);

        let dirty = meta.list_dirty_files(10).await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].path, "/first");
    }
}
