//! In-memory MetaStore used by unit and integration tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AccessCount, DirtyFile, MetaStore, RemoteFile, SyncOutcome, now_secs};
use crate::error::MetaResult;
use crate::vfs::attr::{FileAttr, unix_secs};
use crate::vfs::path::split_virtual;

#[derive(Clone, Debug)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub filename: String,
    pub directory: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub is_directory: bool,
    pub needs_sync: bool,
    pub last_synced: Option<i64>,
    pub remote_id: Option<String>,
    pub version: i64,
}

#[derive(Clone, Debug)]
pub struct SyncRecord {
    pub file_id: i64,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    files: HashMap<String, FileRecord>,
    // (file id, access time)
    accesses: Vec<(i64, i64)>,
    syncs: Vec<SyncRecord>,
}

impl Inner {
    fn insert(&mut self, path: &str, mode: u32, is_directory: bool) -> &mut FileRecord {
        let (directory, filename) = split_virtual(path);
        let now = now_secs();
        self.next_id += 1;
        let id = self.next_id;
        let record = FileRecord {
            id,
            path: path.to_string(),
            filename,
            directory,
            size: 0,
            mode,
            uid: 0,
            gid: 0,
            atime: now,
            mtime: now,
            ctime: now,
            is_directory,
            needs_sync: !is_directory,
            last_synced: None,
            remote_id: None,
            version: if is_directory { 0 } else { 1 },
        };
        self.files
            .entry(path.to_string())
            .insert_entry(record)
            .into_mut()
    }

    fn remove_tree(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.files
            .retain(|p, _| p != path && !p.starts_with(&prefix));
    }
}

#[derive(Default)]
pub struct InMemoryMetaStore {
    inner: Mutex<Inner>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one record, for assertions.
    pub fn record(&self, path: &str) -> Option<FileRecord> {
        self.inner.lock().unwrap().files.get(path).cloned()
    }

    pub fn sync_history(&self) -> Vec<SyncRecord> {
        self.inner.lock().unwrap().syncs.clone()
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn record_file_created(&self, path: &str, mode: u32) -> MetaResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_secs();
        match inner.files.get_mut(path) {
            Some(rec) => {
                rec.mode = mode;
                rec.mtime = now;
                rec.ctime = now;
                rec.needs_sync = true;
                rec.version += 1;
            }
            None => {
                inner.insert(path, mode, false);
            }
        }
        Ok(())
    }

    async fn record_directory_created(&self, path: &str, mode: u32) -> MetaResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_secs();
        match inner.files.get_mut(path) {
            Some(rec) => {
                rec.mode = mode;
                rec.mtime = now;
                rec.ctime = now;
            }
            None => {
                inner.insert(path, mode, true);
            }
        }
        Ok(())
    }

    async fn record_removed(&self, path: &str) -> MetaResult<()> {
        self.inner.lock().unwrap().remove_tree(path);
        Ok(())
    }

    async fn record_renamed(&self, old: &str, new: &str) -> MetaResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.files.contains_key(old) {
            return Ok(());
        }
        inner.remove_tree(new);
        let old_prefix = format!("{}/", old.trim_end_matches('/'));
        let moved: Vec<String> = inner
            .files
            .keys()
            .filter(|p| p.as_str() == old || p.starts_with(&old_prefix))
            .cloned()
            .collect();
        for p in moved {
            let Some(mut rec) = inner.files.remove(&p) else {
                continue;
            };
            let new_path = format!("{new}{}", &p[old.len()..]);
            let (directory, filename) = split_virtual(&new_path);
            rec.path = new_path.clone();
            rec.directory = directory;
            rec.filename = filename;
            if p == old {
                rec.version += 1;
                rec.needs_sync = !rec.is_directory;
            }
            inner.files.insert(new_path, rec);
        }
        Ok(())
    }

    async fn update_attributes(&self, path: &str, attr: &FileAttr) -> MetaResult<()> {
        if path == "/" {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.files.contains_key(path) {
            inner.insert(path, attr.mode, attr.is_dir());
        }
        let Some(rec) = inner.files.get_mut(path) else {
            return Ok(());
        };
        rec.size = attr.size;
        rec.mode = attr.mode;
        rec.uid = attr.uid;
        rec.gid = attr.gid;
        rec.atime = unix_secs(attr.atime);
        rec.mtime = unix_secs(attr.mtime);
        rec.ctime = unix_secs(attr.ctime);
        Ok(())
    }

    async fn update_size(&self, path: &str, size: u64) -> MetaResult<()> {
        if let Some(rec) = self.inner.lock().unwrap().files.get_mut(path) {
            rec.size = size;
        }
        Ok(())
    }

    async fn update_access_time(&self, path: &str) -> MetaResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_secs();
        let Some(rec) = inner.files.get_mut(path) else {
            return Ok(());
        };
        rec.atime = now;
        let id = rec.id;
        inner.accesses.push((id, now));
        Ok(())
    }

    async fn update_modify_time(&self, path: &str) -> MetaResult<()> {
        if let Some(rec) = self.inner.lock().unwrap().files.get_mut(path) {
            rec.mtime = now_secs();
        }
        Ok(())
    }

    async fn list_directory_children(&self, dir: &str) -> MetaResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let mut names: Vec<String> = inner
            .files
            .values()
            .filter(|r| r.directory == dir)
            .map(|r| r.filename.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn mark_dirty(&self, path: &str) -> MetaResult<()> {
        if let Some(rec) = self.inner.lock().unwrap().files.get_mut(path) {
            rec.needs_sync = true;
            rec.version += 1;
        }
        Ok(())
    }

    async fn list_dirty_files(&self, limit: usize) -> MetaResult<Vec<DirtyFile>> {
        let inner = self.inner.lock().unwrap();
        let mut dirty: Vec<&FileRecord> = inner
            .files
            .values()
            .filter(|r| r.needs_sync && !r.is_directory)
            .collect();
        dirty.sort_by_key(|r| (r.mtime, r.id));
        Ok(dirty
            .into_iter()
            .take(limit)
            .map(|r| DirtyFile {
                id: r.id,
                path: r.path.clone(),
                size: r.size,
                mtime: r.mtime,
                version: r.version,
            })
            .collect())
    }

    async fn record_sync_result(
        &self,
        file: &DirtyFile,
        outcome: &SyncOutcome,
    ) -> MetaResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = now_secs();
        let mut cleared = false;
        if let Some(rec) = inner.files.values_mut().find(|r| r.id == file.id) {
            rec.last_synced = Some(now);
            if outcome.success && rec.version == file.version {
                rec.needs_sync = false;
                rec.remote_id = outcome.remote_id.clone();
                cleared = true;
            }
        }
        inner.syncs.push(SyncRecord {
            file_id: file.id,
            success: outcome.success,
            error: outcome.error.clone(),
        });
        Ok(cleared)
    }

    async fn most_accessed(&self, limit: usize) -> MetaResult<Vec<AccessCount>> {
        let inner = self.inner.lock().unwrap();
        let mut counts: HashMap<i64, u64> = HashMap::new();
        for (id, _) in &inner.accesses {
            *counts.entry(*id).or_default() += 1;
        }
        let mut out: Vec<AccessCount> = inner
            .files
            .values()
            .filter(|r| !r.is_directory)
            .filter_map(|r| {
                counts.get(&r.id).map(|c| AccessCount {
                    path: r.path.clone(),
                    size: r.size,
                    count: *c,
                })
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.path.cmp(&b.path)));
        out.truncate(limit);
        Ok(out)
    }

    async fn files_with_remote_ids(&self) -> MetaResult<Vec<RemoteFile>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<RemoteFile> = inner
            .files
            .values()
            .filter_map(|r| {
                r.remote_id
                    .as_ref()
                    .filter(|id| !id.is_empty())
                    .map(|id| RemoteFile {
                        path: r.path.clone(),
                        remote_id: id.clone(),
                    })
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}
