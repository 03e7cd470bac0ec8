//! Operation dispatcher: path-based POSIX operations over the backing tree,
//! with the frequency cache on the read path and metadata notifications on
//! every mutation.
//!
//! All methods take `&mut self`; callers that share a `CacheFs` serialize
//! access (the FUSE adapter keeps it behind one async mutex).

use std::io::{self, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use nix::unistd::AccessFlags;
use tokio::fs::{self, DirBuilder, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{FsError, FsResult, MetaResult};
use crate::meta::MetaStore;
use crate::vfs::attr::FileAttr;
use crate::vfs::cache::FrequencyCache;
use crate::vfs::handles::{HandleTable, open_options};
use crate::vfs::path::PathTranslator;

pub struct CacheFs {
    translator: PathTranslator,
    cache: Option<FrequencyCache>,
    handles: HandleTable,
    meta: Arc<dyn MetaStore>,
}

fn is_read_only(flags: i32) -> bool {
    flags & libc::O_ACCMODE == libc::O_RDONLY
}

/// Metadata notifications are best-effort.
fn notify(op: &'static str, path: &str, res: MetaResult<()>) {
    if let Err(e) = res {
        warn!(op, path, error = %e, "metadata notification failed");
    }
}

async fn sync_file(file: &mut File, datasync: bool) -> io::Result<()> {
    file.flush().await?;
    if datasync {
        file.sync_data().await
    } else {
        file.sync_all().await
    }
}

async fn read_at(file: &mut File, length: usize, offset: u64) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(length.min(1 << 20));
    file.take(length as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}

impl CacheFs {
    /// `cache` is `None` when caching is disabled.
    pub fn new(
        translator: PathTranslator,
        cache: Option<FrequencyCache>,
        meta: Arc<dyn MetaStore>,
    ) -> Self {
        Self {
            translator,
            cache,
            handles: HandleTable::new(),
            meta,
        }
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.translator
    }

    pub fn cache(&self) -> Option<&FrequencyCache> {
        self.cache.as_ref()
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn full(&self, path: &str) -> PathBuf {
        self.translator.resolve(path)
    }

    async fn invalidate(&mut self, path: &str) {
        if let Some(cache) = self.cache.as_mut() {
            cache.invalidate(path).await;
        }
    }

    pub async fn access(&mut self, path: &str, mask: i32) -> FsResult<()> {
        let full = self.full(path);
        nix::unistd::access(&full, AccessFlags::from_bits_truncate(mask)).map_err(|errno| {
            match errno {
                nix::errno::Errno::ENOENT => FsError::NotFound(path.to_string()),
                nix::errno::Errno::EACCES | nix::errno::Errno::EPERM => {
                    FsError::PermissionDenied(path.to_string())
                }
                other => other.into(),
            }
        })
    }

    pub async fn chmod(&mut self, path: &str, mode: u32) -> FsResult<()> {
        let full = self.full(path);
        fs::set_permissions(&full, std::fs::Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(|e| FsError::from_io(e, path))
    }

    pub async fn chown(&mut self, path: &str, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        let full = self.full(path);
        tokio::task::spawn_blocking(move || std::os::unix::fs::lchown(&full, uid, gid))
            .await
            .map_err(io::Error::other)?
            .map_err(|e| FsError::from_io(e, path))
    }

    /// Cached snapshot when available, otherwise a fresh lstat of the backing
    /// entry (which is also reported to the metadata store).
    pub async fn getattr(&mut self, path: &str) -> FsResult<FileAttr> {
        if let Some(cache) = self.cache.as_mut() {
            if let Some(attr) = cache.get_attr(path).await {
                debug!(path, "getattr served from cache");
                return Ok(attr);
            }
        }
        let meta = fs::symlink_metadata(self.full(path))
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        let attr = FileAttr::from_metadata(&meta);
        notify(
            "update_attributes",
            path,
            self.meta.update_attributes(path, &attr).await,
        );
        Ok(attr)
    }

    /// `.`, `..`, the backing directory's entries, then names only the
    /// metadata store knows about.
    ///
    /// A directory missing from the backing tree still lists its recorded
    /// children; it is `NotFound` only when the store knows none.
    pub async fn readdir(&mut self, path: &str) -> FsResult<Vec<String>> {
        let mut names = vec![".".to_string(), "..".to_string()];
        let on_disk = match fs::read_dir(self.full(path)).await {
            Ok(mut rd) => {
                while let Some(entry) = rd.next_entry().await? {
                    names.push(entry.file_name().to_string_lossy().into_owned());
                }
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(FsError::from_io(e, path)),
        };
        let recorded = match self.meta.list_directory_children(path).await {
            Ok(extra) => extra,
            Err(e) => {
                warn!(path, error = %e, "cannot list recorded children");
                Vec::new()
            }
        };
        if !on_disk && recorded.is_empty() {
            return Err(FsError::NotFound(path.to_string()));
        }
        for name in recorded {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub async fn mkdir(&mut self, path: &str, mode: u32) -> FsResult<()> {
        let full = self.full(path);
        let mut builder = DirBuilder::new();
        builder.mode(mode & 0o7777);
        builder
            .create(&full)
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        notify(
            "record_directory_created",
            path,
            self.meta
                .record_directory_created(path, libc::S_IFDIR | (mode & 0o7777))
                .await,
        );
        Ok(())
    }

    pub async fn rmdir(&mut self, path: &str) -> FsResult<()> {
        fs::remove_dir(self.full(path))
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        notify("record_removed", path, self.meta.record_removed(path).await);
        Ok(())
    }

    /// Create (or open for rewriting) a regular file and return a handle.
    pub async fn create(&mut self, path: &str, mode: u32, flags: i32) -> FsResult<u64> {
        // A created file must be writable through the returned handle.
        let flags = if is_read_only(flags) {
            (flags & !libc::O_ACCMODE) | libc::O_RDWR
        } else {
            flags
        };
        let full = self.full(path);
        let mut opts = open_options(flags);
        opts.create(true).mode(mode & 0o7777);
        let file = opts
            .open(&full)
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        let fh = self.handles.insert(path, file, flags);
        self.invalidate(path).await;
        notify(
            "record_file_created",
            path,
            self.meta
                .record_file_created(path, libc::S_IFREG | (mode & 0o7777))
                .await,
        );
        Ok(fh)
    }

    /// Open an existing file. Read-only opens of uncached files populate the
    /// cache first.
    pub async fn open(&mut self, path: &str, flags: i32) -> FsResult<u64> {
        let full = self.full(path);
        let fh = self
            .handles
            .open(path, &full, flags)
            .await
            .map_err(|e| FsError::from_io(e, path))?;

        if let Some(cache) = self.cache.as_mut() {
            if flags & libc::O_TRUNC != 0 {
                cache.invalidate(path).await;
            } else if is_read_only(flags) && !cache.has(path).await {
                cache.add(path, &full).await;
            }
        }
        notify(
            "update_access_time",
            path,
            self.meta.update_access_time(path).await,
        );
        Ok(fh)
    }

    pub async fn read(&mut self, fh: u64, length: usize, offset: u64) -> FsResult<Vec<u8>> {
        let handle = self.handles.get_mut(fh).ok_or(FsError::BadHandle(fh))?;
        let path = handle.path.clone();
        if handle.is_readable() {
            if let Some(cache) = self.cache.as_mut() {
                if let Some(buf) = cache.read(&path, length, offset).await {
                    debug!(path, offset, len = buf.len(), "read served from cache");
                    return Ok(buf);
                }
            }
        }
        let handle = self.handles.get_mut(fh).ok_or(FsError::BadHandle(fh))?;
        read_at(&mut handle.file, length, offset)
            .await
            .map_err(|e| FsError::from_io(e, &path))
    }

    /// Write through the handle, then drop the stale cached copy and report
    /// the new size. Returns the number of bytes written.
    pub async fn write(&mut self, fh: u64, data: &[u8], offset: u64) -> FsResult<usize> {
        let handle = self.handles.get_mut(fh).ok_or(FsError::BadHandle(fh))?;
        let path = handle.path.clone();
        let written: io::Result<u64> = async {
            handle.file.seek(SeekFrom::Start(offset)).await?;
            handle.file.write_all(data).await?;
            handle.file.flush().await?;
            Ok(handle.file.metadata().await?.len())
        }
        .await;
        let size = written.map_err(|e| FsError::from_io(e, &path))?;

        self.invalidate(&path).await;
        notify("update_size", &path, self.meta.update_size(&path, size).await);
        notify(
            "update_modify_time",
            &path,
            self.meta.update_modify_time(&path).await,
        );
        notify("mark_dirty", &path, self.meta.mark_dirty(&path).await);
        Ok(data.len())
    }

    pub async fn truncate(&mut self, path: &str, length: u64) -> FsResult<()> {
        let full = self.full(path);
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&full)
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        file.set_len(length)
            .await
            .map_err(|e| FsError::from_io(e, path))?;

        self.invalidate(path).await;
        notify("update_size", path, self.meta.update_size(path, length).await);
        notify(
            "update_modify_time",
            path,
            self.meta.update_modify_time(path).await,
        );
        notify("mark_dirty", path, self.meta.mark_dirty(path).await);
        Ok(())
    }

    /// Force the handle's data to stable storage. I/O failures are logged
    /// and not reported.
    pub async fn flush(&mut self, fh: u64) -> FsResult<()> {
        let handle = self.handles.get_mut(fh).ok_or(FsError::BadHandle(fh))?;
        if let Err(e) = sync_file(&mut handle.file, false).await {
            warn!(path = %handle.path, error = %e, "flush failed");
        }
        Ok(())
    }

    pub async fn fsync(&mut self, fh: u64, datasync: bool) -> FsResult<()> {
        let handle = self.handles.get_mut(fh).ok_or(FsError::BadHandle(fh))?;
        if let Err(e) = sync_file(&mut handle.file, datasync).await {
            warn!(path = %handle.path, error = %e, "fsync failed");
        }
        Ok(())
    }

    /// Close a handle, syncing it first unless it was opened read-only.
    /// Unknown handles are ignored.
    pub async fn release(&mut self, fh: u64) -> FsResult<()> {
        if let Some(mut handle) = self.handles.release(fh) {
            let res = if is_read_only(handle.flags) {
                handle.file.flush().await
            } else {
                sync_file(&mut handle.file, false).await
            };
            if let Err(e) = res {
                warn!(path = %handle.path, error = %e, "flush on release failed");
            }
        }
        Ok(())
    }

    pub async fn unlink(&mut self, path: &str) -> FsResult<()> {
        fs::remove_file(self.full(path))
            .await
            .map_err(|e| FsError::from_io(e, path))?;
        self.invalidate(path).await;
        notify("record_removed", path, self.meta.record_removed(path).await);
        Ok(())
    }

    /// Rename `old` to `new`, replacing `new` if it exists. Cached copies of
    /// both names (and anything below them) are dropped.
    pub async fn rename(&mut self, old: &str, new: &str) -> FsResult<()> {
        fs::rename(self.full(old), self.full(new))
            .await
            .map_err(|e| FsError::from_io(e, old))?;
        if let Some(cache) = self.cache.as_mut() {
            cache.invalidate_tree(old).await;
            cache.invalidate_tree(new).await;
        }
        self.handles.rename_path(old, new);
        notify(
            "record_renamed",
            old,
            self.meta.record_renamed(old, new).await,
        );
        Ok(())
    }

    /// Load up to `limit` of the most accessed files into the cache.
    /// Returns how many were admitted.
    pub async fn prewarm(&mut self, limit: usize) -> usize {
        let Some(cache) = self.cache.as_mut() else {
            return 0;
        };
        let hot = match self.meta.most_accessed(limit).await {
            Ok(hot) => hot,
            Err(e) => {
                warn!(error = %e, "cannot read access history for prewarm");
                return 0;
            }
        };
        let mut admitted = 0;
        for entry in hot {
            if cache.has(&entry.path).await {
                continue;
            }
            if cache.add(&entry.path, &self.translator.resolve(&entry.path)).await {
                admitted += 1;
            }
        }
        debug!(admitted, "cache prewarmed");
        admitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::InMemoryMetaStore;

    struct Fixture {
        _tmp: tempfile::TempDir,
        storage: PathBuf,
        meta: Arc<InMemoryMetaStore>,
        fs: CacheFs,
    }

    async fn fixture(capacity: Option<u64>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let storage = tmp.path().join("storage");
        std::fs::create_dir_all(&storage).unwrap();
        let cache = match capacity {
            Some(c) => Some(
                FrequencyCache::new(tmp.path().join("cache"), c)
                    .await
                    .unwrap(),
            ),
            None => None,
        };
        let meta = Arc::new(InMemoryMetaStore::new());
        let fs = CacheFs::new(PathTranslator::new(&storage), cache, meta.clone());
        Fixture {
            _tmp: tmp,
            storage,
            meta,
            fs,
        }
    }

    #[tokio::test]
    async fn read_only_open_populates_cache() {
        let mut f = fixture(Some(1024)).await;
        std::fs::write(f.storage.join("a"), b"Test content").unwrap();

        let fh = f.fs.open("/a", libc::O_RDONLY).await.unwrap();
        assert!(f.fs.cache().unwrap().has("/a").await);
        assert_eq!(f.fs.read(fh, 4, 5).await.unwrap(), b"cont");
        assert_eq!(f.fs.cache().unwrap().frequency("/a"), Some(2));
        f.fs.release(fh).await.unwrap();
        assert_eq!(f.fs.open_handles(), 0);

        let fh = f.fs.open("/a", libc::O_RDWR).await.unwrap();
        assert_eq!(f.fs.read(fh, 100, 0).await.unwrap(), b"Test content");
    }

    #[tokio::test]
    async fn write_invalidates_and_marks_dirty() {
        let mut f = fixture(Some(1024)).await;
        let fh = f.fs.create("/w.txt", 0o644, libc::O_WRONLY).await.unwrap();
        f.meta
            .record_sync_result(
                &f.meta.list_dirty_files(1).await.unwrap()[0],
                &crate::meta::SyncOutcome::uploaded("objects/old"),
            )
            .await
            .unwrap();
        assert!(f.meta.list_dirty_files(10).await.unwrap().is_empty());

        assert_eq!(f.fs.write(fh, b"hello", 0).await.unwrap(), 5);
        assert_eq!(f.fs.write(fh, b"!", 5).await.unwrap(), 1);
        f.fs.release(fh).await.unwrap();

        assert_eq!(std::fs::read(f.storage.join("w.txt")).unwrap(), b"hello!");
        let rec = f.meta.record("/w.txt").unwrap();
        assert_eq!(rec.size, 6);
        assert!(rec.needs_sync);
    }

    #[tokio::test]
    async fn operations_on_missing_paths() {
        let mut f = fixture(Some(1024)).await;
        assert!(matches!(
            f.fs.getattr("/nope").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            f.fs.open("/nope", libc::O_RDONLY).await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            f.fs.access("/nope", libc::F_OK).await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            f.fs.read(42, 1, 0).await,
            Err(FsError::BadHandle(42))
        ));
        // releasing an unknown handle is a no-op
        f.fs.release(42).await.unwrap();
    }

    #[tokio::test]
    async fn readdir_merges_recorded_children() {
        let mut f = fixture(None).await;
        std::fs::write(f.storage.join("on-disk"), b"x").unwrap();
        f.meta
            .record_file_created("/remote-only", 0o100644)
            .await
            .unwrap();
        f.meta.record_file_created("/on-disk", 0o100644).await.unwrap();

        let names = f.fs.readdir("/").await.unwrap();
        assert_eq!(&names[..2], &[".", ".."]);
        assert_eq!(names.iter().filter(|n| *n == "on-disk").count(), 1);
        assert!(names.contains(&"remote-only".to_string()));
    }

    #[tokio::test]
    async fn directories_and_permissions() {
        let mut f = fixture(None).await;
        f.fs.mkdir("/d", 0o750).await.unwrap();
        let attr = f.fs.getattr("/d").await.unwrap();
        assert!(attr.is_dir());
        assert!(f.meta.record("/d").unwrap().is_directory);

        let fh = f.fs.create("/d/x", 0o600, libc::O_RDONLY).await.unwrap();
        f.fs.write(fh, b"abc", 0).await.unwrap();
        f.fs.release(fh).await.unwrap();

        f.fs.chmod("/d/x", 0o640).await.unwrap();
        assert_eq!(f.fs.getattr("/d/x").await.unwrap().perm(), 0o640);
        f.fs.chown("/d/x", None, None).await.unwrap();

        f.fs.truncate("/d/x", 1).await.unwrap();
        assert_eq!(std::fs::read(f.storage.join("d/x")).unwrap(), b"a");
        assert_eq!(f.meta.record("/d/x").unwrap().size, 1);

        assert!(f.fs.rmdir("/d").await.is_err());
        f.fs.unlink("/d/x").await.unwrap();
        f.fs.rmdir("/d").await.unwrap();
        assert!(f.meta.record("/d").is_none());
    }

    #[tokio::test]
    async fn prewarm_loads_hot_files() {
        let mut f = fixture(Some(1024)).await;
        std::fs::write(f.storage.join("hot"), b"0123456789").unwrap();
        std::fs::write(f.storage.join("cold"), b"0123456789").unwrap();
        f.meta.record_file_created("/hot", 0o100644).await.unwrap();
        f.meta.record_file_created("/cold", 0o100644).await.unwrap();
        for _ in 0..3 {
            f.meta.update_access_time("/hot").await.unwrap();
        }
        f.meta.update_access_time("/cold").await.unwrap();

        assert_eq!(f.fs.prewarm(1).await, 1);
        let cache = f.fs.cache().unwrap();
        assert!(cache.has("/hot").await);
        assert!(!cache.has("/cold").await);

        let mut nocache = fixture(None).await;
        assert_eq!(nocache.fs.prewarm(10).await, 0);
    }

    #[tokio::test]
    async fn flush_and_fsync_reach_the_backing_file() {
        let mut f = fixture(Some(1024)).await;
        let fh = f.fs.create("/durable", 0o644, libc::O_WRONLY).await.unwrap();
        f.fs.write(fh, b"x", 0).await.unwrap();

        f.fs.flush(fh).await.unwrap();
        assert_eq!(std::fs::read(f.storage.join("durable")).unwrap(), b"x");
        f.fs.fsync(fh, false).await.unwrap();
        f.fs.fsync(fh, true).await.unwrap();
        f.fs.release(fh).await.unwrap();

        assert!(matches!(f.fs.flush(fh).await, Err(FsError::BadHandle(id)) if id == fh));
        assert!(matches!(
            f.fs.fsync(99, false).await,
            Err(FsError::BadHandle(99))
        ));
    }

    #[tokio::test]
    async fn readdir_lists_recorded_children_of_missing_directory() {
        let mut f = fixture(None).await;
        f.meta
            .record_directory_created("/remote", libc::S_IFDIR | 0o755)
            .await
            .unwrap();
        f.meta
            .record_file_created("/remote/f", libc::S_IFREG | 0o644)
            .await
            .unwrap();
        assert!(!f.storage.join("remote").exists());

        assert_eq!(f.fs.readdir("/remote").await.unwrap(), [".", "..", "f"]);
        assert!(matches!(
            f.fs.readdir("/nowhere").await,
            Err(FsError::NotFound(_))
        ));
    }
}
