//! FUSE adapter
//!
//! Exposes a `CacheFs` to the kernel through rfuse3's raw `Filesystem`
//! trait. The dispatcher is path based, so the adapter keeps an inode table
//! (inode <-> virtual path, root = 1) that follows lookups, creations,
//! removals and renames.
//!
//! Submodules:
//! - `mount`: mounting helpers
pub mod mount;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::sync::{Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite,
};
use rfuse3::Result as FuseResult;
use rfuse3::{Errno, FileType as FuseFileType, SetAttr, Timestamp};
use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::vfs::attr::FileAttr;
use crate::vfs::fs::CacheFs;
use crate::vfs::path::{join_virtual, split_virtual};

pub const ROOT_INO: u64 = 1;
const TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: u32 = 1024 * 1024;
/// Directory entry inode for children the kernel has not looked up yet.
const UNKNOWN_INO: u64 = 0xffff_ffff;

/// Bidirectional inode <-> virtual path map with kernel lookup counts.
/// An inode is dropped once the kernel forgets every lookup of it.
#[derive(Debug)]
struct InodeTable {
    next: u64,
    by_ino: HashMap<u64, String>,
    by_path: HashMap<String, u64>,
    lookups: HashMap<u64, u64>,
}

impl InodeTable {
    fn new() -> Self {
        let mut t = Self {
            next: ROOT_INO + 1,
            by_ino: HashMap::new(),
            by_path: HashMap::new(),
            lookups: HashMap::new(),
        };
        t.by_ino.insert(ROOT_INO, "/".to_string());
        t.by_path.insert("/".to_string(), ROOT_INO);
        t
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.by_ino.get(&ino).cloned()
    }

    fn ino_of(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(ino, path.to_string());
        self.by_path.insert(path.to_string(), ino);
        ino
    }

    fn known_ino(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).copied()
    }

    /// Inode for an entry handed to the kernel; counts one lookup.
    fn lookup(&mut self, path: &str) -> u64 {
        let ino = self.ino_of(path);
        *self.lookups.entry(ino).or_insert(0) += 1;
        ino
    }

    fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(count) = self.lookups.get_mut(&ino) else {
            return;
        };
        *count = count.saturating_sub(nlookup);
        if *count > 0 {
            return;
        }
        self.lookups.remove(&ino);
        if let Some(path) = self.by_ino.remove(&ino) {
            if self.by_path.get(&path) == Some(&ino) {
                self.by_path.remove(&path);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_ino.len()
    }

    fn remove(&mut self, path: &str) {
        if let Some(ino) = self.by_path.remove(path) {
            self.by_ino.remove(&ino);
            self.lookups.remove(&ino);
        }
    }

    /// Re-point `old` and everything below it at `new`; whatever was at
    /// `new` is forgotten.
    fn rename(&mut self, old: &str, new: &str) {
        self.remove(new);
        let prefix = format!("{}/", old.trim_end_matches('/'));
        let moved: Vec<(String, u64)> = self
            .by_path
            .iter()
            .filter(|(p, _)| p.as_str() == old || p.starts_with(&prefix))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (path, ino) in moved {
            let renamed = format!("{new}{}", &path[old.len()..]);
            self.by_path.remove(&path);
            self.by_path.insert(renamed.clone(), ino);
            self.by_ino.insert(ino, renamed);
        }
    }
}

pub struct CacheFuse {
    fs: Mutex<CacheFs>,
    inodes: StdMutex<InodeTable>,
}

impl CacheFuse {
    pub fn new(fs: CacheFs) -> Self {
        Self {
            fs: Mutex::new(fs),
            inodes: StdMutex::new(InodeTable::new()),
        }
    }

    fn table(&self) -> FuseResult<MutexGuard<'_, InodeTable>> {
        self.inodes.lock().map_err(|_| {
            error!("inode table lock poisoned");
            Errno::from(libc::EIO)
        })
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.table()?
            .path_of(ino)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        Ok(join_virtual(&self.path_of(parent)?, &name.to_string_lossy()))
    }

    fn lookup_ino(&self, path: &str) -> FuseResult<u64> {
        Ok(self.table()?.lookup(path))
    }

    async fn entry(&self, path: &str) -> FuseResult<ReplyEntry> {
        let attr = self.fs.lock().await.getattr(path).await?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(self.lookup_ino(path)?, &attr),
            generation: 0,
        })
    }
}

impl Filesystem for CacheFuse {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        let max_write = NonZeroU32::new(MAX_WRITE).ok_or_else(|| Errno::from(libc::EINVAL))?;
        Ok(ReplyInit { max_write })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.entry(&path).await
    }

    async fn forget(&self, _req: Request, inode: u64, nlookup: u64) {
        if let Ok(mut table) = self.table() {
            table.forget(inode, nlookup);
        }
    }

    async fn batch_forget(&self, _req: Request, inodes: &[(u64, u64)]) {
        if let Ok(mut table) = self.table() {
            for &(inode, nlookup) in inodes {
                table.forget(inode, nlookup);
            }
        }
    }

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        let attr = self.fs.lock().await.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &attr),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        let mut fs = self.fs.lock().await;
        if let Some(mode) = set_attr.mode {
            fs.chmod(&path, mode).await?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            fs.chown(&path, set_attr.uid, set_attr.gid).await?;
        }
        if let Some(size) = set_attr.size {
            fs.truncate(&path, size).await?;
        }
        let attr = fs.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &attr),
        })
    }

    async fn access(&self, _req: Request, ino: u64, mask: u32) -> FuseResult<()> {
        let path = self.path_of(ino)?;
        self.fs.lock().await.access(&path, mask as i32).await?;
        Ok(())
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.fs.lock().await.mkdir(&path, mode & !umask).await?;
        self.entry(&path).await
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        self.fs.lock().await.unlink(&path).await?;
        self.table()?.remove(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        self.fs.lock().await.rmdir(&path).await?;
        self.table()?.remove(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let old = self.child_path(parent, name)?;
        let new = self.child_path(new_parent, new_name)?;
        self.fs.lock().await.rename(&old, &new).await?;
        self.table()?.rename(&old, &new);
        Ok(())
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        let fh = self.fs.lock().await.open(&path, flags as i32).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self.fs.lock().await.read(fh, size as usize, offset).await?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let n = self.fs.lock().await.write(fh, data, offset).await?;
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let root = self.fs.lock().await.translator().root().to_path_buf();
        let st = nix::sys::statvfs::statvfs(&root).map_err(|e| Errno::from(e as i32))?;
        Ok(ReplyStatFs {
            blocks: st.blocks() as u64,
            bfree: st.blocks_free() as u64,
            bavail: st.blocks_available() as u64,
            files: st.files() as u64,
            ffree: st.files_free() as u64,
            bsize: st.block_size() as u32,
            namelen: st.name_max() as u32,
            frsize: st.fragment_size() as u32,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.fs.lock().await.release(fh).await?;
        Ok(())
    }

    async fn flush(&self, _req: Request, _inode: u64, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        self.fs.lock().await.flush(fh).await?;
        Ok(())
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, datasync: bool) -> FuseResult<()> {
        self.fs.lock().await.fsync(fh, datasync).await?;
        Ok(())
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child_path(parent, name)?;
        let mut fs = self.fs.lock().await;
        let fh = fs.create(&path, mode, flags as i32).await?;
        let attr = fs.getattr(&path).await?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr: to_fuse_attr(self.lookup_ino(&path)?, &attr),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        let attr = self.fs.lock().await.getattr(&path).await?;
        if !attr.is_dir() {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let path = self.path_of(ino)?;
        let (names, root) = {
            let mut fs = self.fs.lock().await;
            let names = fs.readdir(&path).await?;
            (names, fs.translator().clone())
        };

        let mut all = Vec::with_capacity(names.len());
        for (i, name) in names.into_iter().enumerate() {
            let (inode, kind) = match name.as_str() {
                "." => (ino, FuseFileType::Directory),
                ".." => {
                    let (parent, _) = split_virtual(&path);
                    let parent_ino = self.table()?.known_ino(&parent).unwrap_or(UNKNOWN_INO);
                    (parent_ino, FuseFileType::Directory)
                }
                _ => {
                    let child = join_virtual(&path, &name);
                    let kind = match tokio::fs::symlink_metadata(root.resolve(&child)).await {
                        Ok(m) => kind_of(FileAttr::from_metadata(&m).mode),
                        Err(_) => FuseFileType::RegularFile,
                    };
                    let child_ino = self.table()?.known_ino(&child).unwrap_or(UNKNOWN_INO);
                    (child_ino, kind)
                }
            };
            all.push(DirectoryEntry {
                inode,
                kind,
                name: OsString::from(name),
                offset: i as i64 + 1,
            });
        }

        let start = offset.max(0) as usize;
        let slice: Vec<DirectoryEntry> = all.into_iter().skip(start).collect();
        debug!(path, offset, count = slice.len(), "readdir");
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn kind_of(mode: u32) -> FuseFileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FuseFileType::Directory,
        libc::S_IFLNK => FuseFileType::Symlink,
        libc::S_IFCHR => FuseFileType::CharDevice,
        libc::S_IFBLK => FuseFileType::BlockDevice,
        libc::S_IFIFO => FuseFileType::NamedPipe,
        libc::S_IFSOCK => FuseFileType::Socket,
        _ => FuseFileType::RegularFile,
    }
}

fn to_fuse_attr(ino: u64, a: &FileAttr) -> rfuse3::raw::reply::FileAttr {
    rfuse3::raw::reply::FileAttr {
        ino,
        size: a.size,
        blocks: a.size.div_ceil(512),
        atime: Timestamp::from(a.atime),
        mtime: Timestamp::from(a.mtime),
        ctime: Timestamp::from(a.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(a.ctime),
        kind: kind_of(a.mode),
        perm: a.perm(),
        nlink: a.nlink as u32,
        uid: a.uid,
        gid: a.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}
