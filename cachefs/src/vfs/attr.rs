use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// POSIX attribute snapshot of a backing file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAttr {
    pub atime: SystemTime,
    pub ctime: SystemTime,
    pub mtime: SystemTime,
    pub gid: u32,
    pub mode: u32,
    pub nlink: u64,
    pub size: u64,
    pub uid: u32,
}

impl FileAttr {
    pub fn from_metadata(m: &Metadata) -> Self {
        Self {
            atime: to_system_time(m.atime(), m.atime_nsec()),
            ctime: to_system_time(m.ctime(), m.ctime_nsec()),
            mtime: to_system_time(m.mtime(), m.mtime_nsec()),
            gid: m.gid(),
            mode: m.mode(),
            nlink: m.nlink(),
            size: m.size(),
            uid: m.uid(),
        }
    }

    pub fn is_dir(&self) -> bool {
        (self.mode & libc::S_IFMT as u32) == libc::S_IFDIR as u32
    }

    pub fn is_symlink(&self) -> bool {
        (self.mode & libc::S_IFMT as u32) == libc::S_IFLNK as u32
    }

    /// Permission bits without the file type.
    pub fn perm(&self) -> u16 {
        (self.mode & 0o7777) as u16
    }
}

fn to_system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs.clamp(0, 999_999_999) as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Whole seconds since the epoch, as stored by the metadata store.
pub fn unix_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
