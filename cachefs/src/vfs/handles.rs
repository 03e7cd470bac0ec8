//! Open-file handle table.

use std::collections::HashMap;
use std::io;
use std::path::Path;

use tokio::fs::{File, OpenOptions};

/// One open instance of a backing file.
#[derive(Debug)]
pub struct FileHandle {
    pub id: u64,
    /// Virtual path the handle was opened for; follows renames.
    pub path: String,
    pub file: File,
    pub flags: i32,
}

impl FileHandle {
    pub fn is_readable(&self) -> bool {
        self.flags & libc::O_ACCMODE != libc::O_WRONLY
    }
}

/// Ids grow monotonically from 1 and are never handed out twice.
#[derive(Debug, Default)]
pub struct HandleTable {
    next_id: u64,
    handles: HashMap<u64, FileHandle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Open `backing` with POSIX `flags` and register it for `path`.
    pub async fn open(&mut self, path: &str, backing: &Path, flags: i32) -> io::Result<u64> {
        let file = open_options(flags).open(backing).await?;
        Ok(self.insert(path, file, flags))
    }

    /// Register an already opened descriptor.
    pub fn insert(&mut self, path: &str, file: File, flags: i32) -> u64 {
        let id = self.alloc_id();
        self.handles.insert(
            id,
            FileHandle {
                id,
                path: path.to_string(),
                file,
                flags,
            },
        );
        id
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut FileHandle> {
        self.handles.get_mut(&id)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.handles.contains_key(&id)
    }

    /// Close and forget a handle. Unknown ids are ignored.
    pub fn release(&mut self, id: u64) -> Option<FileHandle> {
        self.handles.remove(&id)
    }

    /// Point handles opened under `old` (or below it) at `new`.
    pub fn rename_path(&mut self, old: &str, new: &str) {
        let prefix = format!("{}/", old.trim_end_matches('/'));
        for h in self.handles.values_mut() {
            if h.path == old {
                h.path = new.to_string();
            } else if let Some(rest) = h.path.strip_prefix(&prefix) {
                h.path = format!("{}/{rest}", new.trim_end_matches('/'));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Translate open(2) flags into tokio open options.
pub fn open_options(flags: i32) -> OpenOptions {
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    opts.custom_flags(flags & !libc::O_ACCMODE);
    opts
}
