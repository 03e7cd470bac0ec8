//! Least-frequently-used content cache.
//!
//! Each cached file is a full copy of the backing file stored as
//! `cache_<md5(virtual path)>` under the cache directory, together with the
//! attribute snapshot taken when it was admitted. Every hit bumps the entry's
//! frequency; admission evicts the lowest-frequency entries (oldest admitted
//! first on ties) until the new file fits.
//!
//! Invariants:
//! - an entry is tracked iff its cache file exists on disk;
//! - `total_bytes` is the sum of the tracked cache file sizes and stays within
//!   `capacity` once an admission completes;
//! - no entry is larger than half of `capacity`.
//!
//! Files named `cache_*` left over from a previous run are adopted on start
//! with frequency 0 and keyed by their own file name. The virtual path that
//! produced them cannot be recovered from the hash, so they never hit; they
//! only hold space until they are evicted or overwritten by an `add` of the
//! path that hashes to the same name.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::vfs::attr::FileAttr;

pub const CACHE_FILE_PREFIX: &str = "cache_";

#[derive(Clone, Debug)]
struct CacheEntry {
    file_path: PathBuf,
    size: u64,
    frequency: u64,
    seq: u64,
    attr: Option<FileAttr>,
}

pub struct FrequencyCache {
    cache_dir: PathBuf,
    capacity: u64,
    total_bytes: u64,
    // virtual path (or cache file name for adopted files) -> entry
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

impl FrequencyCache {
    /// Open the cache rooted at `cache_dir`, adopting leftover cache files.
    pub async fn new<P: AsRef<Path>>(cache_dir: P, capacity: u64) -> io::Result<Self> {
        let cache_dir = cache_dir.as_ref().to_path_buf();
        fs::create_dir_all(&cache_dir).await?;
        let mut cache = Self {
            cache_dir,
            capacity,
            total_bytes: 0,
            entries: HashMap::new(),
            next_seq: 0,
        };
        cache.adopt_existing().await?;
        info!(
            capacity,
            adopted = cache.entries.len(),
            "initialized LFU cache at {}",
            cache.cache_dir.display()
        );
        Ok(cache)
    }

    async fn adopt_existing(&mut self) -> io::Result<()> {
        let mut dir = fs::read_dir(&self.cache_dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let Some(name) = item.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if !name.starts_with(CACHE_FILE_PREFIX) {
                continue;
            }
            let meta = match item.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                Err(e) => {
                    warn!("cannot stat cache file {}: {e}", item.path().display());
                    continue;
                }
            };
            debug!("adopted cache file {name} ({} bytes)", meta.len());
            let seq = self.bump_seq();
            self.total_bytes += meta.len();
            self.entries.insert(
                name,
                CacheEntry {
                    file_path: item.path(),
                    size: meta.len(),
                    frequency: 0,
                    seq,
                    attr: None,
                },
            );
        }
        Ok(())
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Deterministic cache file name for a virtual path.
    pub fn cache_file_name(path: &str) -> String {
        format!("{CACHE_FILE_PREFIX}{:x}", md5::compute(path.as_bytes()))
    }

    fn cache_path_for(&self, path: &str) -> PathBuf {
        self.cache_dir.join(Self::cache_file_name(path))
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Current frequency counter of a tracked key.
    pub fn frequency(&self, path: &str) -> Option<u64> {
        self.entries.get(path).map(|e| e.frequency)
    }

    /// True iff `path` is tracked and its cache file is still on disk.
    pub async fn has(&self, path: &str) -> bool {
        match self.entries.get(path) {
            Some(entry) => fs::try_exists(&entry.file_path).await.unwrap_or(false),
            None => false,
        }
    }

    /// Copy `source` into the cache under `path`.
    ///
    /// Returns false without touching the cache when the source is missing,
    /// is not a regular file or is larger than half of the capacity.
    pub async fn add(&mut self, path: &str, source: &Path) -> bool {
        let meta = match fs::symlink_metadata(source).await {
            Ok(m) => m,
            Err(e) => {
                warn!("cannot add {} to cache: {e}", source.display());
                return false;
            }
        };
        if !meta.is_file() {
            debug!("not caching {path}: not a regular file");
            return false;
        }
        let size = meta.len();
        if size.saturating_mul(2) > self.capacity {
            warn!("file too large to cache: {path} ({size} bytes)");
            return false;
        }

        // Drop a stale copy of this path and an adopted file holding its name.
        self.invalidate(path).await;
        let file_name = Self::cache_file_name(path);
        if self.entries.contains_key(&file_name) {
            self.invalidate(&file_name).await;
        }

        while self.total_bytes + size > self.capacity && !self.entries.is_empty() {
            self.evict_one().await;
        }

        let cache_path = self.cache_dir.join(&file_name);
        let copied = match fs::copy(source, &cache_path).await {
            Ok(n) => n,
            Err(e) => {
                warn!("error adding {path} to cache: {e}");
                let _ = fs::remove_file(&cache_path).await;
                return false;
            }
        };

        // The source may have grown since it was stat'ed.
        if copied.saturating_mul(2) > self.capacity {
            warn!("file too large to cache: {path} ({copied} bytes copied)");
            remove_cache_file(&cache_path).await;
            return false;
        }
        while self.total_bytes + copied > self.capacity && !self.entries.is_empty() {
            self.evict_one().await;
        }

        let seq = self.bump_seq();
        self.total_bytes += copied;
        self.entries.insert(
            path.to_string(),
            CacheEntry {
                file_path: cache_path,
                size: copied,
                frequency: 1,
                seq,
                attr: Some(FileAttr::from_metadata(&meta)),
            },
        );
        debug!("added {path} to cache ({copied} bytes)");
        true
    }

    /// Read up to `length` bytes at `offset` from the cached copy.
    ///
    /// `None` is a miss. Reads past the end of the file return fewer bytes,
    /// possibly none.
    pub async fn read(&mut self, path: &str, length: usize, offset: u64) -> Option<Vec<u8>> {
        if !self.has(path).await {
            return None;
        }
        let entry = self.entries.get_mut(path)?;
        entry.frequency += 1;
        match read_range(&entry.file_path, length, offset).await {
            Ok(buf) => Some(buf),
            Err(e) => {
                warn!("error reading {path} from cache: {e}");
                None
            }
        }
    }

    /// Attribute snapshot taken when `path` was admitted.
    pub async fn get_attr(&mut self, path: &str) -> Option<FileAttr> {
        if !self.has(path).await {
            return None;
        }
        let entry = self.entries.get_mut(path)?;
        let attr = entry.attr?;
        entry.frequency += 1;
        Some(attr)
    }

    /// Forget `path` and delete its cache file. No-op for unknown paths.
    pub async fn invalidate(&mut self, path: &str) {
        let Some(entry) = self.entries.remove(path) else {
            return;
        };
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        remove_cache_file(&entry.file_path).await;
        debug!("invalidated {path} in cache");
    }

    /// Invalidate `path` and every entry below it.
    pub async fn invalidate_tree(&mut self, path: &str) {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let keys: Vec<String> = self
            .entries
            .keys()
            .filter(|k| k.as_str() == path || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in keys {
            self.invalidate(&key).await;
        }
    }

    /// Drop every entry and its cache file.
    pub async fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            remove_cache_file(&entry.file_path).await;
        }
        self.total_bytes = 0;
        info!("cache cleared");
    }

    /// Evict the least frequently used entry, oldest admission first on ties.
    async fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, e)| (e.frequency, e.seq))
            .map(|(k, _)| k.clone());
        let Some(key) = victim else {
            return;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.total_bytes = self.total_bytes.saturating_sub(entry.size);
            remove_cache_file(&entry.file_path).await;
            debug!(
                frequency = entry.frequency,
                "evicted {key} from cache ({} bytes)", entry.size
            );
        }
    }
}

async fn remove_cache_file(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("error removing cache file {}: {e}", path.display()),
    }
}

async fn read_range(path: &Path, length: usize, offset: u64) -> io::Result<Vec<u8>> {
    let mut f = fs::File::open(path).await?;
    f.seek(SeekFrom::Start(offset)).await?;
    let mut buf = Vec::with_capacity(length.min(1 << 20));
    f.take(length as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}
