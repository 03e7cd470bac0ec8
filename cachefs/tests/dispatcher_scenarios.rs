use std::path::{Path, PathBuf};
use std::sync::Arc;

use cachefs::meta::InMemoryMetaStore;
use cachefs::vfs::cache::FrequencyCache;
use cachefs::vfs::fs::CacheFs;
use cachefs::vfs::path::PathTranslator;
use tempfile::TempDir;

struct Mounted {
    _tmp: TempDir,
    storage: PathBuf,
    meta: Arc<InMemoryMetaStore>,
    fs: CacheFs,
}

async fn mounted(capacity: Option<u64>) -> Mounted {
    let tmp = tempfile::tempdir().unwrap();
    let storage = tmp.path().join("storage");
    std::fs::create_dir_all(&storage).unwrap();
    let cache = match capacity {
        Some(c) => Some(FrequencyCache::new(tmp.path().join("cache"), c).await.unwrap()),
        None => None,
    };
    let meta = Arc::new(InMemoryMetaStore::new());
    let fs = CacheFs::new(PathTranslator::new(&storage), cache, meta.clone());
    Mounted {
        _tmp: tmp,
        storage,
        meta,
        fs,
    }
}

fn put(storage: &Path, name: &str, len: usize) {
    std::fs::write(storage.join(name), vec![b'x'; len]).unwrap();
}

impl Mounted {
    async fn cached(&self, path: &str) -> bool {
        self.fs.cache().unwrap().has(path).await
    }

    fn total(&self) -> u64 {
        self.fs.cache().unwrap().total_bytes()
    }

    /// Open read-only and close again, leaving whatever the open cached.
    async fn touch(&mut self, path: &str) {
        let fh = self.fs.open(path, libc::O_RDONLY).await.unwrap();
        self.fs.release(fh).await.unwrap();
    }
}

#[tokio::test]
async fn test_second_large_file_evicts_first() {
    let mut m = mounted(Some(1024)).await;
    put(&m.storage, "a", 700);
    put(&m.storage, "b", 700);

    m.touch("/a").await;
    assert!(m.cached("/a").await);
    assert_eq!(m.total(), 700);

    m.touch("/b").await;
    assert!(!m.cached("/a").await);
    assert!(m.cached("/b").await);
    assert_eq!(m.total(), 700);
}

#[tokio::test]
async fn test_oversized_file_is_served_uncached() {
    let mut m = mounted(Some(1024)).await;
    put(&m.storage, "big", 2000);

    let fh = m.fs.open("/big", libc::O_RDONLY).await.unwrap();
    assert!(!m.cached("/big").await);
    assert_eq!(m.total(), 0);

    let data = m.fs.read(fh, 4096, 0).await.unwrap();
    assert_eq!(data.len(), 2000);
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_read_past_end_of_cached_file_is_empty() {
    let mut m = mounted(Some(1024)).await;
    std::fs::write(m.storage.join("a"), b"Test content").unwrap();

    let fh = m.fs.open("/a", libc::O_RDONLY).await.unwrap();
    assert!(m.cached("/a").await);
    assert!(m.fs.read(fh, 5, 1000).await.unwrap().is_empty());
    assert_eq!(m.fs.read(fh, 4, 0).await.unwrap(), b"Test");
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_rename_drops_old_entry_and_open_repopulates() {
    let mut m = mounted(Some(1024)).await;
    std::fs::write(m.storage.join("a"), b"Test content").unwrap();
    m.touch("/a").await;
    assert!(m.cached("/a").await);

    m.fs.rename("/a", "/b").await.unwrap();
    assert!(!m.cached("/a").await);
    assert!(!m.cached("/b").await);

    let fh = m.fs.open("/b", libc::O_RDONLY).await.unwrap();
    assert!(m.cached("/b").await);
    assert_eq!(m.fs.read(fh, 64, 0).await.unwrap(), b"Test content");
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_write_invalidates_only_written_path() {
    let mut m = mounted(Some(1024)).await;
    for (path, body) in [("/a", b"aaaa"), ("/b", b"bbbb")] {
        let fh = m.fs.create(path, 0o644, libc::O_WRONLY).await.unwrap();
        m.fs.write(fh, body, 0).await.unwrap();
        m.fs.release(fh).await.unwrap();
    }
    let version = m.meta.record("/a").unwrap().version;
    m.touch("/a").await;
    m.touch("/b").await;

    let fh = m.fs.open("/a", libc::O_RDWR).await.unwrap();
    assert_eq!(m.fs.write(fh, b"AA", 0).await.unwrap(), 2);
    m.fs.release(fh).await.unwrap();

    assert!(!m.cached("/a").await);
    assert!(m.cached("/b").await);

    // The next read-only open sees the new bytes, not the evicted copy.
    let fh = m.fs.open("/a", libc::O_RDONLY).await.unwrap();
    assert_eq!(m.fs.read(fh, 16, 0).await.unwrap(), b"AAaa");
    m.fs.release(fh).await.unwrap();

    let rec = m.meta.record("/a").unwrap();
    assert!(rec.needs_sync);
    assert_eq!(rec.size, 4);
    assert!(rec.version > version);
}

#[tokio::test]
async fn test_frequently_read_entry_survives_eviction() {
    let mut m = mounted(Some(1024)).await;
    put(&m.storage, "hot", 400);
    put(&m.storage, "cold", 400);
    put(&m.storage, "new", 400);

    let fh = m.fs.open("/hot", libc::O_RDONLY).await.unwrap();
    for _ in 0..3 {
        m.fs.read(fh, 10, 0).await.unwrap();
    }
    m.fs.release(fh).await.unwrap();
    m.touch("/cold").await;

    m.touch("/new").await;
    assert!(m.cached("/hot").await);
    assert!(!m.cached("/cold").await);
    assert!(m.cached("/new").await);
    assert_eq!(m.total(), 800);
}

#[tokio::test]
async fn test_total_bytes_never_exceeds_capacity() {
    let capacity = 1024;
    let mut m = mounted(Some(capacity)).await;
    let mut seed: u64 = 7;
    for i in 0..40 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let len = (seed >> 33) as usize % (capacity as usize / 2 + 1);
        let name = format!("f{i}");
        put(&m.storage, &name, len);
        m.touch(&format!("/{name}")).await;
        assert!(m.total() <= capacity, "total {} after {name}", m.total());
    }
}

#[tokio::test]
async fn test_directory_rename_drops_cached_children() {
    let mut m = mounted(Some(1024)).await;
    m.fs.mkdir("/d", 0o755).await.unwrap();
    std::fs::write(m.storage.join("d/x"), b"xx").unwrap();
    std::fs::write(m.storage.join("dx"), b"yy").unwrap();
    m.touch("/d/x").await;
    m.touch("/dx").await;

    m.fs.rename("/d", "/e").await.unwrap();
    assert!(!m.cached("/d/x").await);
    assert!(m.cached("/dx").await);

    let fh = m.fs.open("/e/x", libc::O_RDONLY).await.unwrap();
    assert_eq!(m.fs.read(fh, 8, 0).await.unwrap(), b"xx");
    m.fs.release(fh).await.unwrap();
}

#[tokio::test]
async fn test_without_cache_reads_come_from_backing_store() {
    let mut m = mounted(None).await;
    std::fs::write(m.storage.join("a"), b"Test content").unwrap();

    let fh = m.fs.open("/a", libc::O_RDONLY).await.unwrap();
    assert!(m.fs.cache().is_none());
    assert_eq!(m.fs.read(fh, 7, 5).await.unwrap(), b"content");
    assert!(m.fs.read(fh, 5, 1000).await.unwrap().is_empty());
    m.fs.release(fh).await.unwrap();

    let attr = m.fs.getattr("/a").await.unwrap();
    assert_eq!(attr.size, 12);
    assert_eq!(m.meta.record("/a").unwrap().size, 12);
}

#[tokio::test]
async fn test_unlink_forgets_file_everywhere() {
    let mut m = mounted(Some(1024)).await;
    let fh = m.fs.create("/gone", 0o644, libc::O_WRONLY).await.unwrap();
    m.fs.write(fh, b"bye", 0).await.unwrap();
    m.fs.release(fh).await.unwrap();
    m.touch("/gone").await;
    assert!(m.cached("/gone").await);

    m.fs.unlink("/gone").await.unwrap();
    assert!(!m.cached("/gone").await);
    assert!(m.meta.record("/gone").is_none());
    assert!(!m.storage.join("gone").exists());
    assert!(m.fs.getattr("/gone").await.is_err());
}
