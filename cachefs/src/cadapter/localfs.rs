//! Directory-backed ObjectBackend.

use crate::cadapter::client::{BackendResult, ObjectBackend};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt};

pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectBackend for LocalFsBackend {
    async fn put_object(&self, key: &str, data: &[u8]) -> BackendResult<()> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        // Readers never observe a partially written object.
        let tmp = path.with_extension("part");
        let mut f = fs::File::create(&tmp).await?;
        f.write_all(data).await?;
        f.flush().await?;
        f.sync_all().await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match fs::read(path).await {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        Ok(fs::try_exists(self.path_for(key)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tmp.path());

        assert!(!backend.exists("objects/abc").await.unwrap());
        assert!(backend.get_object("objects/abc").await.unwrap().is_none());

        backend.put_object("objects/abc", b"hello").await.unwrap();
        assert!(backend.exists("objects/abc").await.unwrap());
        assert_eq!(
            backend.get_object("objects/abc").await.unwrap().unwrap(),
            b"hello"
        );
        assert!(!tmp.path().join("objects/abc.part").exists());

        backend.put_object("objects/abc", b"again").await.unwrap();
        assert_eq!(
            backend.get_object("objects/abc").await.unwrap().unwrap(),
            b"again"
        );
    }
}
