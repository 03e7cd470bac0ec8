//! Content-addressed replicator over an `ObjectBackend`.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::Replicator;
use crate::cadapter::ObjectBackend;
use crate::crypto::Cipher;
use crate::error::{SyncError, SyncResult};
use crate::meta::SyncOutcome;
use crate::vfs::path::PathTranslator;

const OBJECT_PREFIX: &str = "objects/";

/// Stores each file under `objects/<sha256 of plaintext>`. Identical content
/// uploads once; later files with the same hash are dedup hits.
pub struct ObjectReplicator {
    translator: PathTranslator,
    backend: Arc<dyn ObjectBackend>,
    cipher: Cipher,
}

impl ObjectReplicator {
    pub fn new(translator: PathTranslator, backend: Arc<dyn ObjectBackend>, cipher: Cipher) -> Self {
        Self {
            translator,
            backend,
            cipher,
        }
    }

    pub fn object_key(content: &[u8]) -> String {
        format!("{OBJECT_PREFIX}{}", hex::encode(Sha256::digest(content)))
    }

    async fn upload(&self, path: &str) -> SyncResult<SyncOutcome> {
        let full = self.translator.resolve(path);
        let meta = match tokio::fs::metadata(&full).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(SyncOutcome::failed(format!("file not found: {path}")));
            }
            Err(e) => return Err(e.into()),
        };
        if meta.is_dir() {
            return Ok(SyncOutcome {
                success: true,
                remote_id: None,
                error: None,
            });
        }

        let content = tokio::fs::read(&full).await?;
        let key = Self::object_key(&content);
        if self.backend.exists(&key).await? {
            tracing::info!(path, key, "content already replicated");
            return Ok(SyncOutcome::uploaded(key));
        }
        self.backend
            .put_object(&key, &self.cipher.encrypt(&content))
            .await?;
        tracing::info!(path, key, bytes = content.len(), "replicated");
        Ok(SyncOutcome::uploaded(key))
    }
}

#[async_trait]
impl Replicator for ObjectReplicator {
    async fn upload_or_update(&self, path: &str) -> SyncOutcome {
        match self.upload(path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(path, error = %e, "replication failed");
                SyncOutcome::failed(format!("error syncing {path}: {e}"))
            }
        }
    }

    async fn download(&self, path: &str, remote_id: &str) -> SyncResult<u64> {
        let sealed = self
            .backend
            .get_object(remote_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(remote_id.to_string()))?;
        let content = self.cipher.decrypt(&sealed)?;
        if remote_id.starts_with(OBJECT_PREFIX) && Self::object_key(&content) != remote_id {
            return Err(SyncError::Corrupt(remote_id.to_string()));
        }

        let full = self.translator.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = full.with_extension("cachefs-download");
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, &full).await?;
        Ok(content.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::LocalFsBackend;

    struct Fixture {
        _tmp: tempfile::TempDir,
        storage: std::path::PathBuf,
        remote: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let storage = tmp.path().join("storage");
        let remote = tmp.path().join("remote");
        std::fs::create_dir_all(&storage).unwrap();
        Fixture {
            _tmp: tmp,
            storage,
            remote,
        }
    }

    fn replicator(f: &Fixture, cipher: Cipher) -> ObjectReplicator {
        ObjectReplicator::new(
            PathTranslator::new(&f.storage),
            Arc::new(LocalFsBackend::new(&f.remote)),
            cipher,
        )
    }

    #[tokio::test]
    async fn uploads_by_content_hash_and_dedups() {
        let f = fixture();
        std::fs::write(f.storage.join("a"), b"same bytes").unwrap();
        std::fs::write(f.storage.join("b"), b"same bytes").unwrap();
        let r = replicator(&f, Cipher::disabled());

        let a = r.upload_or_update("/a").await;
        let b = r.upload_or_update("/b").await;
        assert!(a.success && b.success);
        assert_eq!(a.remote_id, b.remote_id);

        let key = a.remote_id.unwrap();
        assert_eq!(key, ObjectReplicator::object_key(b"same bytes"));
        assert_eq!(std::fs::read(f.remote.join(&key)).unwrap(), b"same bytes");
        assert_eq!(std::fs::read_dir(f.remote.join("objects")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn missing_file_and_directory() {
        let f = fixture();
        std::fs::create_dir(f.storage.join("d")).unwrap();
        let r = replicator(&f, Cipher::disabled());

        let missing = r.upload_or_update("/nope").await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("/nope"));

        let dir = r.upload_or_update("/d").await;
        assert!(dir.success);
        assert!(dir.remote_id.is_none());
    }

    #[tokio::test]
    async fn encrypted_round_trip_through_download() {
        let f = fixture();
        std::fs::write(f.storage.join("a"), b"secret text").unwrap();
        let r = replicator(&f, Cipher::from_passphrase("k"));

        let key = r.upload_or_update("/a").await.remote_id.unwrap();
        assert_ne!(std::fs::read(f.remote.join(&key)).unwrap(), b"secret text");

        let n = r.download("/restored/a", &key).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(
            std::fs::read(f.storage.join("restored/a")).unwrap(),
            b"secret text"
        );
    }

    #[tokio::test]
    async fn download_rejects_unknown_and_tampered_objects() {
        let f = fixture();
        let r = replicator(&f, Cipher::disabled());
        assert!(matches!(
            r.download("/x", "objects/missing").await,
            Err(SyncError::NotFound(_))
        ));

        let key = ObjectReplicator::object_key(b"original");
        std::fs::create_dir_all(f.remote.join("objects")).unwrap();
        std::fs::write(f.remote.join(&key), b"tampered").unwrap();
        assert!(matches!(
            r.download("/x", &key).await,
            Err(SyncError::Corrupt(_))
        ));
        assert!(!f.storage.join("x").exists());
    }
}
