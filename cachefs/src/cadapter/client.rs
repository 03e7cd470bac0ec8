//! Object store abstraction.
//!
//! Keys are flat `/`-separated strings such as `objects/<sha256>`; values are
//! opaque byte blobs (possibly encrypted by the caller).

use async_trait::async_trait;

pub type BackendResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    async fn put_object(&self, key: &str, data: &[u8]) -> BackendResult<()>;

    /// `Ok(None)` when the key does not exist.
    async fn get_object(&self, key: &str) -> BackendResult<Option<Vec<u8>>>;

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        Ok(self.get_object(key).await?.is_some())
    }
}
