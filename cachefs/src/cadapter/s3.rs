//! S3-compatible ObjectBackend on aws-sdk-s3: multipart upload for large
//! objects, retries with exponential backoff and Content-MD5 checks.

use crate::cadapter::client::{BackendResult, ObjectBackend};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use std::sync::Arc;
use tokio::{
    io::AsyncReadExt,
    sync::Semaphore,
    time::{Duration, sleep},
};

#[derive(Debug, Clone)]
pub struct S3Config {
    /// Objects above this size go through multipart upload.
    pub part_size: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub initial_retry_delay_ms: u64,
    pub region: String,
    /// Custom endpoint for MinIO and friends; path-style addressing is used
    /// whenever this is set.
    pub endpoint: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            part_size: 8 * 1024 * 1024,
            max_concurrency: 8,
            max_retries: 3,
            initial_retry_delay_ms: 100,
            region: "us-east-1".to_string(),
            endpoint: None,
        }
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    config: S3Config,
    // Keys known to exist remotely. Content-addressed keys never change, so
    // positive answers can be cached.
    known_keys: moka::future::Cache<String, ()>,
}

impl S3Backend {
    pub async fn new(bucket: impl Into<String>, config: S3Config) -> BackendResult<Self> {
        let mut loader = aws_config::ConfigLoader::default()
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let shared = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.endpoint.is_some())
            .build();
        let client = Client::from_conf(s3_conf);
        let known_keys = moka::future::Cache::builder().max_capacity(100_000).build();
        Ok(Self {
            client,
            bucket: bucket.into(),
            config,
            known_keys,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.initial_retry_delay_ms * 2u64.pow(attempt - 1))
    }

    async fn execute_with_retry<T, F, Fut, E>(
        &self,
        operation: F,
        operation_name: &'static str,
    ) -> BackendResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        let mut attempt = 0;
        let max_retries = self.config.max_retries;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt > max_retries {
                        return Err(Box::new(std::io::Error::other(format!(
                            "{operation_name} failed after {max_retries} retries: {e}"
                        ))));
                    }
                    tracing::debug!(operation_name, attempt, error = %e, "s3 request failed, retrying");
                    sleep(self.retry_delay(attempt)).await;
                }
            }
        }
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
        semaphore: Arc<Semaphore>,
    ) -> BackendResult<(i32, Option<String>)> {
        let _permit = semaphore.acquire().await?;
        let checksum = Self::md5_base64(&data);

        let operation = || async {
            self.client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_md5(checksum.clone())
                .body(data.clone().into())
                .send()
                .await
        };

        self.execute_with_retry(operation, "upload_part")
            .await
            .map(|resp| (part_number, resp.e_tag().map(|s| s.to_string())))
    }

    async fn put_multipart(&self, key: &str, data: &[u8]) -> BackendResult<()> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();
        let sem = Arc::new(Semaphore::new(self.config.max_concurrency));

        let parts = data
            .chunks(self.config.part_size)
            .enumerate()
            .map(|(i, chunk)| {
                self.upload_part(key, &upload_id, i as i32 + 1, chunk.to_vec(), sem.clone())
            });

        let results = match futures::future::try_join_all(parts).await {
            Ok(v) => v,
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(key, error = %abort, "failed to abort multipart upload");
                }
                return Err(e);
            }
        };

        let completed_parts = results
            .into_iter()
            .map(|(pn, etag)| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(pn)
                    .set_e_tag(etag)
                    .build()
            })
            .collect::<Vec<_>>();

        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for S3Backend {
    async fn put_object(&self, key: &str, data: &[u8]) -> BackendResult<()> {
        if data.len() <= self.config.part_size {
            let checksum = Self::md5_base64(data);
            let operation = || async {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(data.to_owned().into())
                    .content_md5(checksum.clone())
                    .send()
                    .await
            };
            self.execute_with_retry(operation, "put_object").await?;
        } else {
            self.put_multipart(key, data).await?;
        }
        self.known_keys.insert(key.to_string(), ()).await;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> BackendResult<Option<Vec<u8>>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(o) => {
                let mut body = o.body.into_async_read();
                let mut buf = Vec::new();
                body.read_to_end(&mut buf).await?;
                self.known_keys.insert(key.to_string(), ()).await;
                Ok(Some(buf))
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    async fn exists(&self, key: &str) -> BackendResult<bool> {
        if self.known_keys.contains_key(key) {
            return Ok(true);
        }
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match resp {
            Ok(_) => {
                self.known_keys.insert(key.to_string(), ()).await;
                Ok(true)
            }
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(Box::new(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_md5_is_base64_of_digest() {
        assert_eq!(S3Backend::md5_base64(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }

    // Needs a reachable S3 endpoint, e.g.
    // CACHEFS_S3_TEST_BUCKET=main CACHEFS_S3_TEST_ENDPOINT=http://127.0.0.1:9000
    #[tokio::test]
    async fn s3_round_trip() -> BackendResult<()> {
        let Ok(bucket) = std::env::var("CACHEFS_S3_TEST_BUCKET") else {
            return Ok(());
        };
        let config = S3Config {
            endpoint: std::env::var("CACHEFS_S3_TEST_ENDPOINT").ok(),
            ..S3Config::default()
        };
        let backend = S3Backend::new(bucket, config).await?;
        let data = Vec::from("hello");
        backend.put_object("cachefs-test/hello", &data).await?;
        assert!(backend.exists("cachefs-test/hello").await?);

        let res = backend.get_object("cachefs-test/hello").await?;
        assert_eq!(res, Some(data));
        assert!(backend.get_object("cachefs-test/missing").await?.is_none());
        Ok(())
    }
}
