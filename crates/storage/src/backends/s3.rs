//! S3-compatible storage backend using the AWS SDK.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ObjectMeta, ObjectStore};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use bytes::Bytes;
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::instrument;

/// S3-compatible services ignore the region for path-style requests, but
/// the SDK requires one to sign.
const DEFAULT_REGION: &str = "us-east-1";

/// S3-compatible object store (MinIO, SeaweedFS, AWS).
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Create a new S3 backend against a custom endpoint.
    ///
    /// Path-style addressing is always used; the registry targets
    /// S3-compatible stores whose virtual-host DNS is rarely configured.
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str, bucket: &str) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "wharf-config");
        let config = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Backend {
    async fn exists(&self, key: &str) -> StorageResult<bool> {
        match self.head(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectMeta> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_not_found())
                {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::S3(Box::new(err))
                }
            })?;

        let last_modified = output
            .last_modified()
            .and_then(|dt| time::OffsetDateTime::from_unix_timestamp(dt.secs()).ok());

        Ok(ObjectMeta {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            last_modified,
            content_type: output.content_type().map(str::to_string),
        })
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_no_such_key())
                {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::S3(Box::new(err))
                }
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|err| StorageError::S3(Box::new(err)))?;
        Ok(data.into_bytes())
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_no_such_key())
                {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::S3(Box::new(err))
                }
            })?;

        let reader = output.body.into_async_read();
        let stream = ReaderStream::new(reader).map(|chunk| chunk.map_err(StorageError::Io));
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, data), fields(key = %key, len = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(data.into())
            .send()
            .await
            .map_err(|err| StorageError::S3(Box::new(err)))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StorageError::S3(Box::new(err)))?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|err| StorageError::S3(Box::new(err)))?;
        Ok(())
    }
}
