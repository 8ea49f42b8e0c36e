//! S3-based blob store for production inventory buckets.
//!
//! Works against AWS S3 or S3-compatible services (`MinIO`, `LocalStack`).
//! Credentials come from the standard AWS chain.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use super::blob::{BlobError, BlobResult, BlobStore, ObjectKey};

#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub bucket: String,
    /// Falls back to the region of the AWS environment.
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    /// Local S3 emulators only answer path-style requests.
    pub force_path_style: bool,
}

impl S3Config {
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    config: S3Config,
}

impl S3BlobStore {
    /// # Errors
    ///
    /// An empty bucket name is a [`BlobError::InvalidKey`].
    pub async fn new(config: S3Config) -> BlobResult<Self> {
        if config.bucket.is_empty() {
            return Err(BlobError::InvalidKey {
                key: String::new(),
                reason: "bucket name must not be empty",
            });
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let aws_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            config,
        })
    }

    #[must_use]
    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn open_object(&self, key: &ObjectKey) -> BlobResult<GetObjectOutput> {
        self.client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key.as_str())
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    BlobError::NotFound {
                        key: key.to_string(),
                    }
                } else {
                    BlobError::DownloadFailed {
                        key: key.to_string(),
                        message: format!("S3 GetObject failed: {service}"),
                    }
                }
            })
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn list(&self, prefix: &str) -> BlobResult<Vec<ObjectKey>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request.send().await.map_err(|e| BlobError::Io {
                operation: "list",
                message: format!("S3 ListObjectsV2 failed: {e}"),
            })?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(ObjectKey::new(key));
                }
            }

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &ObjectKey) -> BlobResult<Bytes> {
        let response = self.open_object(key).await?;
        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| BlobError::DownloadFailed {
                key: key.to_string(),
                message: format!("failed to read S3 response body: {e}"),
            })?
            .into_bytes();

        Ok(bytes)
    }

    async fn download_to(&self, key: &ObjectKey, dest: &mut tokio::fs::File) -> BlobResult<u64> {
        let mut body = self.open_object(key).await?.body;
        let mut written = 0u64;
        loop {
            let chunk = body.try_next().await.map_err(|e| BlobError::DownloadFailed {
                key: key.to_string(),
                message: format!("failed to read S3 response body: {e}"),
            })?;
            let Some(chunk) = chunk else {
                break;
            };
            dest.write_all(&chunk).await.map_err(|e| BlobError::Io {
                operation: "download",
                message: e.to_string(),
            })?;
            written += chunk.len() as u64;
        }
        dest.flush().await.map_err(|e| BlobError::Io {
            operation: "download",
            message: e.to_string(),
        })?;
        Ok(written)
    }

    async fn put(&self, key: &ObjectKey, data: Bytes) -> BlobResult<()> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key.as_str())
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| BlobError::Io {
                operation: "put",
                message: format!("S3 PutObject failed: {e}"),
            })?;
        Ok(())
    }
}
