//! Result publishing: upload to an S3-compatible bucket and hand back a
//! presigned URL, or return the audio inline as base64.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use base64::Engine;
use tracing::{debug, info};

use voxpod_core::types::{AudioPayload, OutputFormat};

use crate::config::StorageConfig;
use crate::error::ServiceError;

/// Lifetime of presigned download URLs.
pub const URL_EXPIRY: Duration = Duration::from_secs(3600);

/// Minimal object-store surface used by [`ResultPublisher`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ServiceError>;

    /// Time-limited GET URL for `key`.
    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, ServiceError>;
}

/// Bucket on S3 or any S3-compatible endpoint.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    /// Build a client from the default credential chain.
    pub async fn connect(bucket: impl Into<String>, endpoint_url: Option<&str>) -> Self {
        let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::with_config(aws_sdk_s3::config::Builder::from(&shared), bucket, endpoint_url)
    }

    /// Build on an explicit client config. A custom endpoint switches to
    /// path-style addressing.
    pub fn with_config(
        mut builder: aws_sdk_s3::config::Builder,
        bucket: impl Into<String>,
        endpoint_url: Option<&str>,
    ) -> Self {
        if let Some(endpoint) = endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let bucket = bucket.into();
        info!(
            "object storage: bucket {bucket}, endpoint {}",
            endpoint_url.unwrap_or("default")
        );
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket,
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), ServiceError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                ServiceError::Storage(format!("upload of {key} failed: {}", DisplayErrorContext(&e)))
            })?;
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String, ServiceError> {
        let presigning = PresigningConfig::expires_in(expires_in)
            .map_err(|e| ServiceError::Storage(format!("invalid presign expiry: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| {
                ServiceError::Storage(format!(
                    "presigning {key} failed: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(request.uri().to_string())
    }
}

/// Decides how a finished job's audio reaches the caller.
#[derive(Clone, Default)]
pub struct ResultPublisher {
    store: Option<Arc<dyn ObjectStore>>,
}

impl ResultPublisher {
    /// Always return audio inline.
    pub fn inline() -> Self {
        Self { store: None }
    }

    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self { store: Some(store) }
    }

    /// Storage mode when a bucket is configured, inline otherwise.
    pub async fn from_config(config: &StorageConfig) -> Self {
        match &config.bucket_name {
            Some(bucket) => {
                let store = S3Store::connect(bucket.clone(), config.endpoint_url.as_deref()).await;
                Self::with_store(Arc::new(store))
            }
            None => Self::inline(),
        }
    }

    pub fn uses_storage(&self) -> bool {
        self.store.is_some()
    }

    pub async fn publish(
        &self,
        audio: Vec<u8>,
        format: OutputFormat,
    ) -> Result<AudioPayload, ServiceError> {
        let Some(store) = &self.store else {
            return Ok(AudioPayload::Base64(
                base64::engine::general_purpose::STANDARD.encode(&audio),
            ));
        };

        let key = object_key(format);
        let size = audio.len();
        store.put(&key, audio, format.content_type()).await?;
        let url = store.presign_get(&key, URL_EXPIRY).await?;
        debug!("uploaded {size} bytes as {key}");
        Ok(AudioPayload::Url(url))
    }
}

/// Fresh object key: `<uuid4>.<extension>`.
pub fn object_key(format: OutputFormat) -> String {
    format!("{}.{}", uuid::Uuid::new_v4(), format.extension())
}
