//! S3-compatible blob backend.
//!
//! Same `original/` / `processed/` key layout as the local backend, rooted
//! at the configured bucket. Read URLs are presigned GETs.

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

use crate::blob::{validate_key, BlobStore, Namespace};
use crate::error::{AdmissionError, Result};

#[derive(Debug, Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Builds a client from the ambient AWS credential chain, with an
    /// optional region override.
    pub async fn from_env(bucket: impl Into<String>, region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region));
        }
        let config = loader.load().await;
        Self::new(Client::new(&config), bucket)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        ns: Namespace,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String> {
        let stored_key = ns.key(key);
        validate_key(&stored_key)?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&stored_key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| AdmissionError::Unavailable(format!("s3 put {stored_key}: {e}")))?;
        debug!(key = %stored_key, bucket = %self.bucket, "stored blob");
        Ok(stored_key)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        validate_key(key)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    AdmissionError::NotFound(format!("blob {key}"))
                } else {
                    AdmissionError::Unavailable(format!("s3 get {key}: {e}"))
                }
            })?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| AdmissionError::Unavailable(format!("s3 body {key}: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        // DeleteObject succeeds on missing keys, which is exactly the
        // idempotency the contract asks for.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| AdmissionError::Unavailable(format!("s3 delete {key}: {e}")))?;
        Ok(())
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        validate_key(key)?;
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| AdmissionError::Internal(format!("presigning config: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| AdmissionError::Unavailable(format!("s3 presign {key}: {e}")))?;
        Ok(request.uri().to_string())
    }
}
