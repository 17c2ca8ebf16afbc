//! Storage-type-agnostic object store for image bytes.
//!
//! Keys live in two namespaces: `original/` for uploads as received and
//! `processed/` for canonical derivatives. Backends must preserve byte-exact
//! round-trips; puts are idempotent by key and deletes are silent on missing
//! objects.

pub mod local;
#[cfg(feature = "s3")]
pub mod s3;

pub use local::LocalBlobStore;
#[cfg(feature = "s3")]
pub use s3::S3BlobStore;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::error::{AdmissionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Original,
    Processed,
}

impl Namespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Original => "original",
            Namespace::Processed => "processed",
        }
    }

    /// Builds the full storage key for a leaf name.
    pub fn key(&self, leaf: &str) -> String {
        format!("{}/{}", self.prefix(), leaf)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores bytes under `ns/key`; idempotent by key. Returns the stable
    /// namespaced key callers use for `get`/`delete`/`signed_url`.
    async fn put(
        &self,
        ns: Namespace,
        key: &str,
        bytes: Bytes,
        content_type: &str,
    ) -> Result<String>;

    /// Fails with `NotFound` for a missing key, `Unavailable` otherwise.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Idempotent; silent on missing keys.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Time-bounded read URL. The local backend serves a plain URL whose
    /// lifetime is unbounded.
    async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Rejects keys that could escape the storage root.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
        return Err(AdmissionError::InvalidRequest(format!(
            "invalid storage key: {key}"
        )));
    }
    Ok(())
}
