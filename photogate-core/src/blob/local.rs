//! Local-filesystem blob backend.
//!
//! Lays keys out under `<root>/original/...` and `<root>/processed/...`.
//! Read URLs are plain links under the application's `/uploads` static
//! mount, so "signing" here is just URL construction.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tracing::debug;

use crate::blob::{validate_key, BlobStore, Namespace};
use crate::error::{AdmissionError, Result};

#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    /// Base URL the static-file collaborator serves `root` under, e.g.
    /// `http://localhost:3000/uploads`.
    public_base: String,
}

impl LocalBlobStore {
    pub fn new(root: PathBuf, public_base: impl Into<String>) -> Self {
        Self {
            root,
            public_base: public_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(
        &self,
        ns: Namespace,
        key: &str,
        bytes: Bytes,
        _content_type: &str,
    ) -> Result<String> {
        let stored_key = ns.key(key);
        let path = self.path_for(&stored_key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, &bytes).await?;
        debug!(key = %stored_key, size = bytes.len(), "stored blob");
        Ok(stored_key)
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(AdmissionError::NotFound(format!("blob {key}")))
            }
            Err(e) => Err(AdmissionError::Unavailable(format!("blob read {key}: {e}"))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AdmissionError::Unavailable(format!(
                "blob delete {key}: {e}"
            ))),
        }
    }

    async fn signed_url(&self, key: &str, _ttl: Duration) -> Result<String> {
        validate_key(key)?;
        Ok(format!("{}/{}", self.public_base, key))
    }
}
