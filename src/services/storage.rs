//! Raw-file persistence behind a minimal "store bytes, get a retrievable
//! reference back" seam, so the backend (local disk, remote store) is
//! swappable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{PipelineError, Result};
use crate::utils::sha256_hex;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Persist the bytes and return an opaque reference.
    async fn put(&self, tenant_id: &str, filename: &str, bytes: &[u8]) -> Result<String>;

    async fn get(&self, blob_ref: &str) -> Result<Vec<u8>>;
}

/// Filesystem-backed store. References are relative paths of the form
/// `{tenant}/{hash[0..2]}/{hash[0..8]}-{filename}` under the root, the hash
/// prefix keeping directories small.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalBlobStore { root: root.into() }
    }

    fn resolve(&self, blob_ref: &str) -> Result<PathBuf> {
        let rel = Path::new(blob_ref);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(PipelineError::BadInput(format!(
                "invalid blob reference: {blob_ref}"
            )));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, tenant_id: &str, filename: &str, bytes: &[u8]) -> Result<String> {
        let hash = sha256_hex(bytes);
        let safe_name: String = filename
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let blob_ref = format!("{}/{}/{}-{}", tenant_id, &hash[..2], &hash[..8], safe_name);

        let path = self.resolve(&blob_ref)?;
        let parent = path
            .parent()
            .ok_or_else(|| PipelineError::Other("blob path has no parent".into()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::Other(format!("create blob dir: {e}")))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| PipelineError::Other(format!("write blob: {e}")))?;
        Ok(blob_ref)
    }

    async fn get(&self, blob_ref: &str) -> Result<Vec<u8>> {
        let path = self.resolve(blob_ref)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| PipelineError::BadInput(format!("blob {blob_ref} unreadable: {e}")))
    }
}
