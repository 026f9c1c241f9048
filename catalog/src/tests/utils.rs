use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use canopy_cas::{CasDigest, MemoryUploader};

use crate::manager::{FetchError, Fetcher};

/// Serves catalog snapshots back out of a [MemoryUploader], which is where
/// commits put them in these tests.
pub struct MemoryFetcher {
    uploader: Arc<MemoryUploader>,
    scratch: tempfile::TempDir,
}

impl MemoryFetcher {
    pub fn new(uploader: Arc<MemoryUploader>) -> Self {
        Self {
            uploader,
            scratch: tempfile::tempdir().expect("create fetcher scratch dir"),
        }
    }
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&self, digest: &CasDigest) -> Result<PathBuf, FetchError> {
        let data = self
            .uploader
            .object(&digest.catalog_key())
            .ok_or_else(|| FetchError {
                digest: digest.to_hex(),
                reason: "object not found".to_string(),
            })?;
        let path = self.scratch.path().join(digest.to_hex());
        std::fs::write(&path, data).map_err(|e| FetchError {
            digest: digest.to_hex(),
            reason: e.to_string(),
        })?;
        Ok(path)
    }
}
