use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectStore;
use tokio::sync::Semaphore;
use tracing::{instrument, trace};
use url::Url;

use crate::UploadError;

/// Durable object upload. `Ok(())` means the object is retrievable under
/// `key` forever; transport retries happen below this interface.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), UploadError>;
}

/// In-memory uploader for tests: optional injected failures and random
/// per-object delays to shake out completion-ordering races.
#[derive(Clone)]
pub struct MemoryUploader {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    failing_keys: Arc<RwLock<HashSet<String>>>,
    fail_everything: Arc<RwLock<bool>>,
    permits: Arc<Semaphore>,
    max_delay: Option<Duration>,
}

impl Default for MemoryUploader {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUploader {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            failing_keys: Arc::new(RwLock::new(HashSet::new())),
            fail_everything: Arc::new(RwLock::new(false)),
            permits: Arc::new(Semaphore::new(16)),
            max_delay: None,
        }
    }

    /// Make every upload fail from now on.
    pub fn fail_everything(&self) {
        *self.fail_everything.write().unwrap() = true;
    }

    /// Delay each upload by a random duration up to `max_delay`.
    pub fn with_random_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Make every upload of `key` fail.
    pub fn fail_key(&self, key: &str) {
        self.failing_keys.write().unwrap().insert(key.to_owned());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.read().unwrap().contains_key(key)
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().unwrap().get(key).cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.read().unwrap().len()
    }
}

#[async_trait]
impl Uploader for MemoryUploader {
    #[instrument(skip(self), fields(key = %key))]
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| UploadError::ShuttingDown)?;

        if let Some(max_delay) = self.max_delay {
            let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0..=max_delay.as_millis());
            tokio::time::sleep(Duration::from_millis(jitter as u64)).await;
        }

        if *self.fail_everything.read().unwrap() || self.failing_keys.read().unwrap().contains(key)
        {
            return Err(UploadError::Backend {
                key: key.to_owned(),
                reason: "injected failure".to_owned(),
            });
        }

        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| UploadError::Backend {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        self.objects.write().unwrap().insert(key.to_owned(), data);
        trace!("stored object");
        Ok(())
    }
}

/// Uploads into any object storage supported by the [object_store] crate.
/// Any path suffix of the URL becomes the base path within the store.
pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    base_path: object_store::path::Path,
    permits: Arc<Semaphore>,
}

impl ObjectStoreUploader {
    pub fn parse_url(url: &Url, concurrent_uploads: usize) -> Result<Self, object_store::Error> {
        let (store, base_path) = object_store::parse_url(url)?;
        Ok(Self {
            store: Arc::from(store),
            base_path,
            permits: Arc::new(Semaphore::new(concurrent_uploads)),
        })
    }
}

#[async_trait]
impl Uploader for ObjectStoreUploader {
    #[instrument(skip(self), fields(key = %key))]
    async fn upload(&self, local_path: &Path, key: &str) -> Result<(), UploadError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| UploadError::ShuttingDown)?;

        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| UploadError::Backend {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        let full_path =
            object_store::path::Path::from(format!("{}/{}", self.base_path.as_ref(), key));
        self.store
            .put(&full_path, Bytes::from(data).into())
            .await
            .map_err(|e| UploadError::Backend {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        trace!("stored object");
        Ok(())
    }
}
