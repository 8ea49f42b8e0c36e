//! In-memory blob store with fault injection, for tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;

use super::blob::{BlobError, BlobResult, BlobStore, ObjectKey};

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: Mutex<BTreeMap<ObjectKey, Bytes>>,
    failing_keys: Mutex<BTreeSet<ObjectKey>>,
    fail_listing: Mutex<bool>,
}

// Poisoning is ignored: every critical section leaves the maps consistent.
fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under `key` without going through the async trait.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        locked(&self.objects).insert(ObjectKey::new(key), data.into());
    }

    /// Every `get` of `key` fails until cleared.
    pub fn fail_key(&self, key: &str) {
        locked(&self.failing_keys).insert(ObjectKey::new(key));
    }

    /// Clears every injected fault.
    pub fn clear_faults(&self) {
        locked(&self.failing_keys).clear();
        self.set_fail_listing(false);
    }

    /// Toggles listing failures.
    pub fn set_fail_listing(&self, fail: bool) {
        *locked(&self.fail_listing) = fail;
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn list(&self, prefix: &str) -> BlobResult<Vec<ObjectKey>> {
        if *locked(&self.fail_listing) {
            return Err(BlobError::Io {
                operation: "list",
                message: "simulated listing failure".to_string(),
            });
        }
        Ok(locked(&self.objects)
            .keys()
            .filter(|k| k.as_str().starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &ObjectKey) -> BlobResult<Bytes> {
        if locked(&self.failing_keys).contains(key) {
            return Err(BlobError::DownloadFailed {
                key: key.to_string(),
                message: "simulated download failure".to_string(),
            });
        }
        locked(&self.objects)
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &ObjectKey, data: Bytes) -> BlobResult<()> {
        locked(&self.objects).insert(key.clone(), data);
        Ok(())
    }
}
