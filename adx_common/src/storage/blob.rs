//! Blob store abstraction for bucket-backed channel inventory.
//!
//! Keys follow the convention `<base-key>/<channel>/<numeric>.gz`; the
//! temporary area mirrors it under `tmp_test/`.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

pub type BlobResult<T> = Result<T, BlobError>;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("download failed for {key}: {message}")]
    DownloadFailed { key: String, message: String },

    /// Empty keys, and keys escaping the root of a filesystem store.
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("I/O error: {operation}: {message}")]
    Io {
        operation: &'static str,
        message: String,
    },
}

/// Key of one object, `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last path segment of the key.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// True for `<numeric>.gz` and `<numeric>.json` objects, the only shapes
    /// channel inventory is published under.
    #[must_use]
    pub fn is_inventory_object(&self) -> bool {
        let name = self.file_name();
        let stem = name
            .strip_suffix(".gz")
            .or_else(|| name.strip_suffix(".json"));
        matches!(stem, Some(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
    }

    #[must_use]
    pub fn is_gzipped(&self) -> bool {
        self.0.ends_with(".gz")
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A bucket of inventory objects, shared by every channel fetch.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Every key starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> BlobResult<Vec<ObjectKey>>;

    async fn get(&self, key: &ObjectKey) -> BlobResult<Bytes>;

    async fn put(&self, key: &ObjectKey, data: Bytes) -> BlobResult<()>;

    /// Writes the object into `dest` and returns the number of bytes written.
    ///
    /// The provided body buffers the whole object through [`BlobStore::get`];
    /// backends that can stream override it.
    ///
    /// # Errors
    ///
    /// Fails like [`BlobStore::get`], or with [`BlobError::Io`] when `dest`
    /// rejects a write.
    async fn download_to(&self, key: &ObjectKey, dest: &mut tokio::fs::File) -> BlobResult<u64> {
        let data = self.get(key).await?;
        dest.write_all(&data).await.map_err(|e| BlobError::Io {
            operation: "download",
            message: e.to_string(),
        })?;
        Ok(data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inventory_object_shapes() {
        assert!(ObjectKey::new("offers/mob/17.gz").is_inventory_object());
        assert!(ObjectKey::new("offers/mob/0.json").is_inventory_object());
        assert!(!ObjectKey::new("offers/mob/latest.gz").is_inventory_object());
        assert!(!ObjectKey::new("offers/mob/.gz").is_inventory_object());
        assert!(!ObjectKey::new("offers/mob/17.gz.tmp").is_inventory_object());

        let key = ObjectKey::new("tmp_test/offers/mob/3.gz");
        assert_eq!(key.file_name(), "3.gz");
        assert!(key.is_gzipped());
    }

    #[tokio::test]
    async fn provided_download_writes_the_whole_object() {
        use crate::storage::MemoryBlobStore;
        use tokio::io::AsyncReadExt;

        let store = MemoryBlobStore::new();
        store.insert("offers/mob/1.json", "[]".repeat(1000));
        let spool = tempfile::NamedTempFile::new().unwrap();
        let mut dest = tokio::fs::File::from_std(spool.reopen().unwrap());

        let written = store
            .download_to(&ObjectKey::new("offers/mob/1.json"), &mut dest)
            .await
            .unwrap();
        dest.flush().await.unwrap();

        let mut copy = String::new();
        tokio::fs::File::open(spool.path())
            .await
            .unwrap()
            .read_to_string(&mut copy)
            .await
            .unwrap();
        assert_eq!(written, 2000);
        assert_eq!(copy, "[]".repeat(1000));

        let missing = store.download_to(&ObjectKey::new("offers/mob/2.json"), &mut dest).await;
        assert!(matches!(missing, Err(BlobError::NotFound { .. })));
    }
}
