//! Filesystem-based blob store for local development and testing.
//!
//! Objects are plain files below a root directory; the key is the path
//! relative to the root with `/` separators.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use walkdir::WalkDir;

use super::blob::{BlobError, BlobResult, BlobStore, ObjectKey};

#[derive(Debug, Clone)]
pub struct FilesystemBlobStore {
    root: PathBuf,
}

impl FilesystemBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a key onto the filesystem, refusing keys that would leave the root.
    fn path_for(&self, key: &ObjectKey) -> BlobResult<PathBuf> {
        let relative = Path::new(key.as_str());
        if key.as_str().is_empty() {
            return Err(BlobError::InvalidKey {
                key: key.to_string(),
                reason: "empty key",
            });
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BlobError::InvalidKey {
                key: key.to_string(),
                reason: "key must be a relative path without '..'",
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn list(&self, prefix: &str) -> BlobResult<Vec<ObjectKey>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> BlobResult<Vec<ObjectKey>> {
            if !root.exists() {
                return Ok(Vec::new());
            }
            let mut keys = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| BlobError::Io {
                    operation: "list",
                    message: e.to_string(),
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    keys.push(ObjectKey::new(key));
                }
            }
            keys.sort();
            Ok(keys)
        })
        .await
        .map_err(|e| BlobError::Io {
            operation: "list",
            message: e.to_string(),
        })?
    }

    async fn get(&self, key: &ObjectKey) -> BlobResult<Bytes> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound {
                key: key.to_string(),
            }),
            Err(e) => Err(BlobError::DownloadFailed {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn download_to(&self, key: &ObjectKey, dest: &mut tokio::fs::File) -> BlobResult<u64> {
        let path = self.path_for(key)?;
        let mut source = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobError::NotFound {
                    key: key.to_string(),
                })
            }
            Err(e) => {
                return Err(BlobError::DownloadFailed {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            }
        };
        tokio::io::copy(&mut source, dest)
            .await
            .map_err(|e| BlobError::Io {
                operation: "download",
                message: e.to_string(),
            })
    }

    async fn put(&self, key: &ObjectKey, data: Bytes) -> BlobResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BlobError::Io {
                    operation: "put",
                    message: e.to_string(),
                })?;
        }
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| BlobError::Io {
                operation: "put",
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_list_get_roundtrip_under_prefix() {
        let dir = tempdir().expect("Failed to create temporary directory");
        let store = FilesystemBlobStore::new(dir.path());

        store.put(&ObjectKey::new("offers/mob/2.gz"), Bytes::from_static(b"b")).await.unwrap();
        store.put(&ObjectKey::new("offers/mob/1.gz"), Bytes::from_static(b"a")).await.unwrap();
        store.put(&ObjectKey::new("offers/zed/1.gz"), Bytes::from_static(b"z")).await.unwrap();

        let keys = store.list("offers/mob/").await.unwrap();
        assert_eq!(
            keys,
            vec![ObjectKey::new("offers/mob/1.gz"), ObjectKey::new("offers/mob/2.gz")]
        );
        assert_eq!(
            store.get(&ObjectKey::new("offers/zed/1.gz")).await.unwrap(),
            Bytes::from_static(b"z")
        );
    }

    #[tokio::test]
    async fn missing_root_lists_nothing_and_missing_key_is_not_found() {
        let dir = tempdir().expect("Failed to create temporary directory");
        let store = FilesystemBlobStore::new(dir.path().join("absent"));

        assert!(store.list("").await.unwrap().is_empty());
        assert!(matches!(
            store.get(&ObjectKey::new("offers/mob/1.gz")).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn download_copies_the_file_into_the_destination() {
        let dir = tempdir().expect("Failed to create temporary directory");
        let store = FilesystemBlobStore::new(dir.path().join("bucket"));
        let key = ObjectKey::new("offers/mob/1.gz");
        store.put(&key, Bytes::from(vec![7u8; 70_000])).await.unwrap();

        let spool = dir.path().join("spool");
        let mut dest = tokio::fs::File::create(&spool).await.unwrap();
        assert_eq!(store.download_to(&key, &mut dest).await.unwrap(), 70_000);
        drop(dest);
        assert_eq!(std::fs::read(&spool).unwrap(), vec![7u8; 70_000]);

        let mut dest = tokio::fs::File::create(&spool).await.unwrap();
        assert!(matches!(
            store.download_to(&ObjectKey::new("offers/mob/2.gz"), &mut dest).await,
            Err(BlobError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn refuses_keys_outside_root() {
        let dir = tempdir().expect("Failed to create temporary directory");
        let store = FilesystemBlobStore::new(dir.path());
        let err = store.get(&ObjectKey::new("../etc/passwd")).await;
        assert!(matches!(err, Err(BlobError::InvalidKey { .. })));
    }
}
