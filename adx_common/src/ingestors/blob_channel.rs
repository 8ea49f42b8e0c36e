//! # Blob Store Channel Fetcher
//!
//! Reads a channel's inventory published as numbered objects in a bucket:
//! `<base-key>/<channel>/<n>.gz` (or `.json`). Every object is a JSON array of
//! offers. Objects are downloaded straight into a temporary file, then
//! gunzipped when needed and decoded off the async runtime with a cap on the
//! decoded size. One bad object is skipped, not fatal.

use std::collections::BTreeSet;
use std::io::{BufReader, Read};
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{FetchError, FetchSummary};
use crate::inventory::RawOffer;
use crate::storage::{BlobError, BlobStore, ObjectKey};

/// Why one object could not be read.
#[derive(Debug, Error)]
enum ObjectError {
    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("spooling to a temporary file failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("object is not a JSON array: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object decodes to more than {limit} bytes")]
    Oversized { limit: u64 },

    #[error("decode task failed: {0}")]
    Join(String),
}

/// Joins a base key and a channel into the listing prefix `<base>/<channel>/`.
pub fn channel_prefix(base_key: &str, channel: &str) -> String {
    let base = base_key.trim_matches('/');
    if base.is_empty() {
        format!("{channel}/")
    } else {
        format!("{base}/{channel}/")
    }
}

/// Decoded size above which an inventory object is skipped.
pub const DEFAULT_MAX_DECODED_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct BlobChannelFetcher {
    store: Arc<dyn BlobStore>,
    max_decoded_bytes: u64,
}

impl BlobChannelFetcher {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            max_decoded_bytes: DEFAULT_MAX_DECODED_BYTES,
        }
    }

    /// Caps the decompressed size of one object.
    pub fn with_max_decoded_bytes(mut self, limit: u64) -> Self {
        self.max_decoded_bytes = limit;
        self
    }

    pub fn max_decoded_bytes(&self) -> u64 {
        self.max_decoded_bytes
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    /// Fetches every inventory object of `channel` below `base_key`.
    ///
    /// # Errors
    ///
    /// Only a failed listing is an error; failed objects are counted in
    /// `FetchSummary::failed_objects`.
    pub async fn fetch(
        &self,
        channel: &str,
        base_key: &str,
        sink: &mut (dyn FnMut(RawOffer) + Send),
    ) -> Result<FetchSummary, FetchError> {
        self.fetch_prefix(channel, &channel_prefix(base_key, channel), sink)
            .await
    }

    /// Fetches the inventory objects directly under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub async fn fetch_prefix(
        &self,
        channel: &str,
        prefix: &str,
        sink: &mut (dyn FnMut(RawOffer) + Send),
    ) -> Result<FetchSummary, FetchError> {
        let keys = self.store.list(prefix).await?;
        let objects: Vec<ObjectKey> = keys
            .into_iter()
            .filter(|key| {
                key.as_str()
                    .strip_prefix(prefix)
                    .is_some_and(|rest| !rest.contains('/'))
                    && key.is_inventory_object()
            })
            .collect();

        debug!(channel, prefix, objects = objects.len(), "Listed inventory objects");

        let mut summary = FetchSummary::default();
        for key in &objects {
            let values = match self.load_object(key).await {
                Ok(values) => values,
                Err(error) => {
                    summary.failed_objects += 1;
                    warn!(channel, key = %key, %error, "Skipping inventory object");
                    continue;
                }
            };

            for value in values {
                match serde_json::from_value::<RawOffer>(value) {
                    Ok(raw) => {
                        summary.records += 1;
                        sink(raw);
                    }
                    Err(error) => {
                        summary.decode_failures += 1;
                        debug!(channel, key = %key, %error, "Skipping undecodable record");
                    }
                }
            }
        }

        info!(
            channel,
            objects = objects.len(),
            failed_objects = summary.failed_objects,
            records = summary.records,
            decode_failures = summary.decode_failures,
            "Channel objects ingested"
        );
        Ok(summary)
    }

    /// Names of the channel folders found directly under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub async fn channels_under(&self, prefix: &str) -> Result<BTreeSet<String>, FetchError> {
        let keys = self.store.list(prefix).await?;
        Ok(keys
            .iter()
            .filter_map(|key| {
                let rest = key.as_str().strip_prefix(prefix)?;
                let (channel, _) = rest.split_once('/')?;
                (!channel.is_empty()).then(|| channel.to_string())
            })
            .collect())
    }

    /// Downloads `key` into a temporary file and decodes it. The file is
    /// removed when the handle drops, on success and on error alike.
    async fn load_object(&self, key: &ObjectKey) -> Result<Vec<Value>, ObjectError> {
        let spool = NamedTempFile::new()?;
        let mut file = tokio::fs::File::from_std(spool.reopen()?);
        let size = self.store.download_to(key, &mut file).await?;
        file.flush().await?;
        drop(file);
        debug!(key = %key, size, "Downloaded inventory object");

        let gzipped = key.is_gzipped();
        let limit = self.max_decoded_bytes;
        tokio::task::spawn_blocking(move || decode_object(&spool, gzipped, limit))
            .await
            .map_err(|e| ObjectError::Join(e.to_string()))?
    }
}

/// Decodes the spooled object as a JSON array, reading at most `limit`
/// decoded bytes.
fn decode_object(spool: &NamedTempFile, gzipped: bool, limit: u64) -> Result<Vec<Value>, ObjectError> {
    let reader = BufReader::new(spool.reopen()?);
    let decoded: Box<dyn Read> = if gzipped {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let mut capped = decoded.take(limit);
    match serde_json::from_reader(&mut capped) {
        Ok(values) => Ok(values),
        // The cap cut the document short.
        Err(_) if capped.limit() == 0 => Err(ObjectError::Oversized { limit }),
        Err(e) => Err(e.into()),
    }
}
