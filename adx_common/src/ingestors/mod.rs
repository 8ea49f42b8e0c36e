//! # Channel Ingestors Module
//!
//! Clients that pull raw offers from upstream channels. A channel publishes
//! either through a streaming HTTP endpoint or as numbered objects in a
//! bucket; both paths hand decoded [`RawOffer`]s to a caller-supplied sink and
//! end with a [`FetchSummary`].
//!
//! ## Contained Modules:
//! - **`ads_stream`**: incremental decoder for the `{err_msg, ads}` envelope.
//! - **`http_stream`**: the HTTP streaming fetcher with its failure budget.
//! - **`blob_channel`**: the bucket fetcher (list, download, gunzip, decode).
//! - **`channel_status`**: the channel enablement document and its sticky book.

#![forbid(unsafe_code)]

/// Incremental `{err_msg, ads}` decoder.
pub mod ads_stream;
/// Bucket-backed channel fetcher.
pub mod blob_channel;
/// Channel enablement.
pub mod channel_status;
/// Streaming HTTP channel fetcher.
pub mod http_stream;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inventory::RawOffer;
use crate::storage::BlobError;

pub use ads_stream::{AdsEvent, AdsStreamDecoder, AdsStreamError};
pub use blob_channel::{channel_prefix, BlobChannelFetcher, DEFAULT_MAX_DECODED_BYTES};
pub use channel_status::{
    fetch_channel_status, ChannelStatusBook, ChannelStatusEntry, StatusError, DEFAULT_STATUS_KEY,
};
pub use http_stream::{drain_ads, HttpStreamFetcher, MAX_CONSECUTIVE_DECODE_FAILURES, SUCCESS_TOKEN};

/// Where a channel publishes its inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChannelSource {
    /// Streaming JSON endpoint.
    Http { url: String },
    /// Numbered objects under `<base_key>/<channel>/`. Without a base key the
    /// scheduler's default base key is used.
    Blob {
        #[serde(default)]
        base_key: Option<String>,
    },
}

/// Outcome of one channel fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchSummary {
    /// Records handed to the sink.
    pub records: u64,
    /// Records that did not decode into an offer.
    pub decode_failures: u64,
    /// Blob objects skipped because they could not be read.
    pub failed_objects: u64,
    /// The source was dropped before it was exhausted.
    pub abandoned: bool,
    /// `err_msg` of an HTTP envelope.
    pub status: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for channel {channel} failed: {message}")]
    Transport { channel: String, message: String },

    #[error("channel {channel} answered HTTP {status}")]
    HttpStatus { channel: String, status: u16 },

    #[error("body of channel {channel} broke off: {message}")]
    Stream { channel: String, message: String },

    #[error("channel {channel} sent a corrupt envelope: {error}")]
    Envelope {
        channel: String,
        #[source]
        error: AdsStreamError,
    },

    #[error(transparent)]
    Blob(#[from] BlobError),
}

/// Dispatches a channel fetch to the fetcher matching its [`ChannelSource`].
#[derive(Clone)]
pub struct ChannelFetcher {
    http: HttpStreamFetcher,
    blob: BlobChannelFetcher,
}

impl ChannelFetcher {
    pub fn new(http: HttpStreamFetcher, blob: BlobChannelFetcher) -> Self {
        Self { http, blob }
    }

    pub fn blob(&self) -> &BlobChannelFetcher {
        &self.blob
    }

    /// Fetches `channel` from `source`, falling back to `default_base_key` for
    /// blob sources that do not name their own.
    ///
    /// # Errors
    ///
    /// Whatever the selected fetcher reports.
    pub async fn fetch(
        &self,
        channel: &str,
        source: &ChannelSource,
        default_base_key: &str,
        sink: &mut (dyn FnMut(RawOffer) + Send),
    ) -> Result<FetchSummary, FetchError> {
        match source {
            ChannelSource::Http { url } => self.http.fetch(channel, url, sink).await,
            ChannelSource::Blob { base_key } => {
                let base_key = base_key.as_deref().unwrap_or(default_base_key);
                self.blob.fetch(channel, base_key, sink).await
            }
        }
    }
}
