//! # Channel Enablement
//!
//! The list of live channels is a JSON document in the bucket:
//!
//! ```json
//! [ { "channel": "mob", "type": ["cpi"] }, { "channel": "offline", "type": [] } ]
//! ```
//!
//! Every channel named in a pull becomes enabled. A channel missing from a
//! later pull keeps whatever state it had; only an explicit [`ChannelStatusBook::set`]
//! turns it off. Channels never seen are disabled.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{BlobError, BlobStore, ObjectKey};

/// Default location of the enablement document.
pub const DEFAULT_STATUS_KEY: &str = "config/channel_status.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatusEntry {
    pub channel: String,
    /// Inventory kinds the channel serves. Informational only.
    #[serde(rename = "type", default)]
    pub kinds: Vec<String>,
}

#[derive(Debug, Error)]
pub enum StatusError {
    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("channel status document is malformed: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Last known enablement of every channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStatusBook {
    channels: BTreeMap<String, bool>,
}

impl ChannelStatusBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks every channel in `entries` enabled and returns how many were not
    /// enabled before.
    pub fn apply_pull(&mut self, entries: &[ChannelStatusEntry]) -> usize {
        let mut newly_enabled = 0;
        for entry in entries {
            let enabled = self.channels.entry(entry.channel.clone()).or_insert(false);
            if !*enabled {
                newly_enabled += 1;
                *enabled = true;
            }
        }
        newly_enabled
    }

    pub fn set(&mut self, channel: &str, enabled: bool) {
        self.channels.insert(channel.to_string(), enabled);
    }

    pub fn is_enabled(&self, channel: &str) -> bool {
        self.channels.get(channel).copied().unwrap_or(false)
    }

    /// Enabled channels in name order.
    pub fn enabled_channels(&self) -> Vec<String> {
        self.channels
            .iter()
            .filter(|(_, enabled)| **enabled)
            .map(|(channel, _)| channel.clone())
            .collect()
    }
}

/// Downloads and decodes the enablement document at `key`.
///
/// # Errors
///
/// Returns an error if the object cannot be read or is not a list of entries.
pub async fn fetch_channel_status(
    store: &dyn BlobStore,
    key: &str,
) -> Result<Vec<ChannelStatusEntry>, StatusError> {
    let data = store.get(&ObjectKey::new(key)).await?;
    Ok(serde_json::from_slice(&data)?)
}
