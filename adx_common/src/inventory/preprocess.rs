//! # Record Preprocessor
//!
//! Turns one [`RawOffer`] into a [`CanonicalOffer`] or a [`Discard`]. The
//! rules run in a fixed order and depend only on the record and the static
//! per-channel table, so the same input always yields the same output:
//!
//! 1. inject the channel's affiliate tag into the attachment args;
//! 2. reject payouts at or below the floor;
//! 3. unwrap `<channel>_<id>` composite ids of offline-wrapped records, as
//!    marked by the record's own `channel` field or, when unmarked, by the
//!    channel it was fetched from;
//! 4. zero the pre-click rate of lead-based (`CPL`) offers;
//! 5. reject records without a targeting expression.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{CanonicalOffer, RawOffer};

/// Payouts at or below this value are never served.
pub const DEFAULT_PAYOUT_FLOOR: f64 = 0.01;
/// Channel whose records wrap another channel's offers.
pub const DEFAULT_OFFLINE_CHANNEL: &str = "offline";

/// Static, per-channel preprocessing configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelProfile {
    /// Affiliate tag appended to every offer of the channel, as `key=value`.
    pub affiliate_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessSettings {
    pub payout_floor: f64,
    pub offline_channel: String,
    pub profiles: BTreeMap<String, ChannelProfile>,
}

impl Default for PreprocessSettings {
    fn default() -> Self {
        Self {
            payout_floor: DEFAULT_PAYOUT_FLOOR,
            offline_channel: DEFAULT_OFFLINE_CHANNEL.to_string(),
            profiles: BTreeMap::new(),
        }
    }
}

/// Why a record was dropped. Discards are counted, never propagated.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Discard {
    #[error("payout {payout} is not above the floor {floor}")]
    BelowPayoutFloor { payout: f64, floor: f64 },

    #[error("invalid composite id {0:?}")]
    InvalidCompositeId(String),

    #[error("record has no targeting expression")]
    MissingExpression,
}

#[derive(Debug, Clone, Default)]
pub struct RecordPreprocessor {
    settings: PreprocessSettings,
}

impl RecordPreprocessor {
    pub fn new(settings: PreprocessSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PreprocessSettings {
        &self.settings
    }

    /// Normalizes `raw`, fetched from `channel`.
    ///
    /// `temporary` marks records coming from the test area of the bucket.
    pub fn preprocess(
        &self,
        channel: &str,
        raw: RawOffer,
        temporary: bool,
    ) -> Result<CanonicalOffer, Discard> {
        let RawOffer {
            id,
            channel: marker,
            payout,
            payout_type,
            expression,
            creatives,
            icon,
            mut attachment_args,
            mut pre_click_rate,
            extra,
        } = raw;

        if let Some(tag) = self
            .settings
            .profiles
            .get(channel)
            .and_then(|p| p.affiliate_tag.as_deref())
        {
            if !attachment_args.iter().any(|a| a == tag) {
                attachment_args.push(tag.to_string());
            }
        }

        if payout <= self.settings.payout_floor || payout.is_nan() {
            return Err(Discard::BelowPayoutFloor {
                payout,
                floor: self.settings.payout_floor,
            });
        }

        let offline = marker.as_deref().unwrap_or(channel) == self.settings.offline_channel;
        let (channel, offer_id) = if offline {
            split_composite_id(&id)?
        } else {
            (channel.to_string(), id)
        };

        if payout_type.eq_ignore_ascii_case("cpl") {
            pre_click_rate = 0.0;
        }

        if expression.trim().is_empty() {
            return Err(Discard::MissingExpression);
        }

        Ok(CanonicalOffer {
            channel,
            offer_id,
            payout,
            payout_type,
            expression,
            creatives,
            icon,
            attachment_args,
            pre_click_rate,
            temporary,
            extra,
        })
    }
}

/// Splits `<channel>_<id>` at the first underscore.
fn split_composite_id(composite: &str) -> Result<(String, String), Discard> {
    match composite.split_once('_') {
        Some((channel, id)) if !channel.is_empty() && !id.is_empty() => {
            Ok((channel.to_string(), id.to_string()))
        }
        _ => Err(Discard::InvalidCompositeId(composite.to_string())),
    }
}
