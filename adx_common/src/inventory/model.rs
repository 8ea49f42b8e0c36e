use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// # Raw Offer
///
/// One offer exactly as an upstream channel delivers it. Only the fields the
/// control plane acts on are typed; everything else is carried in `extra`.
/// A record missing `id` or with a non-numeric `payout` fails to decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOffer {
    /// Offer id. Some channels send numbers, so both forms are accepted.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Channel marker set by the upstream, if any. `offline` marks a wrapped
    /// record whose id carries its real channel.
    #[serde(default)]
    pub channel: Option<String>,
    /// Payout per conversion, in USD.
    pub payout: f64,
    /// Billing model, e.g. `CPI` or `CPL`.
    #[serde(default)]
    pub payout_type: String,
    /// Boolean targeting expression over country, platform, os version...
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub creatives: Vec<String>,
    #[serde(default)]
    pub icon: Option<String>,
    /// Extra query arguments appended to the tracking link.
    #[serde(default)]
    pub attachment_args: Vec<String>,
    /// Share of impressions that may be pre-clicked.
    #[serde(default)]
    pub pre_click_rate: f64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// # Canonical Offer
///
/// The normalized record stored as the index attribute of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalOffer {
    pub channel: String,
    pub offer_id: String,
    pub payout: f64,
    pub payout_type: String,
    pub expression: String,
    pub creatives: Vec<String>,
    pub icon: Option<String>,
    pub attachment_args: Vec<String>,
    pub pre_click_rate: f64,
    /// Set for records ingested from the `tmp_test` area.
    pub temporary: bool,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl CanonicalOffer {
    /// Document id used in the index: `<channel>_<offer id>`.
    pub fn doc_id(&self) -> String {
        format!("{}_{}", self.channel, self.offer_id)
    }

    /// True for lead-based billing (`CPL`).
    pub fn is_lead_based(&self) -> bool {
        self.payout_type.eq_ignore_ascii_case("cpl")
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "offer id must be a string or a number, got {other}"
        ))),
    }
}
