//! # Index Builder
//!
//! Fills one fresh index per refresh cycle. Every raw record goes through the
//! preprocessor, then into the engine. Neither a discard nor a refused insert
//! stops the build; both are counted in the channel's [`IngestStats`].

use std::sync::Arc;

use tracing::{trace, warn};

use super::engine::{IndexError, SearchIndex};
use crate::inventory::{CanonicalOffer, IngestStats, RawOffer, RecordPreprocessor};

pub struct IndexBuilder<I> {
    index: I,
    preprocessor: Arc<RecordPreprocessor>,
}

impl<I: SearchIndex> IndexBuilder<I> {
    pub fn new(index: I, preprocessor: Arc<RecordPreprocessor>) -> Self {
        Self { index, preprocessor }
    }

    /// Inserts an already normalized offer under its document id.
    ///
    /// # Errors
    ///
    /// Whatever the engine refuses.
    pub fn insert(&mut self, offer: CanonicalOffer) -> Result<(), IndexError> {
        let doc_id = offer.doc_id();
        let expression = offer.expression.clone();
        self.index.insert(&doc_id, &expression, offer)
    }

    /// Preprocesses and inserts one record fetched from `channel`.
    pub fn ingest(&mut self, channel: &str, raw: RawOffer, temporary: bool, stats: &mut IngestStats) {
        stats.fetched += 1;
        let offer = match self.preprocessor.preprocess(channel, raw, temporary) {
            Ok(offer) => offer,
            Err(discard) => {
                trace!(channel, %discard, "Discarded record");
                stats.record_discard(&discard);
                return;
            }
        };

        let doc_id = offer.doc_id();
        match self.insert(offer) {
            Ok(()) => stats.inserted += 1,
            Err(error) => {
                stats.insert_failures += 1;
                warn!(channel, doc_id, %error, "Index refused offer");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Hands over the finished index.
    pub fn finish(self) -> I {
        self.index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::memory::MemoryEngine;
    use crate::index::engine::IndexEngine;
    use crate::inventory::{ChannelProfile, PreprocessSettings};
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawOffer {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn counts_every_outcome_without_stopping() {
        let mut settings = PreprocessSettings::default();
        settings.profiles.insert(
            "mob".to_string(),
            ChannelProfile {
                affiliate_tag: Some("aff=42".to_string()),
            },
        );
        let mut builder = IndexBuilder::new(
            MemoryEngine.new_index(),
            Arc::new(RecordPreprocessor::new(settings)),
        );
        let mut stats = IngestStats::default();
        let nested = format!("{}country in {{US}}{}", "(".repeat(1000), ")".repeat(1000));

        for record in [
            json!({"id": "a", "payout": 1.0, "expression": "country in {US}"}),
            json!({"id": "b", "payout": 0.01, "expression": "country in {US}"}),
            json!({"id": "c", "payout": 1.0, "expression": ""}),
            json!({"id": "d", "payout": 1.0, "expression": "country is US"}),
            json!({"id": "n", "payout": 1.0, "expression": nested}),
            json!({"id": "a", "payout": 2.0, "expression": "country in {CA}"}),
            json!({"id": "e", "payout": 1.0, "payout_type": "CPL", "pre_click_rate": 0.3, "expression": "os in {ios}"}),
        ] {
            builder.ingest("mob", raw(record), false, &mut stats);
        }

        assert_eq!(stats.fetched, 7);
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.below_floor, 1);
        assert_eq!(stats.missing_expression, 1);
        assert_eq!(stats.insert_failures, 3);

        let index = builder.finish();
        assert_eq!(index.len(), 2);
        let e = index.get_attribute("mob_e").unwrap();
        assert_eq!(e.pre_click_rate, 0.0);
        assert_eq!(e.attachment_args, vec!["aff=42"]);
    }
}
