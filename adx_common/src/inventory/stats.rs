use serde::Serialize;

use super::preprocess::Discard;

/// Counters for one channel's contribution to one build.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    /// Records decoded from the source.
    pub fetched: u64,
    /// Records (or whole objects) that failed to decode.
    pub decode_failures: u64,
    pub below_floor: u64,
    pub invalid_composite_id: u64,
    pub missing_expression: u64,
    /// Records accepted by the index.
    pub inserted: u64,
    /// Records the index refused, e.g. malformed expressions.
    pub insert_failures: u64,
    /// The source was abandoned before it was exhausted.
    pub abandoned: bool,
}

impl IngestStats {
    pub fn record_discard(&mut self, discard: &Discard) {
        match discard {
            Discard::BelowPayoutFloor { .. } => self.below_floor += 1,
            Discard::InvalidCompositeId(_) => self.invalid_composite_id += 1,
            Discard::MissingExpression => self.missing_expression += 1,
        }
    }

    pub fn discarded(&self) -> u64 {
        self.below_floor + self.invalid_composite_id + self.missing_expression
    }

    pub fn merge(&mut self, other: &IngestStats) {
        self.fetched += other.fetched;
        self.decode_failures += other.decode_failures;
        self.below_floor += other.below_floor;
        self.invalid_composite_id += other.invalid_composite_id;
        self.missing_expression += other.missing_expression;
        self.inserted += other.inserted;
        self.insert_failures += other.insert_failures;
        self.abandoned |= other.abandoned;
    }
}
