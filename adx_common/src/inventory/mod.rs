//! # Inventory Module
//!
//! The offer data model and the rules that turn one upstream record into an
//! insertable offer.
//!
//! ## Contained Modules:
//! - **`model`**: `RawOffer` as delivered by a channel and the normalized
//!   `CanonicalOffer` stored as the index attribute.
//! - **`preprocess`**: the ordered validation and normalization rules.
//! - **`stats`**: per-channel counters for fetched, discarded and inserted records.

/// Raw and canonical offer records.
pub mod model;
/// Record validation and normalization.
pub mod preprocess;
/// Ingestion counters.
pub mod stats;

pub use model::{CanonicalOffer, RawOffer};
pub use preprocess::{ChannelProfile, Discard, PreprocessSettings, RecordPreprocessor};
pub use stats::IngestStats;
