//! # adx_common
//!
//! Shared control-plane library for the ad-exchange servers. Modules are gated
//! by folder-level features so that small tools only pull what they use.

// Always available: time source and the offer data model.
pub mod clock;
pub mod inventory;

#[cfg(feature = "retrieve")]
pub mod retrieve;

#[cfg(feature = "storage")]
pub mod storage;

#[cfg(feature = "ingestors")]
pub mod ingestors;

#[cfg(feature = "index")]
pub mod index;

#[cfg(feature = "refresh")]
pub mod core;

#[cfg(feature = "pacing")]
pub mod pacing;

#[cfg(feature = "loggers")]
pub mod loggers;

// Re-export the types most callers need.
pub use clock::{Clock, ManualClock, TokioClock};
pub use inventory::{CanonicalOffer, RawOffer};
