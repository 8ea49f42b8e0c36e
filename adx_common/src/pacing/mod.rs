//! # Pacing Module
//!
//! Per-offer admission control. Click counts live in minute buckets that
//! expire on their own; the admission threshold is split across the serving
//! fleet.
//!
//! ## Contained Modules:
//! - **`expiring`**: the TTL map holding the buckets.
//! - **`controller`**: `record_click`, `is_over_cap` and the threshold rules.
//! - **`fleet`**: fleet size providers used to derive the threshold.

/// TTL map.
pub mod expiring;
/// Pacing controller.
pub mod controller;
/// Fleet size providers.
pub mod fleet;

pub use controller::{
    bucket_key, CapOverride, PacingController, PacingSettings, PacingThreshold,
    DEFAULT_BUCKET_TTL, DEFAULT_REAP_INTERVAL,
};
pub use expiring::ExpiringMap;
pub use fleet::{FleetError, FleetSizeProvider, HttpFleetSizeProvider, StaticFleetSize};
