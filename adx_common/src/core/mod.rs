//! # Core Engine Module
//!
//! The long-running control loop of the ad-exchange server.
//!
//! ## Core Components:
//!
//! - **`refresh`**: the refresh state machine. It pulls the channel enablement
//!   list, ingests every enabled channel and the temporary test area into a
//!   fresh index, publishes it atomically and sleeps until the next cycle.

#![forbid(unsafe_code)]

/// The periodic index refresh state machine.
pub mod refresh;

// --- Public API Re-exports ---
pub use refresh::{
    CycleReport, RefreshError, RefreshPhase, RefreshScheduler, RefreshSettings,
    DEFAULT_REFRESH_PERIOD, DEFAULT_TEMPORARY_PREFIX,
};
