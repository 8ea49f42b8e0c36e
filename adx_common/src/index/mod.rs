//! # Index Module
//!
//! Building and publishing the searchable offer index.
//!
//! ## Contained Modules:
//! - **`engine`**: the traits the external boolean-expression engine implements.
//! - **`memory`**: a scanning in-memory engine for local runs and tests.
//! - **`builder`**: fills one fresh index per refresh cycle.
//! - **`registry`**: the atomically swapped live snapshot.

/// Engine traits and errors.
pub mod engine;
/// In-memory reference engine.
pub mod memory;
/// Per-cycle index builder.
pub mod builder;
/// Live snapshot registry.
pub mod registry;

pub use builder::IndexBuilder;
pub use engine::{Conditions, DocId, IndexEngine, IndexError, SearchIndex};
pub use memory::{MemoryEngine, MemoryIndex};
pub use registry::{IndexRegistry, IndexSnapshot};
