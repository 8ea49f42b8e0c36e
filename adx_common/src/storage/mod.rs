//! # Storage Module
//!
//! Bucket-style blob storage used for channel inventory objects and the
//! channel enablement document.
//!
//! ## Contained Modules:
//! - **`blob`**: the `BlobStore` trait, `ObjectKey` and `BlobError`.
//! - **`filesystem`**: a directory-backed store for local runs.
//! - **`memory`**: an in-memory store with fault injection for tests.
//! - **`s3`**: AWS S3 and S3-compatible services (feature `s3`).

/// Blob store trait and key type.
pub mod blob;
/// Directory-backed store.
pub mod filesystem;
/// In-memory store.
pub mod memory;
/// S3 store.
#[cfg(feature = "s3")]
pub mod s3;

pub use blob::{BlobError, BlobResult, BlobStore, ObjectKey};
pub use filesystem::FilesystemBlobStore;
pub use memory::MemoryBlobStore;
#[cfg(feature = "s3")]
pub use s3::{S3BlobStore, S3Config};
