//! Object-store collaborator interface for the blockshift transfer engine.
//!
//! The engine never talks HTTP itself. It drives a [`BlobStore`] that exposes
//! ranged reads, staged block writes with a block-list commit, whole-object
//! writes and a metadata fetch. Every call may fail with a [`StoreError`],
//! which the engine inspects (403 classification) but does not interpret
//! further.
//!
//! Two local implementations ship with the crate:
//!
//! - [`MemoryBlobStore`] keeps blobs and staged blocks in memory.
//! - [`DirBlobStore`] maps blobs onto files below a root directory.

mod checksum;
mod dir;
mod error;
mod memory;
mod store;
mod uri;
mod validation;

pub use checksum::checksum_bytes;
pub use dir::DirBlobStore;
pub use error::StoreError;
pub use memory::{MemoryBlobStore, MemoryStoreStats};
pub use store::{
    BlobProperties, BlobStore, ConnectionTuner, NoRetry, RequestOptions, RetryPolicy,
    SignatureProvider, StoreFuture,
};
pub use uri::{BlobUri, Credential};
pub use validation::validate_blob_key;

/// HTTP status the engine treats as an authorization failure.
pub const STATUS_FORBIDDEN: u16 = 403;
