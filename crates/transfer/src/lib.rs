//! Bounded-concurrency chunked transfers between local files and a blob store.
//!
//! Large objects are split into blocks that move concurrently through a
//! shared, bounded pool of buffers while local reads and writes stay strictly
//! sequential. Small objects go in a single request. Blocks may be encrypted
//! in flight, and authorization failures caused by short-lived signatures are
//! retried with a refreshed signature.

mod block;
mod client;
mod config;
mod context;
mod crypto;
mod engine;
mod error;
mod pool;
mod progress;
mod retry;
mod types;
mod validation;

pub use block::{Block, block_id, download_block_size, partition, upload_block_size};
pub use client::{TransferClient, parse_uri};
pub use config::{ConfigError, TransferConfig};
pub use crypto::{AesCtrTransform, BlockTransform, FileEncryption};
pub use error::TransferError;
pub use pool::{BufferPool, PoolRegistry, PooledBuffer};
pub use progress::{SpeedCalculator, percent};
pub use retry::{AuthRetryGate, Verdict, classify};
pub use types::{
    ByteRange, Direction, DownloadRequest, DownloadTarget, TransferCompletion, TransferEvent,
    TransferOptions, TransferProgress, TransferStatus, UploadRequest, UploadSource,
};
pub use validation::{validate_download, validate_upload};
