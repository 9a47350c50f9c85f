//! The store trait and the collaborators passed along with each request.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::{BlobUri, Credential, StoreError};

/// Boxed future returned by store and signature-provider calls.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Metadata returned by [`BlobStore::properties`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobProperties {
    /// Committed length of the blob in bytes.
    pub length: u64,
}

/// Remote blob store.
///
/// Implementations must be safe to call concurrently: the transfer engine
/// keeps several block operations in flight against one store.
pub trait BlobStore: Send + Sync {
    /// Fetches blob metadata.
    fn properties<'a>(
        &'a self,
        uri: &'a BlobUri,
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, BlobProperties>;

    /// Reads `buf.len()` bytes starting at `offset`, filling the whole slice.
    fn read_range<'a>(
        &'a self,
        uri: &'a BlobUri,
        offset: u64,
        buf: &'a mut [u8],
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()>;

    /// Stages one block. The block is invisible until committed.
    ///
    /// `checksum` is the hex SHA-256 of `data`; stores reject mismatches.
    fn put_block<'a>(
        &'a self,
        uri: &'a BlobUri,
        block_id: &'a str,
        data: &'a [u8],
        checksum: Option<&'a str>,
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()>;

    /// Commits staged blocks, in list order, as the blob's new content.
    fn commit_blocks<'a>(
        &'a self,
        uri: &'a BlobUri,
        block_ids: &'a [String],
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()>;

    /// Writes a whole blob in one request.
    fn put_blob<'a>(
        &'a self,
        uri: &'a BlobUri,
        data: &'a [u8],
        opts: &'a RequestOptions,
    ) -> StoreFuture<'a, ()>;
}

/// Policy for ordinary transient faults (throttling, resets, 5xx).
///
/// Opaque to the transfer engine, which only forwards it to the store.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Delay before retrying after the `attempt`-th failure, or `None` to give up.
    fn next_delay(&self, attempt: u32, error: &StoreError) -> Option<Duration>;
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn next_delay(&self, _attempt: u32, _error: &StoreError) -> Option<Duration> {
        None
    }
}

/// Refreshes a short-lived signature for the target blob.
pub trait SignatureProvider: Send + Sync {
    /// Returns a freshly issued signature (query-string form).
    fn fetch(&self) -> StoreFuture<'_, String>;
}

/// Process-level connection tuning, invoked once per distinct endpoint.
pub trait ConnectionTuner: Send + Sync {
    fn tune(&self, endpoint: &str, max_connections: usize);
}

/// Per-request context forwarded with every store call.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Signature overriding the one embedded in the URI, when refreshed.
    pub signature: Option<String>,
    pub credential: Credential,
    pub retry_policy: Arc<dyn RetryPolicy>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            signature: None,
            credential: Credential::None,
            retry_policy: Arc::new(NoRetry),
        }
    }
}

impl RequestOptions {
    /// Runs `op`, retrying transient faults as the retry policy allows.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => {
                    attempt = attempt.saturating_add(1);
                    let Some(delay) = self.retry_policy.next_delay(attempt, &err) else {
                        return Err(err);
                    };
                    debug!(attempt, error = %err, ?delay, "retrying transient store fault");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
