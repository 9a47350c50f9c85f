//! Shared state of one active transfer.
//!
//! The driving loop and the block tasks it spawns all hold an
//! `Arc<TransferContext>`. Counters only grow; the pending map and the
//! block queue sit behind their own locks so a block task never waits on
//! local I/O.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use blockshift_blob_store::{
    BlobUri, Credential, RequestOptions, RetryPolicy, SignatureProvider,
};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::block::Block;
use crate::crypto::FileEncryption;
use crate::pool::PooledBuffer;
use crate::progress::{SpeedCalculator, percent};
use crate::types::{
    Direction, TransferCompletion, TransferOptions, TransferProgress, TransferStatus,
};

/// Identity of a transfer as reported in events.
#[derive(Debug, Clone)]
pub(crate) struct TransferLabel {
    pub id: String,
    pub direction: Direction,
    pub uri: BlobUri,
    pub local_name: String,
}

impl TransferLabel {
    pub fn new(direction: Direction, uri: BlobUri, local_name: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            direction,
            uri,
            local_name,
        }
    }

    pub fn completion(&self, bytes_transferred: u64, status: TransferStatus) -> TransferCompletion {
        TransferCompletion {
            transfer_id: self.id.clone(),
            direction: self.direction,
            target: self.uri.to_string(),
            local_name: self.local_name.clone(),
            bytes_transferred,
            status,
        }
    }
}

pub(crate) struct TransferContext {
    label: TransferLabel,
    total_length: u64,
    block_size: usize,
    initial_offset: u64,

    queue: Mutex<VecDeque<Block>>,
    /// Blocks back from the store, waiting for their turn at local I/O.
    pending: Mutex<BTreeMap<usize, (Block, PooledBuffer)>>,
    next_local_index: AtomicUsize,
    bytes_remote: AtomicU64,
    bytes_local: AtomicU64,
    in_flight: AtomicUsize,
    local_io_active: AtomicBool,
    complete: AtomicBool,
    errors: Mutex<Vec<TransferError>>,

    auth_retries: AtomicU32,
    signature: RwLock<Option<String>>,

    cancel: CancellationToken,
    retry_policy: Arc<dyn RetryPolicy>,
    signature_provider: Option<Arc<dyn SignatureProvider>>,
    credential: Credential,
    encryption: Option<Arc<FileEncryption>>,
    speed: SpeedCalculator,
}

impl TransferContext {
    pub fn new(
        label: TransferLabel,
        initial_offset: u64,
        total_length: u64,
        block_size: usize,
        blocks: Vec<Block>,
        options: &TransferOptions,
    ) -> Self {
        Self {
            label,
            total_length,
            block_size,
            initial_offset,
            queue: Mutex::new(blocks.into()),
            pending: Mutex::new(BTreeMap::new()),
            next_local_index: AtomicUsize::new(0),
            bytes_remote: AtomicU64::new(0),
            bytes_local: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            local_io_active: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
            auth_retries: AtomicU32::new(0),
            signature: RwLock::new(None),
            cancel: options.cancel.clone(),
            retry_policy: Arc::clone(&options.retry_policy),
            signature_provider: options.signature_provider.clone(),
            credential: options.credential.clone(),
            encryption: options.encryption.clone(),
            speed: SpeedCalculator::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.label.id
    }

    pub fn label(&self) -> &TransferLabel {
        &self.label
    }

    pub fn uri(&self) -> &BlobUri {
        &self.label.uri
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn initial_offset(&self) -> u64 {
        self.initial_offset
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // -- block queue -------------------------------------------------------

    pub fn has_queued(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    pub fn next_block(&self) -> Option<Block> {
        self.queue.lock().pop_front()
    }

    // -- ordered local I/O -------------------------------------------------

    pub fn store_pending(&self, block: Block, buffer: PooledBuffer) {
        self.pending.lock().insert(block.index, (block, buffer));
    }

    /// Removes the pending block due next for local I/O, if it has arrived.
    pub fn take_next_pending(&self) -> Option<(Block, PooledBuffer)> {
        let due = self.next_local_index.load(Ordering::Acquire);
        self.pending.lock().remove(&due)
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns every pending buffer to its pool.
    pub fn clear_pending(&self) {
        let drained = std::mem::take(&mut *self.pending.lock());
        drop(drained);
    }

    pub fn set_local_io(&self, active: bool) {
        self.local_io_active.store(active, Ordering::Release);
    }

    pub fn local_io_active(&self) -> bool {
        self.local_io_active.load(Ordering::Acquire)
    }

    /// Marks the next block's local I/O as done.
    pub fn advance_local(&self, bytes: u64) {
        self.next_local_index.fetch_add(1, Ordering::AcqRel);
        self.bytes_local.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn bytes_local(&self) -> u64 {
        self.bytes_local.load(Ordering::Acquire)
    }

    // -- remote operations -------------------------------------------------

    pub fn begin_remote(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub fn finish_remote(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Adds confirmed remote bytes, returning the new total.
    pub fn add_remote(&self, bytes: u64) -> u64 {
        self.bytes_remote.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    pub fn bytes_remote(&self) -> u64 {
        self.bytes_remote.load(Ordering::Acquire)
    }

    // -- completion --------------------------------------------------------

    /// Records a fatal error and stops the driving loop.
    ///
    /// Cancellation is not an error; it is reported from the token.
    pub fn record_error(&self, err: TransferError) {
        if !matches!(err, TransferError::Canceled) {
            tracing::warn!(transfer_id = %self.label.id, error = %err, "transfer failed");
            self.errors.lock().push(err);
        }
        self.mark_complete();
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    pub fn take_first_error(&self) -> Option<TransferError> {
        let mut errors = self.errors.lock();
        (!errors.is_empty()).then(|| errors.remove(0))
    }

    /// Final outcome: the first recorded error, else cancellation, else success.
    pub fn settle(&self) -> Result<(), TransferError> {
        if let Some(err) = self.take_first_error() {
            return Err(err);
        }
        if self.is_canceled() {
            return Err(TransferError::Canceled);
        }
        Ok(())
    }

    // -- authorization -----------------------------------------------------

    pub fn has_signature_provider(&self) -> bool {
        self.signature_provider.is_some()
    }

    pub fn signature_provider(&self) -> Option<&Arc<dyn SignatureProvider>> {
        self.signature_provider.as_ref()
    }

    /// Counts one more authorization failure, returning the new count.
    pub fn bump_auth_retries(&self) -> u32 {
        self.auth_retries.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn auth_retries(&self) -> u32 {
        self.auth_retries.load(Ordering::Acquire)
    }

    pub fn set_signature(&self, signature: String) {
        *self.signature.write() = Some(signature);
    }

    /// Options for the next store call, carrying the freshest signature.
    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            signature: self.signature.read().clone(),
            credential: self.credential.clone(),
            retry_policy: Arc::clone(&self.retry_policy),
        }
    }

    // -- encryption & reporting -------------------------------------------

    /// Applies the encryption transform, if any, to bytes at `offset`.
    pub fn transform(&self, offset: u64, data: &mut [u8]) {
        if let Some(encryption) = &self.encryption {
            encryption.apply(offset, data);
        }
    }

    pub fn progress(&self, transferred: u64, last_block_size: u64) -> TransferProgress {
        self.speed.add_sample(transferred);
        TransferProgress {
            transfer_id: self.label.id.clone(),
            direction: self.label.direction,
            bytes_transferred: transferred,
            last_block_size,
            total_size: self.total_length,
            percent: percent(transferred, self.total_length),
            speed: self.speed.bytes_per_second(),
            target: self.label.uri.to_string(),
            local_name: self.label.local_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::partition;
    use crate::pool::BufferPool;

    fn context(total: u64, block_size: usize) -> TransferContext {
        let uri = BlobUri::parse("mem://store/c/blob").unwrap();
        TransferContext::new(
            TransferLabel::new(Direction::Download, uri, "blob".into()),
            0,
            total,
            block_size,
            partition(0, total, block_size),
            &TransferOptions::default(),
        )
    }

    #[test]
    fn pending_is_released_in_index_order() {
        let ctx = context(12, 4);
        let pool = Arc::new(BufferPool::new(4, 3));
        let blocks: Vec<_> = std::iter::from_fn(|| ctx.next_block()).collect();
        assert_eq!(blocks.len(), 3);

        ctx.store_pending(blocks[2], pool.acquire().unwrap());
        ctx.store_pending(blocks[1], pool.acquire().unwrap());
        assert!(ctx.take_next_pending().is_none());

        ctx.store_pending(blocks[0], pool.acquire().unwrap());
        for expected in 0..3 {
            let (block, _buf) = ctx.take_next_pending().unwrap();
            assert_eq!(block.index, expected);
            ctx.advance_local(u64::from(block.length));
        }
        assert_eq!(ctx.bytes_local(), 12);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn clear_pending_returns_buffers() {
        let ctx = context(8, 4);
        let pool = Arc::new(BufferPool::new(4, 2));
        let block = ctx.next_block().unwrap();
        ctx.store_pending(block, pool.acquire().unwrap());
        assert_eq!(pool.in_use(), 1);
        ctx.clear_pending();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(ctx.pending_len(), 0);
    }

    #[test]
    fn cancellation_is_not_recorded_as_error() {
        let ctx = context(8, 4);
        ctx.record_error(TransferError::Canceled);
        assert!(ctx.is_complete());
        assert!(!ctx.has_errors());
        assert!(ctx.settle().is_ok());

        ctx.record_error(TransferError::Internal("first".into()));
        ctx.record_error(TransferError::Internal("second".into()));
        match ctx.settle() {
            Err(TransferError::Internal(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn settle_reports_cancellation() {
        let ctx = context(8, 4);
        ctx.cancel_token().cancel();
        assert!(matches!(ctx.settle(), Err(TransferError::Canceled)));
    }

    #[test]
    fn request_options_carry_refreshed_signature() {
        let ctx = context(8, 4);
        assert!(ctx.request_options().signature.is_none());
        ctx.set_signature("sig=new".into());
        assert_eq!(ctx.request_options().signature.as_deref(), Some("sig=new"));
    }

    #[test]
    fn progress_reports_percent() {
        let ctx = context(8, 4);
        let progress = ctx.progress(4, 4);
        assert_eq!(progress.percent, 50);
        assert_eq!(progress.total_size, 8);
        assert_eq!(progress.local_name, "blob");
    }
}
