//! Chunked and single-shot transfer drivers.
//!
//! The chunked drivers run one loop per transfer that owns all local I/O and
//! spawns remote block operations into a `JoinSet`, keeping at most
//! `concurrency` of them in flight. Remote completions may arrive in any
//! order; local bytes are always read or written in block order.

mod download;
mod single_shot;
mod upload;

use std::sync::Arc;
use std::time::Duration;

use blockshift_blob_store::BlobStore;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::context::TransferContext;
use crate::retry::AuthRetryGate;
use crate::types::TransferEvent;

pub(crate) use download::download_chunked;
pub(crate) use single_shot::{download_whole, upload_whole};
pub(crate) use upload::upload_chunked;

/// Everything a driver needs besides the transfer itself.
#[derive(Clone)]
pub(crate) struct Engine {
    pub store: Arc<dyn BlobStore>,
    pub gate: AuthRetryGate,
    pub concurrency: usize,
    pub backpressure_backoff: Duration,
    /// Progress sink; present only while someone listens.
    pub events: Option<mpsc::Sender<TransferEvent>>,
    /// Channel slots progress never takes, kept free for completion events.
    pub reserved_events: usize,
}

impl Engine {
    /// Publishes progress without ever blocking the transfer.
    pub fn report(&self, ctx: &TransferContext, transferred: u64, last_block_size: u64) {
        let progress = ctx.progress(transferred, last_block_size);
        tracing::debug!(
            transfer_id = %ctx.id(),
            transferred,
            percent = progress.percent,
            "progress"
        );
        if let Some(events) = &self.events
            && events.capacity() > self.reserved_events
        {
            // A full channel drops the sample; the next one supersedes it.
            let _ = events.try_send(TransferEvent::Progress(progress));
        }
    }
}

/// Waits out the remaining block tasks so their buffers return to the pool.
async fn drain<T: 'static>(ctx: &TransferContext, tasks: &mut JoinSet<T>) {
    while tasks.join_next().await.is_some() {
        ctx.finish_remote();
    }
}

/// Sleeps for `delay` unless the transfer is canceled first.
async fn backoff(ctx: &TransferContext, delay: Duration) {
    tokio::select! {
        _ = ctx.cancel_token().cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}
