use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tracing::debug;

use super::{Engine, backoff, drain};
use crate::TransferError;
use crate::block::Block;
use crate::context::TransferContext;
use crate::pool::{BufferPool, PooledBuffer};

type ReadResult = Result<(Block, PooledBuffer), TransferError>;

/// Downloads every queued block of `ctx`, writing them to `writer` in order.
pub(crate) async fn download_chunked(
    engine: &Engine,
    pool: &Arc<BufferPool>,
    ctx: &Arc<TransferContext>,
    writer: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<(), TransferError> {
    let mut tasks: JoinSet<ReadResult> = JoinSet::new();

    loop {
        if ctx.is_complete() || ctx.is_canceled() {
            break;
        }

        // Local I/O: apply the next block in order, if it has arrived.
        debug_assert!(!ctx.local_io_active());
        if let Some((block, mut buffer)) = ctx.take_next_pending() {
            ctx.set_local_io(true);
            let data = &mut buffer[..block.len()];
            ctx.transform(block.offset, data);
            let written = writer.write_all(data).await;
            ctx.set_local_io(false);
            drop(buffer);
            match written {
                Ok(()) => ctx.advance_local(u64::from(block.length)),
                Err(e) => ctx.record_error(e.into()),
            }
            continue;
        }

        if ctx.bytes_local() >= ctx.total_length() {
            ctx.mark_complete();
            break;
        }

        // Remote I/O: keep the pipeline full.
        let mut backpressured = false;
        while ctx.in_flight() < engine.concurrency && ctx.has_queued() && !ctx.is_canceled() {
            let Some(buffer) = pool.acquire() else {
                backpressured = true;
                break;
            };
            let Some(block) = ctx.next_block() else {
                break;
            };
            ctx.begin_remote();
            tasks.spawn(read_block(engine.clone(), Arc::clone(ctx), block, buffer));
        }

        if tasks.is_empty() {
            if backpressured {
                backoff(ctx, engine.backpressure_backoff).await;
                continue;
            }
            if !ctx.is_canceled() {
                ctx.record_error(TransferError::Internal(format!(
                    "download stalled at {} of {} bytes",
                    ctx.bytes_local(),
                    ctx.total_length()
                )));
            }
            break;
        }

        tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => break,
            Some(joined) = tasks.join_next() => {
                ctx.finish_remote();
                match joined {
                    Ok(Ok((block, buffer))) => {
                        let transferred = ctx.add_remote(u64::from(block.length));
                        engine.report(ctx, transferred, u64::from(block.length));
                        ctx.store_pending(block, buffer);
                    }
                    Ok(Err(e)) => ctx.record_error(e),
                    Err(e) => ctx.record_error(e.into()),
                }
            }
        }
    }

    drain(ctx, &mut tasks).await;
    ctx.clear_pending();

    if !ctx.has_errors() && !ctx.is_canceled() {
        writer.flush().await?;
    }
    ctx.settle()
}

/// Reads one block into `buffer`, retrying authorization failures.
async fn read_block(
    engine: Engine,
    ctx: Arc<TransferContext>,
    block: Block,
    mut buffer: PooledBuffer,
) -> ReadResult {
    debug!(transfer_id = %ctx.id(), block = block.index, offset = block.offset, "reading block");
    loop {
        let opts = ctx.request_options();
        let result = engine
            .store
            .read_range(ctx.uri(), block.offset, &mut buffer[..block.len()], &opts)
            .await;
        match result {
            Ok(()) => return Ok((block, buffer)),
            Err(e) => engine.gate.handle_failure(&ctx, e).await?,
        }
    }
}
