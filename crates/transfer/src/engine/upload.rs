use std::sync::Arc;

use blockshift_blob_store::checksum_bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::{Engine, backoff, drain};
use crate::TransferError;
use crate::block::{Block, block_id};
use crate::context::TransferContext;
use crate::pool::{BufferPool, PooledBuffer};

type StageResult = Result<Block, TransferError>;

/// Uploads every queued block of `ctx` from `reader`, then commits the
/// block list.
pub(crate) async fn upload_chunked(
    engine: &Engine,
    pool: &Arc<BufferPool>,
    ctx: &Arc<TransferContext>,
    reader: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<(), TransferError> {
    let mut tasks: JoinSet<StageResult> = JoinSet::new();
    let block_count = ctx.total_length().div_ceil(ctx.block_size() as u64) as usize;

    loop {
        if ctx.is_complete() || ctx.is_canceled() {
            break;
        }
        if ctx.bytes_remote() >= ctx.total_length() {
            break;
        }

        let mut backpressured = false;
        while ctx.in_flight() < engine.concurrency && ctx.has_queued() && !ctx.is_canceled() {
            let Some(mut buffer) = pool.acquire() else {
                backpressured = true;
                break;
            };
            let Some(block) = ctx.next_block() else {
                break;
            };

            // Local I/O happens here, in block order.
            ctx.set_local_io(true);
            let filled = fill_block(reader, &mut buffer[..block.len()]).await;
            ctx.set_local_io(false);
            if let Err(e) = filled {
                ctx.record_error(e);
                break;
            }
            if ctx.is_canceled() {
                drop(buffer);
                break;
            }
            ctx.advance_local(u64::from(block.length));
            ctx.transform(block.offset, &mut buffer[..block.len()]);

            ctx.begin_remote();
            tasks.spawn(stage_block(engine.clone(), Arc::clone(ctx), block, buffer));
        }

        if ctx.is_complete() {
            break;
        }

        if tasks.is_empty() {
            if backpressured {
                backoff(ctx, engine.backpressure_backoff).await;
                continue;
            }
            if !ctx.is_canceled() {
                ctx.record_error(TransferError::Internal(format!(
                    "upload stalled at {} of {} bytes",
                    ctx.bytes_remote(),
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
                    Ok(Ok(block)) => {
                        let transferred = ctx.add_remote(u64::from(block.length));
                        engine.report(ctx, transferred, u64::from(block.length));
                    }
                    Ok(Err(e)) => ctx.record_error(e),
                    Err(e) => ctx.record_error(e.into()),
                }
            }
        }
    }

    drain(ctx, &mut tasks).await;

    if ctx.has_errors() || ctx.is_canceled() {
        return ctx.settle();
    }

    let block_ids: Vec<String> = (0..block_count).map(block_id).collect();
    commit(engine, ctx, &block_ids).await?;
    info!(transfer_id = %ctx.id(), blocks = block_count, "block list committed");
    ctx.mark_complete();
    ctx.settle()
}

/// Fills `buf` from `reader`, re-reading after short reads.
///
/// Running out of input before the block is full is an error.
async fn fill_block(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    buf: &mut [u8],
) -> Result<(), TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended {} bytes short of a block", buf.len() - filled),
            )));
        }
        filled += n;
    }
    Ok(())
}

/// Stages one block, retrying authorization failures.
async fn stage_block(
    engine: Engine,
    ctx: Arc<TransferContext>,
    block: Block,
    buffer: PooledBuffer,
) -> StageResult {
    let data = &buffer[..block.len()];
    let id = block_id(block.index);
    let checksum = checksum_bytes(data);
    debug!(transfer_id = %ctx.id(), block = block.index, offset = block.offset, "staging block");
    loop {
        let opts = ctx.request_options();
        let result = engine
            .store
            .put_block(ctx.uri(), &id, data, Some(&checksum), &opts)
            .await;
        match result {
            Ok(()) => return Ok(block),
            Err(e) => engine.gate.handle_failure(&ctx, e).await?,
        }
    }
}

async fn commit(
    engine: &Engine,
    ctx: &TransferContext,
    block_ids: &[String],
) -> Result<(), TransferError> {
    loop {
        if ctx.is_canceled() {
            return Err(TransferError::Canceled);
        }
        let opts = ctx.request_options();
        match engine.store.commit_blocks(ctx.uri(), block_ids, &opts).await {
            Ok(()) => return Ok(()),
            Err(e) => engine.gate.handle_failure(ctx, e).await?,
        }
    }
}
