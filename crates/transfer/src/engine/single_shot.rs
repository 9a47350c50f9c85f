//! Whole-object transfers for small and empty objects.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::Engine;
use crate::TransferError;
use crate::context::TransferContext;

/// Uploads the whole source in one request. An empty source creates an
/// empty blob.
pub(crate) async fn upload_whole(
    engine: &Engine,
    ctx: &TransferContext,
    reader: &mut (dyn AsyncRead + Send + Unpin),
) -> Result<(), TransferError> {
    let length = ctx.total_length();
    let mut data = vec![0u8; usize::try_from(length).map_err(|_| {
        TransferError::Argument(format!("{length} bytes do not fit in memory"))
    })?];
    if ctx.is_canceled() {
        return Err(TransferError::Canceled);
    }
    reader.read_exact(&mut data).await?;
    ctx.advance_local(length);
    ctx.transform(0, &mut data);

    debug!(transfer_id = %ctx.id(), length, "uploading whole blob");
    loop {
        if ctx.is_canceled() {
            return Err(TransferError::Canceled);
        }
        let opts = ctx.request_options();
        match engine.store.put_blob(ctx.uri(), &data, &opts).await {
            Ok(()) => break,
            Err(e) => engine.gate.handle_failure(ctx, e).await?,
        }
    }

    let transferred = ctx.add_remote(length);
    engine.report(ctx, transferred, length);
    ctx.mark_complete();
    Ok(())
}

/// Downloads `ctx.total_length()` bytes from `ctx.initial_offset()` in one
/// request. An empty range writes nothing.
pub(crate) async fn download_whole(
    engine: &Engine,
    ctx: &TransferContext,
    writer: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<(), TransferError> {
    let length = ctx.total_length();
    let offset = ctx.initial_offset();

    if length > 0 {
        let mut data = vec![0u8; usize::try_from(length).map_err(|_| {
            TransferError::Argument(format!("{length} bytes do not fit in memory"))
        })?];
        debug!(transfer_id = %ctx.id(), offset, length, "downloading whole range");
        loop {
            if ctx.is_canceled() {
                return Err(TransferError::Canceled);
            }
            let opts = ctx.request_options();
            match engine
                .store
                .read_range(ctx.uri(), offset, &mut data, &opts)
                .await
            {
                Ok(()) => break,
                Err(e) => engine.gate.handle_failure(ctx, e).await?,
            }
        }
        let transferred = ctx.add_remote(length);
        engine.report(ctx, transferred, length);

        ctx.transform(offset, &mut data);
        writer.write_all(&data).await?;
        ctx.advance_local(length);
    }

    writer.flush().await?;
    ctx.mark_complete();
    Ok(())
}
