//! Client facade: validation, path selection and reporting.

use std::collections::HashSet;
use std::sync::Arc;

use blockshift_blob_store::{BlobStore, BlobUri, ConnectionTuner};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tracing::{error, info, warn};

use crate::TransferError;
use crate::block::{download_block_size, partition, upload_block_size};
use crate::config::TransferConfig;
use crate::context::{TransferContext, TransferLabel};
use crate::engine::{Engine, download_chunked, download_whole, upload_chunked, upload_whole};
use crate::pool::PoolRegistry;
use crate::retry::AuthRetryGate;
use crate::types::{
    Direction, DownloadRequest, DownloadTarget, TransferCompletion, TransferEvent,
    TransferStatus, UploadRequest, UploadSource,
};
use crate::validation::{validate_download, validate_upload};

/// Event channel slots available to progress events.
const PROGRESS_EVENT_CAPACITY: usize = 256;

/// Moves files and streams to and from one blob store.
pub struct TransferClient {
    store: Arc<dyn BlobStore>,
    config: TransferConfig,
    gate: AuthRetryGate,
    pools: Arc<PoolRegistry>,
    tuner: Option<Arc<dyn ConnectionTuner>>,
    tuned: Mutex<HashSet<String>>,
    slots: Arc<Semaphore>,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    listening: bool,
}

impl TransferClient {
    /// Creates a client using the process-wide buffer pools.
    pub fn new(store: Arc<dyn BlobStore>, config: TransferConfig) -> Self {
        let reserved = config.max_concurrent_transfers.max(1);
        let (events_tx, events_rx) = mpsc::channel(PROGRESS_EVENT_CAPACITY + reserved);
        Self {
            store,
            gate: AuthRetryGate::from_config(&config),
            slots: Arc::new(Semaphore::new(reserved)),
            config,
            pools: PoolRegistry::global(),
            tuner: None,
            tuned: Mutex::new(HashSet::new()),
            events_tx,
            events_rx: Some(events_rx),
            listening: false,
        }
    }

    /// Uses `pools` instead of the process-wide registry.
    pub fn with_pool_registry(mut self, pools: Arc<PoolRegistry>) -> Self {
        self.pools = pools;
        self
    }

    /// Tunes connections once for every distinct endpoint this client targets.
    pub fn with_connection_tuner(mut self, tuner: Arc<dyn ConnectionTuner>) -> Self {
        self.tuner = Some(tuner);
        self
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// Once taken, failed transfers are reported through the completion
    /// event and return `Ok`.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        let rx = self.events_rx.take();
        self.listening |= rx.is_some();
        rx
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    /// Uploads a local file or stream into a blob.
    pub async fn upload(
        &self,
        request: UploadRequest,
    ) -> Result<TransferCompletion, TransferError> {
        self.check_config()?;
        validate_upload(&request)?;
        let UploadRequest {
            source,
            destination,
            options,
        } = request;
        let label = TransferLabel::new(Direction::Upload, destination, source.local_name());

        let (mut reader, length) = match open_source(source).await {
            Ok(opened) => opened,
            Err(e) => return self.finish(&label, 0, Err(e)),
        };

        let chunked = length > self.config.single_shot_threshold;
        let block_size = if chunked {
            upload_block_size(length, &self.config)?
        } else {
            0
        };

        self.tune(label.uri.endpoint());
        let _permit = self.acquire_slot().await?;
        info!(
            transfer_id = %label.id,
            target = %label.uri,
            length,
            block_size,
            "upload started"
        );

        let engine = self.engine();
        let blocks = if chunked {
            partition(0, length, block_size)
        } else {
            Vec::new()
        };
        let ctx = Arc::new(TransferContext::new(
            label, 0, length, block_size, blocks, &options,
        ));

        let result = if chunked {
            let pool = self.pools.pool_for(block_size);
            let result = upload_chunked(&engine, &pool, &ctx, reader.as_mut()).await;
            self.after_chunked();
            result
        } else {
            upload_whole(&engine, &ctx, reader.as_mut()).await
        };

        log_auth_retries(&ctx);
        self.finish(ctx.label(), ctx.bytes_remote(), result)
    }

    /// Downloads a blob, or a range of it, into a local file or stream.
    pub async fn download(
        &self,
        request: DownloadRequest,
    ) -> Result<TransferCompletion, TransferError> {
        self.check_config()?;
        validate_download(&request)?;
        let DownloadRequest {
            source,
            destination,
            range,
            options,
        } = request;
        let label = TransferLabel::new(Direction::Download, source, destination.local_name());

        self.tune(label.uri.endpoint());
        let _permit = self.acquire_slot().await?;

        let probe = blockshift_blob_store::RequestOptions {
            signature: None,
            credential: options.credential.clone(),
            retry_policy: Arc::clone(&options.retry_policy),
        };
        let properties = self
            .gate
            .wait_for_activation(&options.cancel, || {
                self.store.properties(&label.uri, &probe)
            })
            .await;
        let properties = match properties {
            Ok(properties) => properties,
            Err(e) => return self.finish(&label, 0, Err(e)),
        };

        let (offset, length) = range.resolve(properties.length)?;
        let chunked = length > self.config.single_shot_threshold;
        let block_size = if chunked {
            download_block_size(length, &self.config)?
        } else {
            0
        };

        let mut writer = match open_target(destination).await {
            Ok(writer) => writer,
            Err(e) => return self.finish(&label, 0, Err(e)),
        };
        info!(
            transfer_id = %label.id,
            source = %label.uri,
            offset,
            length,
            block_size,
            "download started"
        );

        let engine = self.engine();
        let blocks = if chunked {
            partition(offset, length, block_size)
        } else {
            Vec::new()
        };
        let ctx = Arc::new(TransferContext::new(
            label, offset, length, block_size, blocks, &options,
        ));

        let result = if chunked {
            let pool = self.pools.pool_for(block_size);
            let result = download_chunked(&engine, &pool, &ctx, writer.as_mut()).await;
            self.after_chunked();
            result
        } else {
            download_whole(&engine, &ctx, writer.as_mut()).await
        };

        log_auth_retries(&ctx);
        self.finish(ctx.label(), ctx.bytes_local(), result)
    }

    /// Rejects transfers while the configuration is unusable.
    fn check_config(&self) -> Result<(), TransferError> {
        self.config
            .validate()
            .map_err(|e| TransferError::Argument(e.to_string()))
    }

    fn engine(&self) -> Engine {
        Engine {
            store: Arc::clone(&self.store),
            gate: self.gate.clone(),
            concurrency: self.config.concurrency.max(1),
            backpressure_backoff: self.config.backpressure_backoff,
            events: self.listening.then(|| self.events_tx.clone()),
            reserved_events: self.config.max_concurrent_transfers.max(1),
        }
    }

    fn tune(&self, endpoint: &str) {
        let Some(tuner) = &self.tuner else {
            return;
        };
        if self.tuned.lock().insert(endpoint.to_string()) {
            tuner.tune(endpoint, self.config.connections_per_endpoint);
        }
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, TransferError> {
        Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|e| TransferError::Internal(format!("transfer slots closed: {e}")))
    }

    fn after_chunked(&self) {
        if self.config.trim_pool_after_transfer {
            self.pools.trim_all();
        }
    }

    /// Turns an engine outcome into the caller's result and completion event.
    fn finish(
        &self,
        label: &TransferLabel,
        bytes_transferred: u64,
        result: Result<(), TransferError>,
    ) -> Result<TransferCompletion, TransferError> {
        let (status, failure) = match result {
            Ok(()) => (TransferStatus::Completed, None),
            Err(TransferError::Canceled) => (TransferStatus::Canceled, None),
            Err(e) if e.is_rejection() => return Err(e),
            Err(e) => (TransferStatus::Failed(e.to_string()), Some(e)),
        };
        let completion = label.completion(bytes_transferred, status);

        match &completion.status {
            TransferStatus::Failed(message) => {
                error!(transfer_id = %label.id, error = %message, "transfer failed");
            }
            status => {
                info!(transfer_id = %label.id, ?status, bytes = bytes_transferred, "transfer finished");
            }
        }

        if self.listening {
            if let Err(e) = self
                .events_tx
                .try_send(TransferEvent::Completed(completion.clone()))
            {
                warn!(transfer_id = %label.id, error = %e, "completion event dropped");
            }
            return Ok(completion);
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(completion),
        }
    }
}

fn log_auth_retries(ctx: &TransferContext) {
    let retries = ctx.auth_retries();
    if retries > 0 {
        warn!(transfer_id = %ctx.id(), retries, "authorization was retried");
    }
}

type LocalReader = Box<dyn AsyncRead + Send + Unpin>;

/// Opens the upload source, returning it with its length.
async fn open_source(source: UploadSource) -> Result<(LocalReader, u64), TransferError> {
    match source {
        UploadSource::Path(path) => {
            let file = tokio::fs::File::open(&path).await?;
            let length = file.metadata().await?.len();
            let reader: LocalReader = Box::new(file);
            Ok((reader, length))
        }
        UploadSource::Reader { reader, length } => Ok((reader, length)),
    }
}

async fn open_target(
    target: DownloadTarget,
) -> Result<Box<dyn AsyncWrite + Send + Unpin>, TransferError> {
    match target {
        DownloadTarget::Path(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            Ok(Box::new(tokio::fs::File::create(&path).await?))
        }
        DownloadTarget::Writer(writer) => Ok(writer),
    }
}

/// Parses a blob URI, mapping failures to argument errors.
pub fn parse_uri(raw: &str) -> Result<BlobUri, TransferError> {
    BlobUri::parse(raw).map_err(|e| TransferError::Argument(e.to_string()))
}
