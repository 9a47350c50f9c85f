use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use blockshift_blob_store::DirBlobStore;
use blockshift_transfer::{
    ByteRange, DownloadRequest, DownloadTarget, FileEncryption, TransferClient,
    TransferCompletion, TransferConfig, TransferEvent, TransferOptions, UploadRequest,
    UploadSource, parse_uri,
};
use clap::{Args, Parser, Subcommand};
use tokio::signal;

/// URI scheme and host used for blobs in the local directory store.
const LOCAL_ENDPOINT: &str = "file://local";

#[derive(Parser)]
#[command(name = "blockshift")]
#[command(about = "Chunked transfers to and from a directory-backed blob store", long_about = None)]
pub struct Cli {
    /// Root directory of the blob store.
    #[arg(short, long, env = "BLOCKSHIFT_ROOT", default_value = "./blobs")]
    pub root: PathBuf,

    /// JSON configuration file; defaults apply when it does not exist.
    #[arg(short, long, env = "BLOCKSHIFT_CONFIG", default_value = "blockshift.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upload a local file into a blob.
    Upload {
        file: PathBuf,
        blob: String,
        #[command(flatten)]
        crypto: CryptoArgs,
    },
    /// Download a blob, or a range of it, into a local file.
    Download {
        blob: String,
        file: PathBuf,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        start: i64,
        /// Bytes to read; -1 reads to the end.
        #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
        length: i64,
        #[command(flatten)]
        crypto: CryptoArgs,
    },
    /// Print the effective configuration.
    Config,
}

#[derive(Args, Clone)]
pub struct CryptoArgs {
    /// AES-256 key as 64 hex characters; enables per-block encryption.
    #[arg(long, env = "BLOCKSHIFT_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Per-file initialization vector.
    #[arg(long, default_value_t = 0)]
    pub iv: u64,
}

impl CryptoArgs {
    fn encryption(&self) -> Result<Option<Arc<FileEncryption>>> {
        let Some(key) = &self.key else {
            return Ok(None);
        };
        let bytes = hex::decode(key).context("key is not valid hex")?;
        let key: [u8; 32] = match bytes.try_into() {
            Ok(key) => key,
            Err(bytes) => bail!("key must be 32 bytes, got {}", bytes.len()),
        };
        Ok(Some(Arc::new(FileEncryption::aes_ctr(key, self.iv))))
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let config = TransferConfig::load(&self.config)
            .with_context(|| format!("loading {}", self.config.display()))?;

        match &self.command {
            Command::Config => {
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            Command::Upload { file, blob, crypto } => {
                let mut client = self.client(config);
                let request = UploadRequest::new(UploadSource::Path(file.clone()), blob_uri(blob)?)
                    .with_options(options(crypto)?);
                let completion = with_progress(&mut client, |c| c.upload(request)).await?;
                report(&completion)
            }
            Command::Download {
                blob,
                file,
                start,
                length,
                crypto,
            } => {
                let mut client = self.client(config);
                let request =
                    DownloadRequest::new(blob_uri(blob)?, DownloadTarget::Path(file.clone()))
                        .with_range(ByteRange::new(*start, *length)?)
                        .with_options(options(crypto)?);
                let completion = with_progress(&mut client, |c| c.download(request)).await?;
                report(&completion)
            }
        }
    }

    fn client(&self, config: TransferConfig) -> TransferClient {
        TransferClient::new(Arc::new(DirBlobStore::new(self.root.clone())), config)
    }
}

fn blob_uri(blob: &str) -> Result<blockshift_blob_store::BlobUri> {
    Ok(parse_uri(&format!("{LOCAL_ENDPOINT}/{}", blob.trim_start_matches('/')))?)
}

/// Transfer options that cancel on Ctrl-C.
fn options(crypto: &CryptoArgs) -> Result<TransferOptions> {
    let options = TransferOptions {
        encryption: crypto.encryption()?,
        ..TransferOptions::default()
    };
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, canceling transfer");
            cancel.cancel();
        }
    });
    Ok(options)
}

/// Runs a transfer while logging its progress events.
async fn with_progress<'a, F, Fut>(
    client: &'a mut TransferClient,
    start: F,
) -> Result<TransferCompletion>
where
    F: FnOnce(&'a TransferClient) -> Fut,
    Fut: std::future::Future<Output = Result<TransferCompletion, blockshift_transfer::TransferError>>,
{
    let Some(mut events) = client.take_events() else {
        bail!("event receiver already taken");
    };
    let logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransferEvent::Progress(p) => tracing::info!(
                    transfer_id = %p.transfer_id,
                    percent = p.percent,
                    bytes = p.bytes_transferred,
                    speed = format!("{:.1} MiB/s", p.speed / (1024.0 * 1024.0)),
                    eta = ?p.eta(),
                    "progress"
                ),
                TransferEvent::Completed(_) => break,
            }
        }
    });

    match start(client).await {
        Ok(completion) => {
            let _ = logger.await;
            Ok(completion)
        }
        Err(e) => {
            // Rejected transfers never send a completion event.
            logger.abort();
            Err(e.into())
        }
    }
}

fn report(completion: &TransferCompletion) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(completion)?);
    if !completion.is_success() {
        bail!("transfer {} did not complete", completion.transfer_id);
    }
    Ok(())
}
