use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use blockshift_blob_store::{BlobUri, Credential, NoRetry, RetryPolicy, SignatureProvider};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::crypto::FileEncryption;
use crate::progress::eta_at;

/// Which way the bytes move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// Byte range of a remote object to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub start: u64,
    /// `None` reads to the end of the object.
    pub length: Option<u64>,
}

impl ByteRange {
    /// The whole object.
    pub const FULL: ByteRange = ByteRange {
        start: 0,
        length: None,
    };

    /// Builds a range from signed values; a length of -1 means "to the end".
    pub fn new(start: i64, length: i64) -> Result<Self, TransferError> {
        let start = u64::try_from(start)
            .map_err(|_| TransferError::Argument(format!("negative range start: {start}")))?;
        let length = match length {
            -1 => None,
            l => Some(u64::try_from(l).map_err(|_| {
                TransferError::Argument(format!("invalid range length: {l}"))
            })?),
        };
        Ok(Self { start, length })
    }

    /// Resolves against the object's length, returning `(offset, length)`.
    ///
    /// A length reaching past the end is clipped to the end.
    pub fn resolve(&self, object_length: u64) -> Result<(u64, u64), TransferError> {
        if self.start > object_length {
            return Err(TransferError::Argument(format!(
                "range start {} is beyond the object end {object_length}",
                self.start
            )));
        }
        let available = object_length - self.start;
        Ok((self.start, self.length.map_or(available, |l| l.min(available))))
    }
}

/// Periodic progress report for one transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferProgress {
    pub transfer_id: String,
    pub direction: Direction,
    pub bytes_transferred: u64,
    pub last_block_size: u64,
    pub total_size: u64,
    /// Integer percentage in `0..=100`.
    pub percent: u8,
    /// Bytes per second over the recent window.
    pub speed: f64,
    pub target: String,
    pub local_name: String,
}

impl TransferProgress {
    /// Remaining time at the current speed, if any bytes are moving.
    pub fn eta(&self) -> Option<Duration> {
        eta_at(
            self.speed,
            self.total_size.saturating_sub(self.bytes_transferred),
        )
    }
}

/// Final state of a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum TransferStatus {
    Completed,
    Canceled,
    Failed(String),
}

/// Emitted once when a transfer settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferCompletion {
    pub transfer_id: String,
    pub direction: Direction,
    pub target: String,
    pub local_name: String,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
}

impl TransferCompletion {
    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Completed
    }
}

/// Event delivered to a client's listener.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransferEvent {
    Progress(TransferProgress),
    Completed(TransferCompletion),
}

/// Where upload bytes come from.
pub enum UploadSource {
    Path(PathBuf),
    /// A stream yielding exactly `length` bytes.
    Reader {
        reader: Box<dyn AsyncRead + Send + Unpin>,
        length: u64,
    },
}

impl UploadSource {
    pub(crate) fn local_name(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Reader { .. } => "<stream>".into(),
        }
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Reader { length, .. } => f
                .debug_struct("Reader")
                .field("length", length)
                .finish_non_exhaustive(),
        }
    }
}

/// Where downloaded bytes go.
pub enum DownloadTarget {
    /// File created (or truncated) at the path; parent directories are created.
    Path(PathBuf),
    Writer(Box<dyn AsyncWrite + Send + Unpin>),
}

impl DownloadTarget {
    pub(crate) fn local_name(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Writer(_) => "<stream>".into(),
        }
    }
}

impl fmt::Debug for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Self::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// Options shared by upload and download requests.
#[derive(Clone)]
pub struct TransferOptions {
    pub credential: Credential,
    pub cancel: CancellationToken,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub signature_provider: Option<Arc<dyn SignatureProvider>>,
    pub encryption: Option<Arc<FileEncryption>>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            credential: Credential::None,
            cancel: CancellationToken::new(),
            retry_policy: Arc::new(NoRetry),
            signature_provider: None,
            encryption: None,
        }
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("credential", &self.credential.is_ambient())
            .field("canceled", &self.cancel.is_cancelled())
            .field("retry_policy", &self.retry_policy)
            .field("signature_provider", &self.signature_provider.is_some())
            .field("encrypted", &self.encryption.is_some())
            .finish()
    }
}

/// Moves a local file or stream into a blob.
#[derive(Debug)]
pub struct UploadRequest {
    pub source: UploadSource,
    pub destination: BlobUri,
    pub options: TransferOptions,
}

impl UploadRequest {
    pub fn new(source: UploadSource, destination: BlobUri) -> Self {
        Self {
            source,
            destination,
            options: TransferOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }
}

/// Moves a blob (or a range of it) into a local file or stream.
#[derive(Debug)]
pub struct DownloadRequest {
    pub source: BlobUri,
    pub destination: DownloadTarget,
    pub range: ByteRange,
    pub options: TransferOptions,
}

impl DownloadRequest {
    pub fn new(source: BlobUri, destination: DownloadTarget) -> Self {
        Self {
            source,
            destination,
            range: ByteRange::FULL,
            options: TransferOptions::default(),
        }
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = range;
        self
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_range_rejects_negative_values() {
        assert!(matches!(
            ByteRange::new(-1, 10),
            Err(TransferError::Argument(_))
        ));
        assert!(matches!(
            ByteRange::new(0, -2),
            Err(TransferError::Argument(_))
        ));
        assert_eq!(ByteRange::new(5, -1).unwrap().length, None);
    }

    #[test]
    fn byte_range_resolve() {
        assert_eq!(ByteRange::FULL.resolve(100).unwrap(), (0, 100));
        assert_eq!(ByteRange::new(10, 20).unwrap().resolve(100).unwrap(), (10, 20));
        assert_eq!(ByteRange::new(90, 20).unwrap().resolve(100).unwrap(), (90, 10));
        assert_eq!(ByteRange::new(100, -1).unwrap().resolve(100).unwrap(), (100, 0));
        assert!(ByteRange::new(101, -1).unwrap().resolve(100).is_err());
    }

    #[test]
    fn progress_eta() {
        let progress = TransferProgress {
            transfer_id: "t".into(),
            direction: Direction::Download,
            bytes_transferred: 100,
            last_block_size: 50,
            total_size: 300,
            percent: 33,
            speed: 100.0,
            target: "mem://h/c/b".into(),
            local_name: "b".into(),
        };
        assert_eq!(progress.eta(), Some(Duration::from_secs(2)));

        let stalled = TransferProgress {
            speed: 0.0,
            ..progress
        };
        assert!(stalled.eta().is_none());
    }

    #[test]
    fn completion_serializes_status() {
        let completion = TransferCompletion {
            transfer_id: "t".into(),
            direction: Direction::Upload,
            target: "mem://h/c/b".into(),
            local_name: "b".into(),
            bytes_transferred: 0,
            status: TransferStatus::Failed("boom".into()),
        };
        let json = serde_json::to_value(&completion).unwrap();
        assert_eq!(json["direction"], "upload");
        assert_eq!(json["status"]["status"], "failed");
        assert_eq!(json["status"]["error"], "boom");
        assert!(!completion.is_success());
    }
}
