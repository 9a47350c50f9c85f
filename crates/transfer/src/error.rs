use blockshift_blob_store::StoreError;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The request was rejected before any I/O.
    #[error("invalid argument: {0}")]
    Argument(String),

    #[error(
        "{length} bytes need more than {max_blocks} blocks of {block_size} bytes"
    )]
    CapacityExceeded {
        length: u64,
        block_size: usize,
        max_blocks: u64,
    },

    /// Authorization kept failing after the signature was refreshed.
    #[error("authorization failed after {attempts} attempts: {source}")]
    TransientAuthorization {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("transfer canceled")]
    Canceled,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Errors raised while validating a request, before any I/O started.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Argument(_) | Self::CapacityExceeded { .. })
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("block task failed: {err}"))
    }
}
