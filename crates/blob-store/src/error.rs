//! Error types for store operations.

/// Errors raised by a [`BlobStore`](crate::BlobStore) call.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The service answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The request never produced a response (connection reset, DNS, ...).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid blob URI: {0}")]
    InvalidUri(String),
}

impl StoreError {
    /// Shorthand for an HTTP failure.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// HTTP status code, if the failure came from a response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` for faults raised by the network/HTTP layer.
    ///
    /// Only these are candidates for authorization retry; everything else is
    /// fatal to the transfer.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Http { .. } | Self::Transport(_))
    }

    /// Returns `true` if the request was rejected with 403 Forbidden.
    pub fn is_forbidden(&self) -> bool {
        self.status() == Some(crate::STATUS_FORBIDDEN)
    }

    /// Returns `true` for faults an ordinary retry policy may retry:
    /// transport failures, throttling and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status, .. } => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}
