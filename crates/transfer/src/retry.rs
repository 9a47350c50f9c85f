//! Authorization retry gate.
//!
//! Short-lived signatures expire mid-transfer and freshly issued ones may not
//! be active yet. A 403 with a signature provider at hand is therefore
//! retried after a pause with a refreshed signature, up to a per-transfer
//! limit. Every other failure is fatal here; ordinary transient faults are
//! the store's retry policy's business.

use std::future::Future;
use std::time::Duration;

use blockshift_blob_store::StoreError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::TransferError;
use crate::config::TransferConfig;
use crate::context::TransferContext;

/// What to do about a failed store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Fatal,
    RetryAuthorization,
}

/// Classifies a store failure.
pub fn classify(err: &StoreError, has_signature_provider: bool) -> Verdict {
    if !err.is_transport() {
        return Verdict::Fatal;
    }
    if err.is_forbidden() && has_signature_provider {
        Verdict::RetryAuthorization
    } else {
        Verdict::Fatal
    }
}

#[derive(Debug, Clone)]
pub struct AuthRetryGate {
    max_retries: u32,
    backoff: Duration,
    activation_deadline: Duration,
}

impl AuthRetryGate {
    pub fn new(max_retries: u32, backoff: Duration, activation_deadline: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            activation_deadline,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(
            config.max_auth_retries,
            config.auth_retry_backoff,
            config.activation_deadline,
        )
    }

    /// Decides whether a failed call may be retried.
    ///
    /// Returns `Ok(())` once the caller should retry with the refreshed
    /// signature now held by `ctx`; otherwise the error ending the transfer.
    pub(crate) async fn handle_failure(
        &self,
        ctx: &TransferContext,
        err: StoreError,
    ) -> Result<(), TransferError> {
        if classify(&err, ctx.has_signature_provider()) == Verdict::Fatal {
            return Err(TransferError::Store(err));
        }

        let attempts = ctx.bump_auth_retries();
        if attempts >= self.max_retries {
            return Err(TransferError::TransientAuthorization {
                attempts,
                source: err,
            });
        }
        warn!(
            transfer_id = %ctx.id(),
            attempt = attempts,
            error = %err,
            "authorization failed, refreshing signature"
        );

        sleep_or_cancel(self.backoff, ctx.cancel_token()).await?;

        if let Some(provider) = ctx.signature_provider() {
            let signature = provider.fetch().await?;
            ctx.set_signature(signature);
        }
        Ok(())
    }

    /// Runs `op`, retrying 403 answers until the activation deadline.
    ///
    /// Other failures are returned at once. Once the deadline has passed the
    /// last 403 is returned.
    pub async fn wait_for_activation<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_forbidden() && started.elapsed() < self.activation_deadline => {
                    debug!(error = %err, elapsed = ?started.elapsed(), "waiting for signature activation");
                    sleep_or_cancel(self.backoff, cancel).await?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<(), TransferError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(TransferError::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
