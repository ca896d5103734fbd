//! Agent → server transport seam.

use async_trait::async_trait;
use drift_core::errors::DriftError;
use drift_core::hasher::Digest;
use drift_core::settings::TransportSettings;
use std::future::Future;
use std::sync::Arc;
use tracing::warn;

use crate::server::{IngestReceipt, SyncServer};

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Worth another attempt (timeouts, transient I/O).
    #[error("transient transport failure: {0}")]
    Retryable(String),
    /// The request itself was refused; retrying cannot help.
    #[error("request rejected: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<DriftError> for TransportError {
    fn from(err: DriftError) -> Self {
        if err.is_retryable() {
            Self::Retryable(err.to_string())
        } else {
            Self::Fatal(err.to_string())
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Version the server expects next for `definition`.
    async fn next_version(&self, definition: &str) -> Result<u32, TransportError>;

    /// Deliver one encoded change-set.
    async fn transmit(&self, encoded: String) -> Result<IngestReceipt, TransportError>;

    async fn upload_content(&self, digest: Digest, data: Vec<u8>) -> Result<(), TransportError>;
}

/// In-process transport calling a [`SyncServer`] directly. Server work is
/// blocking (store I/O), so it runs on the blocking pool.
#[derive(Clone)]
pub struct LocalTransport {
    server: Arc<SyncServer>,
}

impl LocalTransport {
    pub fn new(server: Arc<SyncServer>) -> Self {
        Self { server }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&SyncServer) -> drift_core::Result<T> + Send + 'static,
    {
        let server = self.server.clone();
        tokio::task::spawn_blocking(move || f(&server))
            .await
            .map_err(|e| TransportError::Retryable(format!("server task failed: {e}")))?
            .map_err(TransportError::from)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn next_version(&self, definition: &str) -> Result<u32, TransportError> {
        let definition = definition.to_string();
        self.blocking(move |server| server.next_version(&definition))
            .await
    }

    async fn transmit(&self, encoded: String) -> Result<IngestReceipt, TransportError> {
        self.blocking(move |server| server.ingest(&encoded)).await
    }

    async fn upload_content(&self, digest: Digest, data: Vec<u8>) -> Result<(), TransportError> {
        self.blocking(move |server| server.store_content(&digest, &data))
            .await
    }
}

/// Run `op` until it succeeds, fails fatally, or `max_attempts` is spent,
/// sleeping the configured backoff between attempts.
pub async fn with_retry<T, F, Fut>(
    settings: &TransportSettings,
    what: &str,
    mut op: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < settings.max_attempts => {
                let delay = settings.backoff(attempt);
                warn!(
                    operation = what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transport call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
