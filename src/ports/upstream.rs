//! Upstream HTTP port used by the proxy to reach real services.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::recording::{RequestRecord, ResponseRecord};

/// Boxed future type alias used by [`UpstreamClient`] to keep the trait dyn-compatible.
pub type UpstreamFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ResponseRecord, UpstreamError>> + Send + 'a>>;

/// Failures talking to an upstream service.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// No complete response within the configured bound.
    #[error("upstream {uri} did not respond within {}s", .after.as_secs())]
    Timeout {
        /// Target URI.
        uri: String,
        /// Configured bound.
        after: Duration,
    },
    /// Connection, TLS or protocol failure.
    #[error("upstream {uri} failed: {message}")]
    Failed {
        /// Target URI.
        uri: String,
        /// Description of the failure.
        message: String,
    },
}

/// Sends requests to the real upstream host.
pub trait UpstreamClient: Send + Sync {
    /// Forwards `request` (absolute URI, hop-by-hop headers already removed)
    /// and returns the complete response.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Timeout`] when the bound elapses, or
    /// [`UpstreamError::Failed`] for any other transport failure.
    fn send(&self, request: RequestRecord) -> UpstreamFuture<'_>;
}
