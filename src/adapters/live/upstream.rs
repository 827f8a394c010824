//! Live adapter for the `UpstreamClient` port using `reqwest`.

use std::time::{Duration, Instant};

use reqwest::redirect::Policy;
use reqwest::{Client, Method};

use crate::ports::upstream::{UpstreamClient, UpstreamError, UpstreamFuture};
use crate::recording::{Headers, RequestRecord, ResponseRecord};

/// Knobs for the upstream HTTP client.
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    /// Bound on a whole upstream exchange.
    pub timeout: Duration,
    /// Accept invalid upstream certificates.
    pub insecure: bool,
    /// Follow redirects instead of relaying them to the caller.
    pub follow_redirects: bool,
}

/// Upstream client backed by `reqwest`.
pub struct LiveUpstream {
    client: Client,
    timeout: Duration,
}

impl LiveUpstream {
    /// Builds a client. System proxy settings are ignored so the proxy never
    /// loops back into itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(options: &UpstreamOptions) -> Result<Self, reqwest::Error> {
        let redirect = if options.follow_redirects { Policy::limited(10) } else { Policy::none() };
        let client = Client::builder()
            .timeout(options.timeout)
            .redirect(redirect)
            .danger_accept_invalid_certs(options.insecure)
            .no_proxy()
            .build()?;
        Ok(Self { client, timeout: options.timeout })
    }
}

impl UpstreamClient for LiveUpstream {
    fn send(&self, request: RequestRecord) -> UpstreamFuture<'_> {
        Box::pin(async move {
            let uri = request.uri.clone();
            let failed = |message: String| UpstreamError::Failed { uri: uri.clone(), message };
            let classify = |err: reqwest::Error| {
                if err.is_timeout() {
                    UpstreamError::Timeout { uri: uri.clone(), after: self.timeout }
                } else {
                    UpstreamError::Failed { uri: uri.clone(), message: err.to_string() }
                }
            };

            let method = Method::from_bytes(request.method.as_bytes())
                .map_err(|err| failed(format!("invalid method: {err}")))?;
            let mut builder = self.client.request(method, &request.uri);
            for (name, values) in &request.headers {
                for value in values {
                    builder = builder.header(name.as_str(), value.as_str());
                }
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let started = Instant::now();
            let response = builder.send().await.map_err(classify)?;
            let status = response.status().as_u16();
            let mut headers = Headers::new();
            for (name, value) in response.headers() {
                headers
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
            }
            let body = response.bytes().await.map_err(classify)?;
            tracing::debug!(
                uri = %uri,
                status,
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "upstream responded"
            );
            Ok(ResponseRecord { status, headers, body: Some(body.to_vec()) })
        })
    }
}
