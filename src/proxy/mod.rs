//! The recording proxy server.
//!
//! One listener serves forward-proxy traffic (absolute-form and `CONNECT`),
//! reverse-proxy traffic (`x-recording-upstream-base-uri`) and the admin
//! API. Each accepted connection runs on its own task.

pub mod admin;
pub mod dispatch;
pub mod http;
pub mod tls;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::assets::AssetSynchronizer;
use crate::ports::UpstreamClient;
use crate::session::SessionRegistry;

pub use tls::{CertificateAuthority, TlsError};

/// Default request body limit.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Everything a connection needs, shared across tasks.
pub(crate) struct ProxyState {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) upstream: Arc<dyn UpstreamClient>,
    pub(crate) ca: Option<Arc<CertificateAuthority>>,
    pub(crate) assets: Option<Arc<AssetSynchronizer>>,
    pub(crate) admin_key: Option<String>,
    pub(crate) max_body_bytes: usize,
}

/// Builder for a proxy instance.
pub struct Proxy {
    state: ProxyState,
    idle_timeout: Option<Duration>,
}

impl Proxy {
    /// A proxy without TLS interception, admin key or asset support.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self {
            state: ProxyState {
                registry,
                upstream,
                ca: None,
                assets: None,
                admin_key: None,
                max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            },
            idle_timeout: None,
        }
    }

    /// Terminates `CONNECT` tunnels with leaves signed by `ca`.
    #[must_use]
    pub fn with_certificate_authority(mut self, ca: Arc<CertificateAuthority>) -> Self {
        self.state.ca = Some(ca);
        self
    }

    /// Lets start requests name an `assetsFile` to restore first.
    #[must_use]
    pub fn with_assets(mut self, assets: Arc<AssetSynchronizer>) -> Self {
        self.state.assets = Some(assets);
        self
    }

    /// Requires `key` on admin calls.
    #[must_use]
    pub fn with_admin_key(mut self, key: Option<String>) -> Self {
        self.state.admin_key = key.filter(|key| !key.is_empty());
        self
    }

    /// Caps request bodies.
    #[must_use]
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.state.max_body_bytes = limit;
        self
    }

    /// Force-stops sessions idle for longer than `timeout`.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(self, addr: SocketAddr) -> io::Result<ProxyServer> {
        let listener = TcpListener::bind(addr).await?;
        Ok(ProxyServer { listener, state: Arc::new(self.state), idle_timeout: self.idle_timeout })
    }
}

/// A bound proxy, ready to serve.
pub struct ProxyServer {
    listener: TcpListener,
    state: Arc<ProxyState>,
    idle_timeout: Option<Duration>,
}

impl ProxyServer {
    /// Address the listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub async fn serve_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.local_addr()?;
        tracing::info!(addr = %addr, tls = self.state.ca.is_some(), "proxy listening");
        let reaper =
            self.idle_timeout.map(|timeout| spawn_reaper(Arc::clone(&self.state), timeout));
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => break,
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::trace!(peer = %peer, "accepted connection");
                            let state = Arc::clone(&self.state);
                            tokio::spawn(dispatch::serve_connection(state, stream, None));
                        }
                        Err(err) => tracing::warn!(error = %err, "accept failed"),
                    }
                }
            }
        }
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        tracing::info!(addr = %addr, "proxy stopped");
        Ok(())
    }

    /// Serves on a background task.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be read.
    pub fn spawn(self) -> io::Result<ProxyHandle> {
        let addr = self.local_addr()?;
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(self.serve_until(async move {
            let _ = signal.await;
        }));
        Ok(ProxyHandle { addr, shutdown: Some(shutdown), task })
    }
}

/// A proxy serving on a background task.
pub struct ProxyHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<()>>,
}

impl ProxyHandle {
    /// Bound address.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `http://<addr>`.
    #[must_use]
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Stops accepting connections and waits for the accept loop to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the server task failed.
    pub async fn shutdown(mut self) -> io::Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match (&mut self.task).await {
            Ok(result) => result,
            Err(err) => Err(io::Error::other(err)),
        }
    }
}

fn spawn_reaper(state: Arc<ProxyState>, timeout: Duration) -> JoinHandle<()> {
    let period = (timeout / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let reaped = state.registry.reap_idle(timeout).await;
            if !reaped.is_empty() {
                tracing::info!(count = reaped.len(), "reaped idle sessions");
            }
        }
    })
}
