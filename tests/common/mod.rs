#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Notify};
use vcrproxy::adapters::live::{LiveUpstream, UpstreamOptions};
use vcrproxy::adapters::memory::SequentialIds;
use vcrproxy::proxy::{Proxy, ProxyHandle};
use vcrproxy::session::{RegistryOptions, SessionRegistry};

/// A JSON echo service that counts the requests it serves.
pub struct Upstream {
    pub addr: SocketAddr,
    pub hits: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl Upstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

async fn echo(
    request: Request<Incoming>,
    hits: Arc<AtomicUsize>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let hit = hits.fetch_add(1, Ordering::SeqCst) + 1;
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let body = request.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default();
    let payload = json!({
        "method": method,
        "path": path,
        "hit": hit,
        "body": String::from_utf8_lossy(&body),
    });
    let response = Response::builder()
        .header("content-type", "application/json")
        .header("x-upstream-hit", hit.to_string())
        .body(Full::new(Bytes::from(payload.to_string())))
        .unwrap();
    Ok(response)
}

pub async fn spawn_upstream() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = oneshot::channel::<()>();
    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut rx => break,
                accepted = listener.accept() => {
                    let Ok((stream, _)) = accepted else { break };
                    let counter = Arc::clone(&counter);
                    tokio::spawn(async move {
                        let service = service_fn(move |req| echo(req, Arc::clone(&counter)));
                        let connection = TokioIo::new(stream);
                        let _ = http1::Builder::new().serve_connection(connection, service).await;
                    });
                }
            }
        }
    });
    Upstream { addr, hits, shutdown: Some(tx) }
}

/// An upstream that signals `arrived` for each request and answers only once
/// `release` is notified.
pub struct GatedUpstream {
    pub addr: SocketAddr,
    pub arrived: Arc<Notify>,
    pub release: Arc<Notify>,
}

pub async fn spawn_gated_upstream() -> GatedUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let arrived = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (on_arrival, on_release) = (Arc::clone(&arrived), Arc::clone(&release));
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (on_arrival, on_release) = (Arc::clone(&on_arrival), Arc::clone(&on_release));
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| {
                    let on_arrival = Arc::clone(&on_arrival);
                    let on_release = Arc::clone(&on_release);
                    async move {
                        on_arrival.notify_one();
                        on_release.notified().await;
                        Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"late"))))
                    }
                });
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
            });
        }
    });
    GatedUpstream { addr, arrived, release }
}

pub fn registry(storage_root: &Path) -> Arc<SessionRegistry> {
    let options =
        RegistryOptions { storage_root: storage_root.to_path_buf(), ..RegistryOptions::default() };
    Arc::new(SessionRegistry::new(options, Arc::new(SequentialIds::default())).unwrap())
}

pub fn live_upstream() -> Arc<LiveUpstream> {
    let options = UpstreamOptions {
        timeout: Duration::from_secs(10),
        insecure: true,
        follow_redirects: false,
    };
    Arc::new(LiveUpstream::new(&options).unwrap())
}

pub async fn spawn_proxy(proxy: Proxy) -> ProxyHandle {
    proxy.bind("127.0.0.1:0".parse().unwrap()).await.unwrap().spawn().unwrap()
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

/// POSTs an admin call and returns status and JSON body.
pub async fn admin(
    client: &reqwest::Client,
    proxy: &ProxyHandle,
    path: &str,
    session: Option<&str>,
    body: Option<Value>,
) -> (u16, Value) {
    let mut request = client.post(format!("{}{path}", proxy.url()));
    if let Some(session) = session {
        request = request.header("x-recording-id", session);
    }
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request.send().await.unwrap();
    let status = response.status().as_u16();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

/// Starts a session and returns its id.
pub async fn start(
    client: &reqwest::Client,
    proxy: &ProxyHandle,
    mode: &str,
    file: &str,
) -> String {
    let body = json!({ "recordingFile": file });
    let (status, body) = admin(client, proxy, &format!("/{mode}/start"), None, Some(body)).await;
    assert_eq!(status, 200, "{body}");
    body["sessionId"].as_str().unwrap().to_string()
}
