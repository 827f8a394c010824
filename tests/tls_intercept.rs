//! CONNECT tunnels terminated with certificates minted by the proxy CA.

mod common;

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::TcpListener;
use vcrproxy::proxy::{CertificateAuthority, Proxy};
use vcrproxy::recording::{flush, Interaction, Recording, RequestRecord, ResponseRecord};

use common::{admin, client, live_upstream, registry, spawn_proxy, start};

fn intercepting_client(proxy_url: &str, ca: &CertificateAuthority) -> reqwest::Client {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::all(proxy_url).unwrap())
        .add_root_certificate(reqwest::Certificate::from_pem(ca.cert_pem().as_bytes()).unwrap())
        .build()
        .unwrap()
}

#[tokio::test]
async fn playback_through_connect_tunnel() {
    let storage = tempfile::tempdir().unwrap();
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), vec!["application/json".to_string()]);
    let mut recording = Recording::new("widgets");
    for (ordinal, id) in [(0, 7), (1, 9)] {
        recording.interactions.push(Interaction {
            ordinal,
            request: RequestRecord {
                method: "GET".into(),
                uri: format!("https://api.fake.test/widgets/{id}"),
                ..RequestRecord::default()
            },
            response: ResponseRecord {
                status: 200,
                headers: headers.clone(),
                body: Some(format!(r#"{{"id":{id}}}"#).into_bytes()),
            },
            duration: None,
        });
    }
    flush(&storage.path().join("widgets.json"), &recording).unwrap();

    let ca = Arc::new(CertificateAuthority::generate().unwrap());
    let proxy = Proxy::new(registry(storage.path()), live_upstream())
        .with_certificate_authority(Arc::clone(&ca));
    let proxy = spawn_proxy(proxy).await;
    let id = start(&client(), &proxy, "playback", "widgets.json").await;

    let tunneled = intercepting_client(&proxy.url(), &ca);
    let response = tunneled
        .get("https://api.fake.test/widgets/7")
        .header("x-recording-id", &id)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["id"], 7);

    let miss = tunneled
        .get("https://api.fake.test/widgets/8")
        .header("x-recording-id", &id)
        .send()
        .await
        .unwrap();
    assert_eq!(miss.status(), 404);
    let body: Value = miss.json().await.unwrap();
    let candidates = body["error"]["candidates"].as_array().unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0]["uri"], "https://api.fake.test/widgets/9");
    proxy.shutdown().await.unwrap();
}

async fn spawn_https_upstream(ca: &CertificateAuthority) -> SocketAddr {
    let acceptor = ca.acceptor_for("localhost").unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(stream) = acceptor.accept(stream).await else { return };
                let service = service_fn(|request: Request<Incoming>| async move {
                    let body = format!(r#"{{"secure":true,"path":"{}"}}"#, request.uri().path());
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn record_through_connect_tunnel() {
    let storage = tempfile::tempdir().unwrap();
    let upstream_ca = CertificateAuthority::generate().unwrap();
    let upstream = spawn_https_upstream(&upstream_ca).await;

    let ca = Arc::new(CertificateAuthority::generate().unwrap());
    let proxy = Proxy::new(registry(storage.path()), live_upstream())
        .with_certificate_authority(Arc::clone(&ca));
    let proxy = spawn_proxy(proxy).await;
    let admin_client = client();
    let id = start(&admin_client, &proxy, "record", "secure.json").await;

    let tunneled = intercepting_client(&proxy.url(), &ca);
    let url = format!("https://localhost:{}/vault/keys", upstream.port());
    let response = tunneled.get(&url).header("x-recording-id", &id).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["secure"], true);

    let (status, stopped) = admin(&admin_client, &proxy, "/record/stop", Some(&id), None).await;
    assert_eq!(status, 200, "{stopped}");
    assert_eq!(stopped["saved"], 1);
    let saved = vcrproxy::recording::load(&storage.path().join("secure.json")).unwrap();
    assert_eq!(saved.interactions[0].request.uri, url);
    proxy.shutdown().await.unwrap();
}

#[test]
fn leaves_are_minted_for_names_and_addresses() {
    let ca = CertificateAuthority::generate().unwrap();
    assert!(ca.acceptor_for("example.test:443").is_ok());
    assert!(ca.acceptor_for("example.test").is_ok());
    assert!(ca.acceptor_for("[::1]:8443").is_ok());
    assert!(ca.acceptor_for("10.0.0.7:9000").is_ok());
}
