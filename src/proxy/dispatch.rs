//! Per-connection request routing.
//!
//! Absolute-form requests and requests carrying
//! `x-recording-upstream-base-uri` are forwarded; `CONNECT` opens a tunnel
//! that is either TLS-terminated with a minted leaf or relayed blindly;
//! every other origin-form request is an admin call.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::admin;
use super::http::{
    empty, error_response, header_str, headers_from, into_response, read_body, strip_hop_by_hop,
    ProxyBody, Skip, RECORDING_ID, RECORDING_SKIP, UPSTREAM_BASE_URI,
};
use super::ProxyState;
use crate::error::ProxyError;
use crate::recording::interaction::remove_header;
use crate::recording::{Exchange, RequestRecord, ResponseRecord};
use crate::session::Mode;

/// An intercepted TLS tunnel: where its requests go and which session the
/// `CONNECT` named.
#[derive(Debug)]
pub(crate) struct Tunnel {
    base: String,
    session: Option<String>,
}

/// Serves HTTP/1.1 on `io` until the client disconnects.
pub(crate) fn serve_connection<S>(
    state: Arc<ProxyState>,
    io: S,
    tunnel: Option<Arc<Tunnel>>,
) -> Pin<Box<dyn Future<Output = ()> + Send>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Box::pin(async move {
        let service = service_fn(move |request: Request<Incoming>| {
            let state = Arc::clone(&state);
            let tunnel = tunnel.clone();
            async move { Ok::<_, Infallible>(handle(state, request, tunnel.as_deref()).await) }
        });
        let connection =
            http1::Builder::new().serve_connection(TokioIo::new(io), service).with_upgrades();
        if let Err(err) = connection.await {
            tracing::debug!(error = %err, "connection closed with error");
        }
    })
}

async fn handle(
    state: Arc<ProxyState>,
    request: Request<Incoming>,
    tunnel: Option<&Tunnel>,
) -> Response<ProxyBody> {
    if request.method() == Method::CONNECT {
        if tunnel.is_some() {
            let nested =
                ProxyError::InvalidRequest("CONNECT inside a tunnel is not supported".into());
            return error_response(&nested);
        }
        return connect(state, request);
    }

    let path = path_and_query(request.uri());
    let uri = match tunnel {
        Some(tunnel) => format!("{}{path}", tunnel.base),
        None if request.uri().scheme().is_some() => request.uri().to_string(),
        None => match header_str(request.headers(), UPSTREAM_BASE_URI) {
            Some(base) => format!("{}{path}", base.trim().trim_end_matches('/')),
            None => return admin::handle(&state, request).await,
        },
    };

    let inherited = tunnel.and_then(|tunnel| tunnel.session.as_deref());
    match forward(&state, request, uri, inherited).await {
        Ok(response) => response,
        Err(err) => {
            tracing::warn!(kind = err.kind(), error = %err, "request failed");
            error_response(&err)
        }
    }
}

fn path_and_query(uri: &Uri) -> &str {
    uri.path_and_query().map_or("/", |pq| pq.as_str())
}

/// Forwards, records or plays back one request depending on its session.
async fn forward(
    state: &ProxyState,
    request: Request<Incoming>,
    uri: String,
    inherited: Option<&str>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let session = header_str(request.headers(), RECORDING_ID).or(inherited).map(str::to_string);
    let skip = Skip::parse(header_str(request.headers(), RECORDING_SKIP))?;
    let handle = session.as_deref().map(|raw| state.registry.lookup(raw)).transpose()?;

    let (parts, body) = read_body(request, state.max_body_bytes).await?;
    let mut headers = headers_from(&parts.headers);
    strip_hop_by_hop(&mut headers);
    remove_header(&mut headers, "host");
    remove_header(&mut headers, "content-length");
    let request = RequestRecord {
        method: parts.method.as_str().to_string(),
        uri,
        headers,
        body: (!body.is_empty()).then(|| body.to_vec()),
    };

    let Some(handle) = handle else {
        tracing::debug!(method = %request.method, uri = %request.uri, "passthrough");
        return Ok(into_response(send_upstream(state, request).await?));
    };

    match handle.mode() {
        Mode::Playback => Ok(into_response(state.registry.playback(&handle, &request).await?)),
        Mode::Record => {
            let started = Instant::now();
            let response = send_upstream(state, request.clone()).await?;
            if skip != Skip::RequestResponse {
                let mut recorded = request;
                if skip == Skip::RequestBody {
                    recorded.body = None;
                }
                let exchange = Exchange {
                    request: recorded,
                    response: response.clone(),
                    duration: Some(started.elapsed()),
                };
                match state.registry.record(&handle, exchange).await {
                    Ok(ordinal) => tracing::debug!(session = %handle.id(), ordinal, "recorded"),
                    Err(err) => {
                        tracing::warn!(
                            session = %handle.id(),
                            error = %err,
                            "exchange not recorded"
                        );
                        return Err(err);
                    }
                }
            }
            Ok(into_response(response))
        }
    }
}

async fn send_upstream(
    state: &ProxyState,
    request: RequestRecord,
) -> Result<ResponseRecord, ProxyError> {
    let mut response = state.upstream.send(request).await?;
    strip_hop_by_hop(&mut response.headers);
    Ok(response)
}

/// Answers `CONNECT` with 200 and takes over the upgraded connection.
fn connect(state: Arc<ProxyState>, request: Request<Incoming>) -> Response<ProxyBody> {
    let Some(authority) = request.uri().authority().map(ToString::to_string) else {
        return error_response(&ProxyError::InvalidRequest("CONNECT requires host:port".into()));
    };
    let session = header_str(request.headers(), RECORDING_ID).map(str::to_string);

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(request).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!(authority = %authority, error = %err, "CONNECT upgrade failed");
                return;
            }
        };
        let Some(ca) = state.ca.clone() else {
            relay(upgraded, &authority).await;
            return;
        };
        let acceptor = match ca.acceptor_for(&authority) {
            Ok(acceptor) => acceptor,
            Err(err) => {
                tracing::error!(
                    authority = %authority,
                    error = %err,
                    "cannot mint leaf certificate"
                );
                return;
            }
        };
        match acceptor.accept(TokioIo::new(upgraded)).await {
            Ok(stream) => {
                let base = match authority.strip_suffix(":443") {
                    Some(host) => format!("https://{host}"),
                    None => format!("https://{authority}"),
                };
                tracing::debug!(base = %base, "intercepting tunnel");
                serve_connection(state, stream, Some(Arc::new(Tunnel { base, session }))).await;
            }
            Err(err) => {
                tracing::debug!(authority = %authority, error = %err, "TLS handshake failed");
            }
        }
    });
    empty(StatusCode::OK)
}

/// Blind byte relay used when interception is disabled.
async fn relay(upgraded: hyper::upgrade::Upgraded, authority: &str) {
    let mut server = match TcpStream::connect(authority).await {
        Ok(server) => server,
        Err(err) => {
            tracing::warn!(authority, error = %err, "tunnel target unreachable");
            return;
        }
    };
    let mut client = TokioIo::new(upgraded);
    match tokio::io::copy_bidirectional(&mut client, &mut server).await {
        Ok((up, down)) => tracing::debug!(authority, up, down, "tunnel closed"),
        Err(err) => tracing::debug!(authority, error = %err, "tunnel closed with error"),
    }
}
