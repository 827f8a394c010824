//! Admin API: session lifecycle and per-session configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::http::{
    error_response, header_str, json_response, read_body, ProxyBody, ADMIN_KEY, RECORDING_ID,
    RECORDING_SAVE,
};
use super::ProxyState;
use crate::assets::LocatedManifest;
use crate::error::ProxyError;
use crate::matcher::MatcherConfig;
use crate::sanitize::SanitizerSpec;
use crate::session::{Mode, SessionId, StartOptions, StopOptions};
use crate::transform::TransformSpec;

/// Body of `/record/start` and `/playback/start`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default, alias = "x-recording-file")]
    recording_file: Option<String>,
    #[serde(default, alias = "x-recording-assets-file")]
    assets_file: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

/// Body of `/record/stop`.
#[derive(Debug, Default, Deserialize)]
struct StopRequest {
    #[serde(default)]
    variables: BTreeMap<String, String>,
}

/// Routes an origin-form request that is not being proxied.
pub(crate) async fn handle(state: &ProxyState, request: Request<Incoming>) -> Response<ProxyBody> {
    let method = request.method().clone();
    let path = request.uri().path().trim_end_matches('/').to_ascii_lowercase();
    if path == "/admin/isalive" && method == Method::GET {
        return json_response(StatusCode::OK, &json!({ "status": "alive" }), None);
    }
    let result = match authorize(state, request.headers()) {
        Ok(()) => route(state, &method, &path, request).await,
        Err(err) => Err(err),
    };
    result.unwrap_or_else(|err| {
        tracing::warn!(
            method = %method,
            path = %path,
            kind = err.kind(),
            error = %err,
            "admin request failed"
        );
        error_response(&err)
    })
}

fn authorize(state: &ProxyState, headers: &HeaderMap) -> Result<(), ProxyError> {
    let Some(expected) = state.admin_key.as_deref() else {
        return Ok(());
    };
    let bearer = header_str(headers, "authorization")
        .map(str::trim)
        .and_then(|value| value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer ")));
    let provided = bearer.or_else(|| header_str(headers, ADMIN_KEY)).map(str::trim);
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(ProxyError::Unauthorized)
    }
}

async fn route(
    state: &ProxyState,
    method: &Method,
    path: &str,
    request: Request<Incoming>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let (parts, body) = read_body(request, state.max_body_bytes).await?;
    let headers = &parts.headers;
    if *method != Method::POST {
        return Err(ProxyError::InvalidRequest(format!("no admin route {method} {path}")));
    }
    match path {
        "/record/start" => start(state, Mode::Record, headers, &body).await,
        "/playback/start" => start(state, Mode::Playback, headers, &body).await,
        "/record/stop" => {
            let save = header_str(headers, RECORDING_SAVE)
                .map_or(true, |v| !v.trim().eq_ignore_ascii_case("false"));
            let StopRequest { variables } = parse_optional(&body)?;
            stop(state, headers, Mode::Record, StopOptions { save, variables }).await
        }
        "/playback/stop" => {
            let options = StopOptions { save: false, variables: BTreeMap::new() };
            stop(state, headers, Mode::Playback, options).await
        }
        "/admin/addsanitizer" => {
            let id = session_header(headers)?;
            state.registry.add_sanitizer(id, parse_required::<SanitizerSpec>(&body)?).await?;
            Ok(acknowledge(id))
        }
        "/admin/addtransform" => {
            let id = session_header(headers)?;
            state.registry.add_transform(id, parse_required::<TransformSpec>(&body)?).await?;
            Ok(acknowledge(id))
        }
        "/admin/setmatcher" => {
            let id = session_header(headers)?;
            state.registry.set_matcher(id, parse_optional::<MatcherConfig>(&body)?).await?;
            Ok(acknowledge(id))
        }
        _ => Err(ProxyError::InvalidRequest(format!("no admin route {method} {path}"))),
    }
}

async fn start(
    state: &ProxyState,
    mode: Mode,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response<ProxyBody>, ProxyError> {
    let request: StartRequest = parse_optional(body)?;
    let file = request
        .recording_file
        .or_else(|| header_str(headers, "x-recording-file").map(str::to_string))
        .filter(|file| !file.trim().is_empty())
        .ok_or_else(|| ProxyError::InvalidRequest("recordingFile is required".into()))?;
    let session_id = request
        .session_id
        .map(|raw| {
            raw.parse::<SessionId>().map_err(|err| {
                ProxyError::InvalidRequest(format!("sessionId {raw} is not a UUID: {err}"))
            })
        })
        .transpose()?;
    let base_dir = match request.assets_file {
        Some(assets) => Some(restore_assets(state, &assets).await?),
        None => None,
    };

    let started = state.registry.start(mode, &file, StartOptions { session_id, base_dir }).await?;
    let id = started.id.to_string();
    let mut reply = json!({
        "sessionId": id,
        "recordingFile": started.recording_path.display().to_string(),
    });
    if mode == Mode::Playback {
        reply["variables"] = serde_json::to_value(&started.variables).unwrap_or(Value::Null);
    }
    Ok(json_response(StatusCode::OK, &reply, Some(&id)))
}

/// Restores the recordings referenced by an `assets.json` and returns the
/// directory relative recording paths resolve against.
async fn restore_assets(state: &ProxyState, assets: &str) -> Result<PathBuf, ProxyError> {
    let sync = state
        .assets
        .clone()
        .ok_or_else(|| ProxyError::InvalidRequest("asset synchronization is not enabled".into()))?;
    let path = state.registry.storage_root().join(assets);
    let restored = tokio::task::spawn_blocking(move || {
        let located = LocatedManifest::discover(&path)?;
        sync.restore(&located)
    })
    .await
    .map_err(|err| ProxyError::Internal(format!("asset restore task failed: {err}")))??;
    Ok(restored)
}

async fn stop(
    state: &ProxyState,
    headers: &HeaderMap,
    mode: Mode,
    options: StopOptions,
) -> Result<Response<ProxyBody>, ProxyError> {
    let raw = session_header(headers)?;
    let stopped = state.registry.stop(raw, mode, options).await?;
    let id = stopped.id.to_string();
    let reply = json!({
        "sessionId": id,
        "recordingFile": stopped.recording_path.display().to_string(),
        "saved": stopped.saved,
    });
    Ok(json_response(StatusCode::OK, &reply, Some(&id)))
}

fn session_header(headers: &HeaderMap) -> Result<&str, ProxyError> {
    header_str(headers, RECORDING_ID)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ProxyError::InvalidRequest(format!("{RECORDING_ID} header is required")))
}

fn acknowledge(id: &str) -> Response<ProxyBody> {
    json_response(StatusCode::OK, &json!({ "sessionId": id.trim() }), Some(id.trim()))
}

fn parse_optional<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ProxyError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    parse_required(body)
}

fn parse_required<T: DeserializeOwned>(body: &Bytes) -> Result<T, ProxyError> {
    serde_json::from_slice(body)
        .map_err(|err| ProxyError::InvalidRequest(format!("invalid JSON body: {err}")))
}

