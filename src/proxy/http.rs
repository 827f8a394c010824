//! Conversions between hyper messages and recorded exchanges.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{HeaderMap, Request, Response, StatusCode};
use serde_json::Value;

use crate::error::ProxyError;
use crate::recording::{Headers, ResponseRecord};

/// Body type of every response the proxy produces.
pub type ProxyBody = Full<Bytes>;

/// Session id header.
pub const RECORDING_ID: &str = "x-recording-id";
/// Reverse-proxy target header.
pub const UPSTREAM_BASE_URI: &str = "x-recording-upstream-base-uri";
/// Partial-recording header: `request-body` or `request-response`.
pub const RECORDING_SKIP: &str = "x-recording-skip";
/// `false` discards a record session at stop.
pub const RECORDING_SAVE: &str = "x-recording-save";
/// Alternative to `Authorization: Bearer` for the admin key.
pub const ADMIN_KEY: &str = "x-admin-key";

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// What to leave out of a recorded exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Skip {
    /// Record everything.
    #[default]
    Nothing,
    /// Record the exchange without the request body.
    RequestBody,
    /// Forward without recording.
    RequestResponse,
}

impl Skip {
    /// Parses `x-recording-skip`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidRequest`] for unknown values.
    pub fn parse(value: Option<&str>) -> Result<Self, ProxyError> {
        match value.map(str::trim) {
            None | Some("") => Ok(Self::Nothing),
            Some(v) if v.eq_ignore_ascii_case("request-body") => Ok(Self::RequestBody),
            Some(v) if v.eq_ignore_ascii_case("request-response") => Ok(Self::RequestResponse),
            Some(other) => Err(ProxyError::InvalidRequest(format!(
                "{RECORDING_SKIP} must be request-body or request-response, got {other}"
            ))),
        }
    }
}

/// First value of a header as text, if it is valid visible ASCII.
#[must_use]
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Converts a hyper header map, lower-casing names and keeping repeated values.
#[must_use]
pub fn headers_from(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    headers
}

/// Drops headers that must never cross the proxy: hop-by-hop headers, any
/// header named in `Connection`, and the proxy's own `x-recording-*` controls.
pub fn strip_hop_by_hop(headers: &mut Headers) {
    let named: Vec<String> = headers
        .iter()
        .filter(|(key, _)| key.eq_ignore_ascii_case("connection"))
        .flat_map(|(_, values)| values.iter().flat_map(|v| v.split(',')))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    headers.retain(|key, _| {
        let key = key.to_ascii_lowercase();
        !HOP_BY_HOP.contains(&key.as_str())
            && !named.contains(&key)
            && !key.starts_with("x-recording-")
    });
}

/// Collects a request body, enforcing `limit`.
///
/// # Errors
///
/// Returns [`ProxyError::PayloadTooLarge`] past the limit, or
/// [`ProxyError::InvalidRequest`] if the body cannot be read.
pub async fn read_body(
    request: Request<Incoming>,
    limit: usize,
) -> Result<(http::request::Parts, Bytes), ProxyError> {
    let (parts, body) = request.into_parts();
    let collected = Limited::new(body, limit).collect().await.map_err(|err| {
        if err.downcast_ref::<LengthLimitError>().is_some() {
            ProxyError::PayloadTooLarge { limit }
        } else {
            ProxyError::InvalidRequest(format!("failed to read request body: {err}"))
        }
    })?;
    Ok((parts, collected.to_bytes()))
}

/// Builds a client response from a recorded or live one. `Content-Length` is
/// recomputed from the body.
#[must_use]
pub fn into_response(record: ResponseRecord) -> Response<ProxyBody> {
    let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Full::new(Bytes::from(record.body.unwrap_or_default())));
    *response.status_mut() = status;
    let map = response.headers_mut();
    for (name, values) in &record.headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else { continue };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                map.append(name.clone(), value);
            }
        }
    }
    response
}

/// A JSON response, optionally tagged with the session id.
#[must_use]
pub fn json_response(
    status: StatusCode,
    body: &Value,
    session: Option<&str>,
) -> Response<ProxyBody> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(id) = session.and_then(|id| HeaderValue::from_str(id).ok()) {
        response.headers_mut().insert(RECORDING_ID, id);
    }
    response
}

/// The JSON error body for `err` with its status.
#[must_use]
pub fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    json_response(err.status(), &err.to_body(), None)
}

/// An empty response.
#[must_use]
pub fn empty(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_connection_named_and_control_headers() {
        let mut headers = Headers::new();
        for (name, value) in [
            ("connection", "keep-alive, x-trace"),
            ("keep-alive", "timeout=5"),
            ("x-trace", "1"),
            ("x-recording-id", "abc"),
            ("Transfer-Encoding", "chunked"),
            ("accept", "application/json"),
        ] {
            headers.insert(name.into(), vec![value.into()]);
        }
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.keys().collect::<Vec<_>>(), vec!["accept"]);
    }

    #[test]
    fn skip_header_values() {
        assert_eq!(Skip::parse(None).unwrap(), Skip::Nothing);
        assert_eq!(Skip::parse(Some("Request-Body")).unwrap(), Skip::RequestBody);
        assert_eq!(Skip::parse(Some("request-response")).unwrap(), Skip::RequestResponse);
        assert!(Skip::parse(Some("everything")).is_err());
    }

    #[test]
    fn response_drops_stale_content_length() {
        let mut headers = Headers::new();
        headers.insert("Content-Length".into(), vec!["999".into()]);
        headers.insert("set-cookie".into(), vec!["a=1".into(), "b=2".into()]);
        let record = ResponseRecord { status: 201, headers, body: Some(b"hi".to_vec()) };
        let response = into_response(record);
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().get("content-length").is_none());
        assert_eq!(response.headers().get_all("set-cookie").iter().count(), 2);
    }
}
