//! Errors surfaced to proxy clients, with their taxonomy and HTTP mapping.

use std::fmt;
use std::time::Duration;

use hyper::StatusCode;
use serde_json::{json, Value};

use crate::assets::AssetError;
use crate::matcher::NoMatch;
use crate::ports::upstream::UpstreamError;
use crate::recording::RecordingError;
use crate::sanitize::secrets::SecretFinding;
use crate::sanitize::SanitizerError;
use crate::session::SessionId;
use crate::transform::TransformError;

/// Broad class of a [`ProxyError`], reported to clients so harnesses can
/// decide whether to retry, fix their request, or give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The request does not line up with what was recorded or expected.
    Protocol,
    /// The session is not in a state that allows the operation.
    State,
    /// A dependency was slow or unavailable; retrying may succeed.
    Transient,
    /// The proxy or its data cannot serve the request.
    Fatal,
}

impl ErrorCategory {
    /// Lower-case name used on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Protocol => "protocol",
            Self::State => "state",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every failure the proxy reports over HTTP.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Playback found no unconsumed interaction for the request.
    #[error("{0}")]
    NoMatchFound(Box<NoMatch>),
    /// A recording could not be read or written.
    #[error(transparent)]
    Recording(#[from] RecordingError),
    /// The session no longer accepts configuration.
    #[error("session {session} is already {state}; configure it before sending traffic")]
    SessionImmutableState {
        /// Session id.
        session: SessionId,
        /// Current state.
        state: &'static str,
    },
    /// The operation is not valid for the session's mode.
    #[error("session {session} is a {mode} session; {operation} is not supported")]
    WrongMode {
        /// Session id.
        session: SessionId,
        /// Session mode.
        mode: &'static str,
        /// Rejected operation.
        operation: &'static str,
    },
    /// An explicit session id is active or was used before.
    #[error("session {0} already exists")]
    DuplicateSession(SessionId),
    /// Record stop found secrets after sanitization.
    #[error(
        "session {session} still contains {} secret(s) after sanitization; \
         add sanitizers or stop with x-recording-save: false",
        .findings.len()
    )]
    UnsanitizedSecret {
        /// Session id.
        session: SessionId,
        /// Where the secrets were found.
        findings: Vec<SecretFinding>,
    },
    /// `x-recording-id` does not name an active session.
    #[error("no active session {0}")]
    SessionNotFound(String),
    /// The upstream did not answer in time.
    #[error("upstream {uri} did not respond within {}s", .after.as_secs())]
    UpstreamTimeout {
        /// Target URI.
        uri: String,
        /// Configured bound.
        after: Duration,
    },
    /// The upstream could not be reached.
    #[error("upstream {uri} failed: {message}")]
    Upstream {
        /// Target URI.
        uri: String,
        /// Description of the failure.
        message: String,
    },
    /// The asset store failed.
    #[error(transparent)]
    Asset(#[from] AssetError),
    /// The request is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A sanitizer spec was rejected.
    #[error(transparent)]
    Sanitizer(#[from] SanitizerError),
    /// A transform spec was rejected.
    #[error(transparent)]
    Transform(#[from] TransformError),
    /// Missing or wrong admin key.
    #[error("missing or invalid admin key")]
    Unauthorized,
    /// The request body exceeds the configured limit.
    #[error("request body exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Configured limit.
        limit: usize,
    },
    /// Anything else the proxy cannot recover from.
    #[error("{0}")]
    Internal(String),
}

impl From<NoMatch> for ProxyError {
    fn from(miss: NoMatch) -> Self {
        Self::NoMatchFound(Box::new(miss))
    }
}

impl From<UpstreamError> for ProxyError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Timeout { uri, after } => Self::UpstreamTimeout { uri, after },
            UpstreamError::Failed { uri, message } => Self::Upstream { uri, message },
        }
    }
}

impl ProxyError {
    /// Taxonomy name reported as `error.kind`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoMatchFound(_) => "NoMatchFoundError",
            Self::Recording(RecordingError::Corrupt { .. }) => "CorruptRecordingError",
            Self::Recording(RecordingError::NotFound { .. }) => "RecordingNotFoundError",
            Self::Recording(RecordingError::Io { .. }) => "RecordingIoError",
            Self::SessionImmutableState { .. } => "SessionImmutableStateError",
            Self::WrongMode { .. } => "SessionModeError",
            Self::DuplicateSession(_) => "DuplicateSessionError",
            Self::UnsanitizedSecret { .. } => "UnsanitizedSecretError",
            Self::SessionNotFound(_) => "SessionNotFoundError",
            Self::UpstreamTimeout { .. } => "UpstreamTimeoutError",
            Self::Upstream { .. } => "UpstreamError",
            Self::Asset(AssetError::NotFound { .. }) => "AssetNotFoundError",
            Self::Asset(AssetError::Timeout { .. }) => "AssetSyncTimeoutError",
            Self::Asset(_) => "AssetSyncError",
            Self::InvalidRequest(_) => "InvalidRequestError",
            Self::Sanitizer(_) => "InvalidSanitizerError",
            Self::Transform(_) => "InvalidTransformError",
            Self::Unauthorized => "UnauthorizedError",
            Self::PayloadTooLarge { .. } => "PayloadTooLargeError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// Broad class of the error.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NoMatchFound(_)
            | Self::InvalidRequest(_)
            | Self::Sanitizer(_)
            | Self::Transform(_)
            | Self::Unauthorized
            | Self::PayloadTooLarge { .. }
            | Self::Asset(AssetError::NotFound { .. }) => ErrorCategory::Protocol,
            Self::SessionImmutableState { .. }
            | Self::WrongMode { .. }
            | Self::DuplicateSession(_)
            | Self::UnsanitizedSecret { .. }
            | Self::SessionNotFound(_) => ErrorCategory::State,
            Self::UpstreamTimeout { .. } | Self::Upstream { .. } => ErrorCategory::Transient,
            Self::Asset(err) if err.is_retryable() => ErrorCategory::Transient,
            Self::Recording(_) | Self::Asset(_) | Self::Internal(_) => ErrorCategory::Fatal,
        }
    }

    /// HTTP status the error is reported with.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoMatchFound(_) | Self::Recording(RecordingError::NotFound { .. }) => {
                StatusCode::NOT_FOUND
            }
            Self::Asset(AssetError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Recording(RecordingError::Corrupt { .. }) | Self::UnsanitizedSecret { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::SessionImmutableState { .. }
            | Self::DuplicateSession(_)
            | Self::WrongMode { .. } => StatusCode::CONFLICT,
            Self::SessionNotFound(_)
            | Self::InvalidRequest(_)
            | Self::Sanitizer(_)
            | Self::Transform(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamTimeout { .. } | Self::Asset(AssetError::Timeout { .. }) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Recording(RecordingError::Io { .. }) | Self::Asset(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether the same request may succeed if retried unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// JSON error body.
    #[must_use]
    pub fn to_body(&self) -> Value {
        let mut error = json!({
            "kind": self.kind(),
            "category": self.category().as_str(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
        });
        match self {
            Self::NoMatchFound(miss) => {
                error["candidates"] = serde_json::to_value(&miss.candidates).unwrap_or(Value::Null);
            }
            Self::UnsanitizedSecret { findings, .. } => {
                error["findings"] = serde_json::to_value(findings).unwrap_or(Value::Null);
            }
            _ => {}
        }
        json!({ "error": error })
    }
}
