//! Playback-time response rewriting.
//!
//! Transforms run after a match, on a copy of the recorded response. The
//! stored interaction is never touched.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::recording::interaction::{remove_header, set_header};
use crate::recording::{RequestRecord, ResponseRecord};

/// Transform kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformKind {
    /// Set response header `key` to `value`.
    HeaderSet,
    /// Copy request header `key` onto the response when the live request has it.
    EchoRequestHeader,
    /// Remove response header `key`.
    HeaderRemove,
}

/// Conditions a transform can be gated on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformCondition {
    /// Apply only when the recorded response carries this header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_header: Option<String>,
    /// Apply only when the live request URI matches this regex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri_regex: Option<String>,
}

/// Declarative transform definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformSpec {
    /// Transform kind.
    pub kind: TransformKind,
    /// Header name.
    pub key: String,
    /// Header value, for [`TransformKind::HeaderSet`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Optional gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<TransformCondition>,
}

/// Transforms every playback session starts with: zero out `Retry-After` so
/// replays never sleep, and echo the caller's client request id.
#[must_use]
pub fn default_transforms() -> Vec<TransformSpec> {
    vec![
        TransformSpec {
            kind: TransformKind::HeaderSet,
            key: "Retry-After".into(),
            value: Some("0".into()),
            condition: Some(TransformCondition {
                response_header: Some("Retry-After".into()),
                uri_regex: None,
            }),
        },
        TransformSpec {
            kind: TransformKind::EchoRequestHeader,
            key: "x-ms-client-request-id".into(),
            value: None,
            condition: None,
        },
    ]
}

/// Errors raised when compiling a transform.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// `HeaderSet` without a value.
    #[error("HeaderSet transform for `{key}` requires `value`")]
    MissingValue {
        /// Header name.
        key: String,
    },
    /// Bad condition regex.
    #[error("invalid uriRegex `{pattern}`: {source}")]
    InvalidRegex {
        /// Offending expression.
        pattern: String,
        /// Compiler error.
        #[source]
        source: regex::Error,
    },
}

/// A compiled transform.
#[derive(Debug, Clone)]
pub struct Transform {
    spec: TransformSpec,
    uri_regex: Option<Regex>,
}

impl Transform {
    /// Validates and compiles a spec.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError`] for a missing value or a bad regex.
    pub fn compile(spec: TransformSpec) -> Result<Self, TransformError> {
        if spec.kind == TransformKind::HeaderSet && spec.value.is_none() {
            return Err(TransformError::MissingValue { key: spec.key });
        }
        let uri_regex = spec
            .condition
            .as_ref()
            .and_then(|condition| condition.uri_regex.as_deref())
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| TransformError::InvalidRegex {
                    pattern: pattern.to_string(),
                    source,
                })
            })
            .transpose()?;
        Ok(Self { spec, uri_regex })
    }

    /// The spec this transform was compiled from.
    #[must_use]
    pub fn spec(&self) -> &TransformSpec {
        &self.spec
    }

    /// Rewrites `response` (a copy) for the given live request.
    pub fn apply(&self, live: &RequestRecord, response: &mut ResponseRecord) {
        if let Some(regex) = &self.uri_regex {
            if !regex.is_match(&live.uri) {
                return;
            }
        }
        let required_header =
            self.spec.condition.as_ref().and_then(|condition| condition.response_header.as_deref());
        if let Some(header) = required_header {
            if response.header(header).is_none() {
                return;
            }
        }

        match self.spec.kind {
            TransformKind::HeaderSet => {
                if let Some(value) = &self.spec.value {
                    set_header(&mut response.headers, &self.spec.key, value.clone());
                }
            }
            TransformKind::EchoRequestHeader => {
                if let Some(value) = live.header(&self.spec.key) {
                    set_header(&mut response.headers, &self.spec.key, value);
                }
            }
            TransformKind::HeaderRemove => {
                remove_header(&mut response.headers, &self.spec.key);
            }
        }
    }
}

/// Applies transforms in order and returns the rewritten copy.
#[must_use]
pub fn apply_all(
    transforms: &[Transform],
    live: &RequestRecord,
    recorded: &ResponseRecord,
) -> ResponseRecord {
    let mut response = recorded.clone();
    for transform in transforms {
        transform.apply(live, &mut response);
    }
    response
}
