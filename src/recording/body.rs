//! Body encoding for the on-disk recording format.
//!
//! Bodies are stored so that a human can read them in review while still
//! decoding to the exact bytes that went over the wire:
//!
//! | body                                   | stored as                 |
//! |----------------------------------------|---------------------------|
//! | absent                                 | `null`                    |
//! | empty                                  | `[]`                      |
//! | compact JSON object, JSON content type | the object itself         |
//! | UTF-8 text, textual content type       | a string                  |
//! | non-UTF-8, textual content type        | `["b64:<base64>"]`        |
//! | anything else                          | a base64 string           |

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

const BASE64_LINE_PREFIX: &str = "b64:";

/// Whether a content type is rendered as text in recordings.
#[must_use]
pub fn is_textual(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };
    let essence = content_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    essence.starts_with("text/")
        || essence.ends_with("json")
        || essence.ends_with("xml")
        || essence.ends_with("javascript")
        || essence == "application/x-www-form-urlencoded"
}

/// Whether a content type carries JSON.
#[must_use]
pub fn is_json(content_type: Option<&str>) -> bool {
    content_type.is_some_and(|ct| {
        let essence = ct.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        essence == "application/json" || essence.ends_with("+json") || essence == "text/json"
    })
}

/// Encodes a body for storage.
#[must_use]
pub fn encode(body: Option<&[u8]>, content_type: Option<&str>) -> Value {
    let Some(bytes) = body else {
        return Value::Null;
    };
    if bytes.is_empty() {
        return Value::Array(Vec::new());
    }
    if !is_textual(content_type) {
        return Value::String(STANDARD.encode(bytes));
    }
    let Ok(text) = std::str::from_utf8(bytes) else {
        return Value::Array(vec![Value::String(format!(
            "{BASE64_LINE_PREFIX}{}",
            STANDARD.encode(bytes)
        ))]);
    };
    if is_json(content_type) {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
            // Inline only when decoding reproduces the original bytes exactly.
            if serde_json::to_vec(&value).is_ok_and(|compact| compact == bytes) {
                return value;
            }
        }
    }
    Value::String(text.to_owned())
}

/// Decodes a stored body.
///
/// # Errors
///
/// Returns a human-readable reason when the stored value cannot represent a body.
pub fn decode(value: &Value, content_type: Option<&str>) -> Result<Option<Vec<u8>>, String> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) if is_textual(content_type) => Ok(Some(text.clone().into_bytes())),
        Value::String(encoded) => STANDARD
            .decode(encoded)
            .map(Some)
            .map_err(|err| format!("body is not valid base64: {err}")),
        Value::Array(lines) => {
            let mut bytes = Vec::new();
            for line in lines {
                let Value::String(line) = line else {
                    return Err("body array must only contain strings".to_string());
                };
                if let Some(encoded) = line.strip_prefix(BASE64_LINE_PREFIX) {
                    let decoded = STANDARD
                        .decode(encoded)
                        .map_err(|err| format!("body line is not valid base64: {err}"))?;
                    bytes.extend_from_slice(&decoded);
                } else {
                    bytes.extend_from_slice(line.as_bytes());
                }
            }
            Ok(Some(bytes))
        }
        other => serde_json::to_vec(other)
            .map(Some)
            .map_err(|err| format!("inline body could not be re-encoded: {err}")),
    }
}
