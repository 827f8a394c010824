//! Serialized document layout of a recording file.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::body;
use super::interaction::{
    header_value, Headers, Interaction, Recording, RequestRecord, ResponseRecord,
};

/// Top-level document written to disk.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct RecordingDocument {
    #[serde(default)]
    pub entries: Vec<EntryDocument>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

/// One serialized interaction. Also used as a journal line.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct EntryDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<u64>,
    pub request_uri: String,
    pub request_method: String,
    #[serde(default)]
    pub request_headers: BTreeMap<String, HeaderValues>,
    #[serde(default, deserialize_with = "present")]
    pub request_body: Option<Value>,
    pub status_code: u16,
    #[serde(default)]
    pub response_headers: BTreeMap<String, HeaderValues>,
    #[serde(default, deserialize_with = "present")]
    pub response_body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Header values: a bare string for a single value, an array otherwise.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

/// Distinguishes an absent key (`None`) from an explicit `null` (`Some(Null)`).
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn headers_to_document(headers: &Headers) -> BTreeMap<String, HeaderValues> {
    headers
        .iter()
        .map(|(name, values)| {
            let values = match values.as_slice() {
                [single] => HeaderValues::One(single.clone()),
                many => HeaderValues::Many(many.to_vec()),
            };
            (name.clone(), values)
        })
        .collect()
}

fn headers_from_document(headers: BTreeMap<String, HeaderValues>) -> Headers {
    headers
        .into_iter()
        .map(|(name, values)| {
            let values = match values {
                HeaderValues::One(single) => vec![single],
                HeaderValues::Many(many) => many,
            };
            (name, values)
        })
        .collect()
}

impl EntryDocument {
    pub(crate) fn from_interaction(interaction: &Interaction) -> Self {
        let request = &interaction.request;
        let response = &interaction.response;
        Self {
            ordinal: Some(interaction.ordinal),
            request_uri: request.uri.clone(),
            request_method: request.method.clone(),
            request_headers: headers_to_document(&request.headers),
            request_body: Some(body::encode(request.body.as_deref(), request.content_type())),
            status_code: response.status,
            response_headers: headers_to_document(&response.headers),
            response_body: Some(body::encode(response.body.as_deref(), response.content_type())),
            duration_ms: interaction
                .duration
                .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Converts back to an interaction carrying `ordinal`.
    pub(crate) fn into_interaction(self, ordinal: u64) -> Result<Interaction, String> {
        let request_headers = headers_from_document(self.request_headers);
        let response_headers = headers_from_document(self.response_headers);
        let request_body = self
            .request_body
            .ok_or_else(|| format!("entry {ordinal} has no RequestBody"))?;
        let response_body = self
            .response_body
            .ok_or_else(|| format!("entry {ordinal} has no ResponseBody"))?;

        let request_body =
            body::decode(&request_body, header_value(&request_headers, "content-type"))
                .map_err(|reason| format!("entry {ordinal} request: {reason}"))?;
        let response_body =
            body::decode(&response_body, header_value(&response_headers, "content-type"))
                .map_err(|reason| format!("entry {ordinal} response: {reason}"))?;

        Ok(Interaction {
            ordinal,
            request: RequestRecord {
                method: self.request_method,
                uri: self.request_uri,
                headers: request_headers,
                body: request_body,
            },
            response: ResponseRecord {
                status: self.status_code,
                headers: response_headers,
                body: response_body,
            },
            duration: self.duration_ms.map(Duration::from_millis),
        })
    }
}

impl RecordingDocument {
    pub(crate) fn from_recording(recording: &Recording) -> Self {
        Self {
            entries: recording.interactions.iter().map(EntryDocument::from_interaction).collect(),
            variables: recording.variables.clone(),
        }
    }

    /// Validates ordinals and decodes every entry.
    ///
    /// Files written without any `Ordinal` keys are numbered by position;
    /// otherwise every entry must carry its position as its ordinal.
    pub(crate) fn into_recording(self, session_file_id: String) -> Result<Recording, String> {
        let positional = self.entries.iter().all(|entry| entry.ordinal.is_none());
        let mut interactions = Vec::with_capacity(self.entries.len());
        for (position, entry) in self.entries.into_iter().enumerate() {
            let expected = position as u64;
            let ordinal = match entry.ordinal {
                Some(ordinal) if ordinal == expected => ordinal,
                Some(ordinal) => {
                    return Err(format!(
                        "ordinals must be contiguous from 0: expected {expected}, found {ordinal}"
                    ));
                }
                None if positional => expected,
                None => return Err(format!("entry at position {position} has no Ordinal")),
            };
            interactions.push(entry.into_interaction(ordinal)?);
        }
        Ok(Recording { session_file_id, interactions, variables: self.variables })
    }
}
