//! Playback request matching.
//!
//! A live request matches a recorded interaction when the method, the URI
//! path and the URI query (minus ignorable parameters) agree, and, unless the
//! session is body-insensitive, the canonical body digests agree too. Header
//! comparison is opt-in. Every recorded interaction can be consumed once.
//!
//! On a miss the unconsumed interactions are ranked by how many components
//! differ. That ranking is diagnostic output only and never picks a match.

pub mod uri;

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::recording::body;
use crate::recording::{Headers, Interaction, RequestRecord};
use uri::NormalizedUri;

/// Per-session matching options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MatcherConfig {
    /// Compare canonical body digests. `false` makes the session body-insensitive.
    pub compare_bodies: bool,
    /// Treat `?a=1&b=2` and `?b=2&a=1` as equal.
    pub ignore_query_ordering: bool,
    /// Query parameters removed before comparison.
    pub ignored_query_parameters: Vec<String>,
    /// Compare request headers as well.
    pub compare_headers: bool,
    /// Headers never compared.
    pub excluded_headers: Vec<String>,
    /// Headers whose presence is compared but whose value is not.
    pub ignored_headers: Vec<String>,
    /// How many near misses to report on a failed match.
    pub max_candidates: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            compare_bodies: true,
            ignore_query_ordering: false,
            ignored_query_parameters: Vec::new(),
            compare_headers: false,
            excluded_headers: ["request-id", "traceparent", "tracestate", "connection", "host"]
                .map(String::from)
                .to_vec(),
            ignored_headers: [
                "date",
                "x-ms-date",
                "x-ms-client-request-id",
                "user-agent",
                "content-length",
                "authorization",
                "accept-encoding",
            ]
            .map(String::from)
            .to_vec(),
            max_candidates: 3,
        }
    }
}

/// One way a recorded interaction differs from the live request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Difference {
    /// HTTP methods differ.
    Method { recorded: String, live: String },
    /// URI paths differ.
    Path { recorded: String, live: String },
    /// A query parameter has different values, or is missing on one side.
    Query { name: String, recorded: Vec<String>, live: Vec<String> },
    /// Same parameters, different order.
    QueryOrder,
    /// Body digests differ.
    Body { recorded_len: usize, live_len: usize },
    /// A header differs or is missing on one side.
    Header { name: String, recorded: Option<String>, live: Option<String> },
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Method { recorded, live } => {
                write!(f, "method: recorded {recorded}, live {live}")
            }
            Self::Path { recorded, live } => write!(f, "path: recorded {recorded}, live {live}"),
            Self::Query { name, recorded, live } => {
                write!(f, "query {name}: recorded {recorded:?}, live {live:?}")
            }
            Self::QueryOrder => write!(f, "query parameters are in a different order"),
            Self::Body { recorded_len, live_len } => {
                write!(
                    f,
                    "body: recorded {recorded_len} bytes, live {live_len} bytes, contents differ"
                )
            }
            Self::Header { name, recorded, live } => write!(
                f,
                "header {name}: recorded {}, live {}",
                recorded.as_deref().unwrap_or("<absent>"),
                live.as_deref().unwrap_or("<absent>")
            ),
        }
    }
}

/// A near miss reported with [`NoMatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// Ordinal of the recorded interaction.
    pub ordinal: u64,
    /// Recorded method.
    pub method: String,
    /// Recorded URI.
    pub uri: String,
    /// Number of differing components; lower is closer.
    pub distance: usize,
    /// Human-readable differences.
    pub differences: Vec<String>,
}

/// Diagnostic payload of a failed match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoMatch {
    /// Live request method.
    pub method: String,
    /// Live request URI.
    pub uri: String,
    /// Closest unconsumed interactions, nearest first.
    pub candidates: Vec<Candidate>,
}

impl fmt::Display for NoMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no recorded interaction matches {} {}", self.method, self.uri)?;
        if let Some(best) = self.candidates.first() {
            write!(f, "; closest is #{} {} {}", best.ordinal, best.method, best.uri)?;
            if !best.differences.is_empty() {
                write!(f, " ({})", best.differences.join("; "))?;
            }
        }
        Ok(())
    }
}

/// A request prepared once for comparison against many interactions.
struct Prepared<'a> {
    request: &'a RequestRecord,
    uri: NormalizedUri,
    digest: Option<[u8; 32]>,
}

impl MatcherConfig {
    /// Finds the lowest-ordinal unconsumed interaction that matches `request`.
    ///
    /// `consumed[i]` marks `interactions[i]` as already used; `start` is a hint
    /// that every index below it is consumed.
    ///
    /// # Errors
    ///
    /// Returns [`NoMatch`] with ranked candidates when nothing matches.
    pub fn find_match(
        &self,
        request: &RequestRecord,
        interactions: &[Interaction],
        consumed: &[bool],
        start: usize,
    ) -> Result<usize, NoMatch> {
        let live = self.prepare(request);
        let mut near_misses = Vec::new();

        for (index, interaction) in interactions.iter().enumerate().skip(start) {
            if consumed.get(index).copied().unwrap_or(false) {
                continue;
            }
            let differences = self.compare(&live, interaction);
            if differences.is_empty() {
                return Ok(index);
            }
            near_misses.push((interaction, differences));
        }

        near_misses
            .sort_by_key(|(interaction, differences)| (differences.len(), interaction.ordinal));
        let candidates = near_misses
            .into_iter()
            .take(self.max_candidates)
            .map(|(interaction, differences)| Candidate {
                ordinal: interaction.ordinal,
                method: interaction.request.method.clone(),
                uri: interaction.request.uri.clone(),
                distance: differences.len(),
                differences: differences.iter().map(ToString::to_string).collect(),
            })
            .collect();

        Err(NoMatch { method: request.method.clone(), uri: request.uri.clone(), candidates })
    }

    fn prepare<'a>(&self, request: &'a RequestRecord) -> Prepared<'a> {
        Prepared {
            request,
            uri: NormalizedUri::parse(&request.uri, &self.ignored_query_parameters),
            digest: self
                .compare_bodies
                .then(|| body_digest(request.body.as_deref(), request.content_type()))
                .flatten(),
        }
    }

    /// Lists every difference between the live request and a recorded one.
    fn compare(&self, live: &Prepared<'_>, recorded: &Interaction) -> Vec<Difference> {
        let mut differences = Vec::new();
        let recorded_request = &recorded.request;

        if !recorded_request.method.eq_ignore_ascii_case(&live.request.method) {
            differences.push(Difference::Method {
                recorded: recorded_request.method.clone(),
                live: live.request.method.clone(),
            });
        }

        let recorded_uri =
            NormalizedUri::parse(&recorded_request.uri, &self.ignored_query_parameters);
        if recorded_uri.path != live.uri.path {
            differences.push(Difference::Path {
                recorded: recorded_uri.path.clone(),
                live: live.uri.path.clone(),
            });
        }
        self.compare_query(&recorded_uri, &live.uri, &mut differences);

        if self.compare_bodies {
            let recorded_digest =
                body_digest(recorded_request.body.as_deref(), recorded_request.content_type());
            if recorded_digest != live.digest {
                differences.push(Difference::Body {
                    recorded_len: recorded_request.body.as_ref().map_or(0, Vec::len),
                    live_len: live.request.body.as_ref().map_or(0, Vec::len),
                });
            }
        }

        if self.compare_headers {
            self.compare_header_sets(
                &recorded_request.headers,
                &live.request.headers,
                &mut differences,
            );
        }
        differences
    }

    fn compare_query(
        &self,
        recorded: &NormalizedUri,
        live: &NormalizedUri,
        out: &mut Vec<Difference>,
    ) {
        if recorded.query == live.query {
            return;
        }
        let recorded_groups = recorded.grouped_query();
        let live_groups = live.grouped_query();
        let names: BTreeSet<&str> =
            recorded_groups.keys().chain(live_groups.keys()).copied().collect();
        let mut any_value_differs = false;
        for name in names {
            let mut recorded_values = recorded_groups.get(name).cloned().unwrap_or_default();
            let mut live_values = live_groups.get(name).cloned().unwrap_or_default();
            if self.ignore_query_ordering {
                recorded_values.sort_unstable();
                live_values.sort_unstable();
            }
            if recorded_values != live_values {
                any_value_differs = true;
                out.push(Difference::Query {
                    name: name.to_string(),
                    recorded: recorded_values.iter().map(ToString::to_string).collect(),
                    live: live_values.iter().map(ToString::to_string).collect(),
                });
            }
        }
        if !any_value_differs && !self.ignore_query_ordering {
            out.push(Difference::QueryOrder);
        }
    }

    fn compare_header_sets(&self, recorded: &Headers, live: &Headers, out: &mut Vec<Difference>) {
        let excluded =
            |name: &str| self.excluded_headers.iter().any(|h| h.eq_ignore_ascii_case(name));
        let ignored =
            |name: &str| self.ignored_headers.iter().any(|h| h.eq_ignore_ascii_case(name));
        let joined = |headers: &Headers, name: &str| {
            headers
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, values)| values.join(", "))
        };

        let names: BTreeSet<String> =
            recorded.keys().chain(live.keys()).map(|name| name.to_ascii_lowercase()).collect();
        for name in names.iter().filter(|name| !excluded(name)) {
            let recorded_value = joined(recorded, name);
            let live_value = joined(live, name);
            let differs = if ignored(name) {
                recorded_value.is_some() != live_value.is_some()
            } else {
                recorded_value != live_value
            };
            if differs {
                out.push(Difference::Header {
                    name: name.clone(),
                    recorded: recorded_value,
                    live: live_value,
                });
            }
        }
    }
}

/// SHA-256 of a body's canonical form. JSON bodies are canonicalized with
/// sorted object keys so formatting and key order do not matter. Absent and
/// empty bodies both digest to `None`.
#[must_use]
pub fn body_digest(body: Option<&[u8]>, content_type: Option<&str>) -> Option<[u8; 32]> {
    let bytes = body.filter(|bytes| !bytes.is_empty())?;
    let canonical = if body::is_json(content_type) {
        serde_json::from_slice::<Value>(bytes)
            .ok()
            .and_then(|value| serde_json::to_vec(&canonical_json(value)).ok())
    } else {
        None
    };
    let digest = Sha256::digest(canonical.as_deref().unwrap_or(bytes));
    Some(digest.into())
}

fn canonical_json(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(entries.into_iter().map(|(k, v)| (k, canonical_json(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical_json).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::ResponseRecord;

    fn request(method: &str, uri: &str, body: Option<&str>) -> RequestRecord {
        let mut headers = Headers::new();
        headers.insert("content-type".into(), vec!["application/json".into()]);
        RequestRecord {
            method: method.into(),
            uri: uri.into(),
            headers,
            body: body.map(|b| b.as_bytes().to_vec()),
        }
    }

    fn recorded(ordinal: u64, method: &str, uri: &str, body: Option<&str>) -> Interaction {
        Interaction {
            ordinal,
            request: request(method, uri, body),
            response: ResponseRecord { status: 200, headers: Headers::new(), body: None },
            duration: None,
        }
    }

    #[test]
    fn exact_match_returns_lowest_unconsumed_ordinal() {
        let interactions = vec![
            recorded(0, "GET", "https://svc.test/items/1", None),
            recorded(1, "GET", "https://svc.test/items/1", None),
        ];
        let config = MatcherConfig::default();
        let live = request("GET", "https://svc.test/items/1", None);

        assert_eq!(config.find_match(&live, &interactions, &[false, false], 0), Ok(0));
        assert_eq!(config.find_match(&live, &interactions, &[true, false], 0), Ok(1));
        let miss = config.find_match(&live, &interactions, &[true, true], 0).unwrap_err();
        assert!(miss.candidates.is_empty());
    }

    #[test]
    fn ignored_query_parameters_do_not_block_a_match() {
        let interactions =
            vec![recorded(0, "GET", "https://svc.test/items?api-version=1&cid=aaa", None)];
        let config = MatcherConfig {
            ignored_query_parameters: vec!["cid".into()],
            ..MatcherConfig::default()
        };
        let live = request("GET", "https://svc.test/items?api-version=1&cid=bbb", None);
        assert_eq!(config.find_match(&live, &interactions, &[false], 0), Ok(0));

        let drifted = request("GET", "https://svc.test/items?api-version=2&cid=bbb", None);
        let miss = config.find_match(&drifted, &interactions, &[false], 0).unwrap_err();
        assert_eq!(miss.candidates[0].distance, 1);
        assert!(miss.candidates[0].differences[0].contains("api-version"));
    }

    #[test]
    fn query_order_is_significant_unless_configured() {
        let interactions = vec![recorded(0, "GET", "https://svc.test/p?a=1&b=2", None)];
        let live = request("GET", "https://svc.test/p?b=2&a=1", None);

        let strict = MatcherConfig::default();
        let miss = strict.find_match(&live, &interactions, &[false], 0).unwrap_err();
        assert!(miss.candidates[0].differences[0].contains("order"));

        let relaxed = MatcherConfig { ignore_query_ordering: true, ..MatcherConfig::default() };
        assert_eq!(relaxed.find_match(&live, &interactions, &[false], 0), Ok(0));
    }

    #[test]
    fn json_bodies_compare_canonically() {
        let interactions =
            vec![recorded(0, "PUT", "https://svc.test/x", Some(r#"{"a":1,"b":[1,2]}"#))];
        let config = MatcherConfig::default();
        let live = request("PUT", "https://svc.test/x", Some("{ \"b\": [1, 2], \"a\": 1 }"));
        assert_eq!(config.find_match(&live, &interactions, &[false], 0), Ok(0));

        let changed = request("PUT", "https://svc.test/x", Some(r#"{"a":2,"b":[1,2]}"#));
        assert!(config.find_match(&changed, &interactions, &[false], 0).is_err());

        let insensitive = MatcherConfig { compare_bodies: false, ..MatcherConfig::default() };
        assert_eq!(insensitive.find_match(&changed, &interactions, &[false], 0), Ok(0));
    }

    #[test]
    fn empty_and_absent_bodies_are_equivalent() {
        assert_eq!(body_digest(None, None), None);
        assert_eq!(body_digest(Some(b""), None), None);
        assert!(body_digest(Some(b"x"), None).is_some());
    }

    #[test]
    fn candidates_are_ranked_by_distance_then_ordinal() {
        let interactions = vec![
            recorded(0, "POST", "https://svc.test/other", None),
            recorded(1, "GET", "https://svc.test/items/2", None),
            recorded(2, "GET", "https://svc.test/items/3", None),
            recorded(3, "DELETE", "https://svc.test/items/9", None),
        ];
        let config = MatcherConfig { max_candidates: 2, ..MatcherConfig::default() };
        let live = request("GET", "https://svc.test/items/1", None);
        let miss = config.find_match(&live, &interactions, &[false; 4], 0).unwrap_err();

        let ordinals: Vec<u64> = miss.candidates.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![1, 2]);
        assert!(miss.to_string().contains("closest is #1"));
    }

    #[test]
    fn header_comparison_honours_ignored_and_excluded_sets() {
        let mut recorded_entry = recorded(0, "GET", "https://svc.test/h", None);
        recorded_entry.request.headers.insert("x-ms-date".into(), vec!["yesterday".into()]);
        recorded_entry.request.headers.insert("traceparent".into(), vec!["00-aaa".into()]);
        recorded_entry.request.headers.insert("x-tenant".into(), vec!["one".into()]);

        let mut live = request("GET", "https://svc.test/h", None);
        live.headers.insert("x-ms-date".into(), vec!["today".into()]);
        live.headers.insert("x-tenant".into(), vec!["one".into()]);

        let config = MatcherConfig { compare_headers: true, ..MatcherConfig::default() };
        let interactions = vec![recorded_entry];
        assert_eq!(config.find_match(&live, &interactions, &[false], 0), Ok(0));

        live.headers.insert("x-tenant".into(), vec!["two".into()]);
        let miss = config.find_match(&live, &interactions, &[false], 0).unwrap_err();
        assert!(miss.candidates[0].differences[0].contains("x-tenant"));
    }
}
