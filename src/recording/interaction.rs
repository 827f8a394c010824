//! In-memory model of recorded HTTP exchanges.

use std::collections::BTreeMap;
use std::time::Duration;

/// Header multimap. Keys keep the case they were captured with; lookups are
/// case-insensitive.
pub type Headers = BTreeMap<String, Vec<String>>;

/// Returns the first value of `name`, compared case-insensitively.
#[must_use]
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

/// Replaces every value of `name` with `value`, keeping the existing key spelling.
pub fn set_header(headers: &mut Headers, name: &str, value: impl Into<String>) {
    let key = headers
        .keys()
        .find(|key| key.eq_ignore_ascii_case(name))
        .cloned()
        .unwrap_or_else(|| name.to_ascii_lowercase());
    headers.insert(key, vec![value.into()]);
}

/// Removes `name` regardless of case. Returns `true` if anything was removed.
pub fn remove_header(headers: &mut Headers, name: &str) -> bool {
    let before = headers.len();
    headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
    headers.len() != before
}

/// The request half of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestRecord {
    /// HTTP method, upper-case.
    pub method: String,
    /// Absolute request URI.
    pub uri: String,
    /// Request headers.
    pub headers: Headers,
    /// Request body; `None` when the request carried no body at all.
    pub body: Option<Vec<u8>>,
}

impl RequestRecord {
    /// Returns the first value of a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Returns the `Content-Type` header, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// The response half of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// Response body; `None` when the response carried no body at all.
    pub body: Option<Vec<u8>>,
}

impl ResponseRecord {
    /// Returns the first value of a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    /// Returns the `Content-Type` header, if any.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// A request/response pair that has not yet been given an ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    /// The request as sent upstream.
    pub request: RequestRecord,
    /// The response as received from upstream.
    pub response: ResponseRecord,
    /// Wall time between sending the request and receiving the full response.
    pub duration: Option<Duration>,
}

/// One recorded exchange with its position in the recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interaction {
    /// Zero-based assignment order. Immutable once written.
    pub ordinal: u64,
    /// The recorded request.
    pub request: RequestRecord,
    /// The recorded response.
    pub response: ResponseRecord,
    /// Optional upstream latency.
    pub duration: Option<Duration>,
}

impl Interaction {
    /// Attaches an ordinal to an exchange.
    #[must_use]
    pub fn from_exchange(ordinal: u64, exchange: Exchange) -> Self {
        Self {
            ordinal,
            request: exchange.request,
            response: exchange.response,
            duration: exchange.duration,
        }
    }
}

/// A complete recording: every interaction of one session plus harness variables.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Recording {
    /// Identifier derived from the recording file name.
    pub session_file_id: String,
    /// Interactions ordered by ordinal.
    pub interactions: Vec<Interaction>,
    /// Free-form values saved by the harness at record stop.
    pub variables: BTreeMap<String, String>,
}

impl Recording {
    /// Creates an empty recording.
    #[must_use]
    pub fn new(session_file_id: impl Into<String>) -> Self {
        Self { session_file_id: session_file_id.into(), ..Self::default() }
    }

    /// Looks up an interaction by ordinal.
    #[must_use]
    pub fn find_by_ordinal(&self, ordinal: u64) -> Option<&Interaction> {
        let index = usize::try_from(ordinal).ok()?;
        self.interactions.get(index).filter(|interaction| interaction.ordinal == ordinal)
    }

    /// Number of interactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether the recording holds no interactions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let mut headers = Headers::new();
        headers.insert("Content-Type".into(), vec!["application/json".into()]);
        assert_eq!(header_value(&headers, "content-type"), Some("application/json"));
        assert_eq!(header_value(&headers, "accept"), None);
    }

    #[test]
    fn set_header_keeps_existing_spelling() {
        let mut headers = Headers::new();
        headers.insert("Retry-After".into(), vec!["30".into()]);
        set_header(&mut headers, "retry-after", "0");
        assert_eq!(headers.get("Retry-After"), Some(&vec!["0".to_string()]));
        assert_eq!(headers.len(), 1);

        set_header(&mut headers, "X-New", "1");
        assert_eq!(headers.get("x-new"), Some(&vec!["1".to_string()]));
    }

    #[test]
    fn remove_header_reports_removal() {
        let mut headers = Headers::new();
        headers.insert("Authorization".into(), vec!["Bearer x".into()]);
        assert!(remove_header(&mut headers, "authorization"));
        assert!(!remove_header(&mut headers, "authorization"));
    }

    #[test]
    fn find_by_ordinal_returns_matching_entry() {
        let mut recording = Recording::new("sample");
        for ordinal in 0..3 {
            recording.interactions.push(Interaction {
                ordinal,
                request: RequestRecord { method: "GET".into(), ..RequestRecord::default() },
                response: ResponseRecord { status: 200, headers: Headers::new(), body: None },
                duration: None,
            });
        }
        assert_eq!(recording.find_by_ordinal(2).map(|i| i.ordinal), Some(2));
        assert!(recording.find_by_ordinal(3).is_none());
    }
}
