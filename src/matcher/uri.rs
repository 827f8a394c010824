//! URI normalization used by the matcher.

use std::collections::BTreeMap;

use url::Url;

/// Path and decoded query of a request URI, with ignorable parameters removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUri {
    /// Percent-encoded path, always starting with `/`.
    pub path: String,
    /// Decoded query pairs in their original order.
    pub query: Vec<(String, String)>,
}

impl NormalizedUri {
    /// Normalizes `uri`, dropping any query parameter named in `ignored`
    /// (case-insensitive). Relative URIs are accepted.
    #[must_use]
    pub fn parse(uri: &str, ignored: &[String]) -> Self {
        let (path, query) = split(uri);
        let query = url::form_urlencoded::parse(query.as_bytes())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .filter(|(name, _)| !ignored.iter().any(|skip| skip.eq_ignore_ascii_case(name)))
            .collect();
        Self { path, query }
    }

    /// Query values grouped by parameter name, each group in original order.
    #[must_use]
    pub fn grouped_query(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, value) in &self.query {
            grouped.entry(name.as_str()).or_default().push(value.as_str());
        }
        grouped
    }

    /// The query with pairs sorted by name, then value.
    #[must_use]
    pub fn sorted_query(&self) -> Vec<(&str, &str)> {
        let mut pairs: Vec<(&str, &str)> =
            self.query.iter().map(|(n, v)| (n.as_str(), v.as_str())).collect();
        pairs.sort_unstable();
        pairs
    }
}

fn split(uri: &str) -> (String, String) {
    if let Ok(parsed) = Url::parse(uri) {
        return (parsed.path().to_string(), parsed.query().unwrap_or_default().to_string());
    }
    let without_fragment = uri.split('#').next().unwrap_or_default();
    let (path, query) = without_fragment.split_once('?').unwrap_or((without_fragment, ""));
    let path = if path.is_empty() { "/".to_string() } else { path.to_string() };
    (path, query.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_ignored_parameters_case_insensitively() {
        let ignored = vec!["Correlation-Id".to_string()];
        let uri = NormalizedUri::parse(
            "https://svc.test/items?api-version=2024-01-01&correlation-id=abc",
            &ignored,
        );
        assert_eq!(uri.path, "/items");
        assert_eq!(uri.query, vec![("api-version".into(), "2024-01-01".into())]);
    }

    #[test]
    fn decodes_query_values() {
        let uri = NormalizedUri::parse("https://svc.test/q?name=a%20b", &[]);
        assert_eq!(uri.query, vec![("name".into(), "a b".into())]);
    }

    #[test]
    fn accepts_relative_uris() {
        let uri = NormalizedUri::parse("/items/1?x=1#frag", &[]);
        assert_eq!(uri.path, "/items/1");
        assert_eq!(uri.query.len(), 1);
    }

    #[test]
    fn sorted_query_ignores_order() {
        let a = NormalizedUri::parse("/p?b=2&a=1", &[]);
        let b = NormalizedUri::parse("/p?a=1&b=2", &[]);
        assert_ne!(a.query, b.query);
        assert_eq!(a.sorted_query(), b.sorted_query());
    }
}
