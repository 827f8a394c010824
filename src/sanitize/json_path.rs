//! A small JSON path subset for locating body values to redact.
//!
//! Supported: `$`, `.name`, `..name`, `['name']`, `[n]`, `[*]` and `.*`.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Child(String),
    Descendant(String),
    Index(usize),
    Wildcard,
}

/// A parsed JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parses a path expression.
    ///
    /// # Errors
    ///
    /// Returns a description of the first syntax problem.
    pub fn parse(expression: &str) -> Result<Self, String> {
        let rest = expression
            .trim()
            .strip_prefix('$')
            .ok_or_else(|| "path must start with `$`".to_string())?;
        let chars: Vec<char> = rest.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '.' if chars.get(i + 1) == Some(&'.') => {
                    let (name, next) = read_name(&chars, i + 2)?;
                    segments.push(Segment::Descendant(name));
                    i = next;
                }
                '.' => {
                    if chars.get(i + 1) == Some(&'*') {
                        segments.push(Segment::Wildcard);
                        i += 2;
                    } else {
                        let (name, next) = read_name(&chars, i + 1)?;
                        segments.push(Segment::Child(name));
                        i = next;
                    }
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|offset| i + offset)
                        .ok_or_else(|| "unterminated `[`".to_string())?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    let inner = inner.trim();
                    let segment = if inner == "*" {
                        Segment::Wildcard
                    } else if let Some(quoted) = inner
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                    {
                        Segment::Child(quoted.to_string())
                    } else {
                        let index =
                            inner.parse().map_err(|_| format!("`[{inner}]` is not an index"))?;
                        Segment::Index(index)
                    };
                    segments.push(segment);
                    i = close + 1;
                }
                other => return Err(format!("unexpected `{other}`")),
            }
        }
        Ok(Self { segments })
    }

    /// Calls `update` on every value the path selects. Returns `true` if any
    /// call reported a change.
    pub fn update(&self, root: &mut Value, update: &mut dyn FnMut(&mut Value) -> bool) -> bool {
        visit(root, &self.segments, update)
    }
}

fn read_name(chars: &[char], start: usize) -> Result<(String, usize), String> {
    let end = chars[start..]
        .iter()
        .position(|c| *c == '.' || *c == '[')
        .map_or(chars.len(), |offset| start + offset);
    if end == start {
        return Err("empty member name".to_string());
    }
    Ok((chars[start..end].iter().collect(), end))
}

fn visit(
    value: &mut Value,
    segments: &[Segment],
    update: &mut dyn FnMut(&mut Value) -> bool,
) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return update(value);
    };
    match first {
        Segment::Child(name) => match value.as_object_mut().and_then(|map| map.get_mut(name)) {
            Some(child) => visit(child, rest, update),
            None => false,
        },
        Segment::Index(index) => {
            match value.as_array_mut().and_then(|items| items.get_mut(*index)) {
                Some(child) => visit(child, rest, update),
                None => false,
            }
        }
        Segment::Wildcard => {
            let mut changed = false;
            for child in children(value) {
                changed |= visit(child, rest, update);
            }
            changed
        }
        Segment::Descendant(name) => {
            let mut changed = false;
            if let Some(child) = value.as_object_mut().and_then(|map| map.get_mut(name)) {
                changed |= visit(child, rest, update);
            }
            for child in children(value) {
                changed |= visit(child, segments, update);
            }
            changed
        }
    }
}

fn children(value: &mut Value) -> Vec<&mut Value> {
    match value {
        Value::Object(map) => map.values_mut().collect(),
        Value::Array(items) => items.iter_mut().collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn redact(path: &str, mut value: Value) -> Value {
        let path = JsonPath::parse(path).unwrap();
        path.update(&mut value, &mut |v| {
            *v = json!("Sanitized");
            true
        });
        value
    }

    #[test]
    fn child_and_index_segments() {
        let out = redact("$.items[1].key", json!({"items": [{"key": "a"}, {"key": "b"}]}));
        assert_eq!(out, json!({"items": [{"key": "a"}, {"key": "Sanitized"}]}));
    }

    #[test]
    fn descendant_segment_finds_nested_keys() {
        let out = redact(
            "$..access_token",
            json!({"access_token": "x", "nested": [{"access_token": "y"}], "other": 1}),
        );
        assert_eq!(
            out,
            json!({
                "access_token": "Sanitized",
                "nested": [{"access_token": "Sanitized"}],
                "other": 1
            })
        );
    }

    #[test]
    fn wildcard_and_quoted_segments() {
        let out = redact("$['odd key'][*]", json!({"odd key": ["a", "b"]}));
        assert_eq!(out, json!({"odd key": ["Sanitized", "Sanitized"]}));
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(JsonPath::parse("items").is_err());
        assert!(JsonPath::parse("$.").is_err());
        assert!(JsonPath::parse("$[abc]").is_err());
        assert!(JsonPath::parse("$[0").is_err());
    }
}
