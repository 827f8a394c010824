//! Secret redaction applied to recordings before they are written.
//!
//! Sanitizers run at flush time, in insertion order, over every interaction.
//! Each one must be idempotent: running it over already-sanitized content
//! changes nothing. Registration runs each regex rule twice over its own
//! replacement text and over that text joined to common neighbouring
//! characters, and rejects the rule if the second pass changes anything.
//! This catches the usual mistakes but is not a proof over every input.

pub mod json_path;
pub mod secrets;

use std::borrow::Cow;

use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::recording::body;
use crate::recording::interaction::{header_value, remove_header, set_header};
use crate::recording::{Headers, Interaction, Recording, RequestRecord, ResponseRecord};
use json_path::JsonPath;

/// Placeholder written in place of redacted content.
pub const SANITIZED: &str = "Sanitized";

fn default_replacement() -> String {
    SANITIZED.to_string()
}

/// Which half of an exchange a rule touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppliesTo {
    /// Request only.
    Request,
    /// Response only.
    Response,
    /// Both halves.
    #[default]
    Both,
}

impl AppliesTo {
    fn request(self) -> bool {
        matches!(self, Self::Request | Self::Both)
    }

    fn response(self) -> bool {
        matches!(self, Self::Response | Self::Both)
    }
}

/// Sanitizer kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SanitizerKind {
    /// Regex replacement inside textual bodies.
    RegexBodyReplace,
    /// Replace a header's value, entirely or where `pattern` matches.
    HeaderRedact,
    /// Replace a literal string everywhere: URI, header values, bodies.
    GeneralStringSanitize,
    /// Regex replacement everywhere.
    GeneralRegexReplace,
    /// Regex replacement in the request URI.
    UriRegexReplace,
    /// Replace JSON body values selected by a path in `key`.
    BodyKeyReplace,
    /// Drop the comma-separated headers listed in `key`.
    RemoveHeader,
}

/// Declarative sanitizer definition, as accepted by the admin API and config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizerSpec {
    /// Rule kind.
    pub kind: SanitizerKind,
    /// Regex, or the literal for [`SanitizerKind::GeneralStringSanitize`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Replacement text.
    #[serde(default = "default_replacement")]
    pub replacement: String,
    /// Header name(s) or JSON path, depending on the kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Capture group (name or index) to replace instead of the whole match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Which half of the exchange to touch.
    #[serde(default)]
    pub applies_to: AppliesTo,
    /// Only apply when the request URI matches this regex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl SanitizerSpec {
    /// A spec of `kind` with every optional field unset.
    #[must_use]
    pub fn new(kind: SanitizerKind) -> Self {
        Self {
            kind,
            pattern: None,
            replacement: default_replacement(),
            key: None,
            group: None,
            applies_to: AppliesTo::Both,
            condition: None,
        }
    }

    /// Builder-style setter for `pattern`.
    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Builder-style setter for `key`.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Builder-style setter for `replacement`.
    #[must_use]
    pub fn replacement(mut self, replacement: impl Into<String>) -> Self {
        self.replacement = replacement.into();
        self
    }
}

/// Sanitizers every session starts with.
#[must_use]
pub fn default_sanitizers() -> Vec<SanitizerSpec> {
    vec![
        SanitizerSpec::new(SanitizerKind::HeaderRedact).key("Authorization"),
        SanitizerSpec::new(SanitizerKind::BodyKeyReplace).key("$..access_token"),
        SanitizerSpec::new(SanitizerKind::BodyKeyReplace).key("$..refresh_token"),
        SanitizerSpec::new(SanitizerKind::BodyKeyReplace).key("$..client_secret"),
    ]
}

/// Errors raised when compiling a sanitizer.
#[derive(Debug, thiserror::Error)]
pub enum SanitizerError {
    /// A field the kind needs is missing.
    #[error("{kind:?} sanitizer requires `{field}`")]
    MissingField {
        /// Rule kind.
        kind: SanitizerKind,
        /// Missing field.
        field: &'static str,
    },
    /// A regex failed to compile.
    #[error("invalid regex `{pattern}`: {source}")]
    InvalidRegex {
        /// Offending expression.
        pattern: String,
        /// Compiler error.
        #[source]
        source: regex::Error,
    },
    /// The JSON path failed to parse.
    #[error("invalid JSON path `{path}`: {reason}")]
    InvalidJsonPath {
        /// Offending path.
        path: String,
        /// Parser message.
        reason: String,
    },
    /// The capture group does not exist.
    #[error("capture group `{group}` does not exist in `{pattern}`")]
    UnknownGroup {
        /// Requested group.
        group: String,
        /// Expression searched.
        pattern: String,
    },
    /// The replacement would be rewritten on a second pass.
    #[error(
        "replacement `{replacement}` is rewritten again by `{pattern}`; \
         the sanitizer would not be idempotent"
    )]
    NotIdempotent {
        /// Expression.
        pattern: String,
        /// Replacement text.
        replacement: String,
    },
}

pub(crate) fn compile_regex(pattern: &str) -> Result<Regex, SanitizerError> {
    Regex::new(pattern)
        .map_err(|source| SanitizerError::InvalidRegex { pattern: pattern.to_string(), source })
}

/// Characters commonly found next to a secret in URIs, headers and bodies.
const NEIGHBOURS: &[&str] =
    &["0", "1", "9", "a", "z", "A", "Z", "_", "-", ".", "/", "=", " ", "\""];

/// Inputs a second sanitizer pass must leave alone: the replacement on its
/// own, doubled, and wrapped in neighbouring characters.
fn idempotence_samples(replacement: &str) -> Vec<String> {
    let mut samples = vec![replacement.to_string(), format!("{replacement}{replacement}")];
    for neighbour in NEIGHBOURS {
        samples.push(format!("{neighbour}{replacement}"));
        samples.push(format!("{replacement}{neighbour}"));
        samples.push(format!("{neighbour}{replacement}{neighbour}"));
        samples.push(format!("{replacement}{neighbour}{replacement}"));
    }
    samples
}

#[derive(Debug, Clone)]
struct Replacer {
    regex: Regex,
    replacement: String,
    group: Option<String>,
}

impl Replacer {
    fn new(pattern: &str, replacement: &str, group: Option<&str>) -> Result<Self, SanitizerError> {
        let regex = compile_regex(pattern)?;
        if let Some(group) = group {
            let known = match group.parse::<usize>() {
                Ok(index) => index < regex.captures_len(),
                Err(_) => regex.capture_names().flatten().any(|name| name == group),
            };
            if !known {
                return Err(SanitizerError::UnknownGroup {
                    group: group.to_string(),
                    pattern: pattern.to_string(),
                });
            }
        }
        let replacer = Self {
            regex,
            replacement: replacement.to_string(),
            group: group.map(ToString::to_string),
        };
        let stable = replacer.apply(replacement) == replacement
            && idempotence_samples(replacement).iter().all(|sample| {
                let once = replacer.apply(sample);
                replacer.apply(&once) == once
            });
        if !stable {
            return Err(SanitizerError::NotIdempotent {
                pattern: pattern.to_string(),
                replacement: replacement.to_string(),
            });
        }
        Ok(replacer)
    }

    fn apply<'t>(&self, text: &'t str) -> Cow<'t, str> {
        let Some(group) = &self.group else {
            return self.regex.replace_all(text, NoExpand(&self.replacement));
        };
        let index = group.parse::<usize>().ok();
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        let mut replaced = false;
        for captures in self.regex.captures_iter(text) {
            let span = match index {
                Some(index) => captures.get(index),
                None => captures.name(group),
            };
            if let Some(span) = span {
                out.push_str(&text[last..span.start()]);
                out.push_str(&self.replacement);
                last = span.end();
                replaced = true;
            }
        }
        if !replaced {
            return Cow::Borrowed(text);
        }
        out.push_str(&text[last..]);
        Cow::Owned(out)
    }
}

#[derive(Debug, Clone)]
enum Rule {
    Body(Replacer),
    Header { name: String, replacer: Option<Replacer>, replacement: String },
    Everywhere(Replacer),
    Uri(Replacer),
    BodyKey { path: JsonPath, replacer: Option<Replacer>, replacement: String },
    RemoveHeaders(Vec<String>),
}

/// A compiled sanitizer.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    spec: SanitizerSpec,
    rule: Rule,
    condition: Option<Regex>,
}

impl Sanitizer {
    /// Validates and compiles a spec.
    ///
    /// # Errors
    ///
    /// Returns [`SanitizerError`] for missing fields, bad expressions, or
    /// rules that would not be idempotent.
    pub fn compile(spec: SanitizerSpec) -> Result<Self, SanitizerError> {
        let kind = spec.kind;
        let require = |value: &Option<String>, field: &'static str| {
            value.clone().ok_or(SanitizerError::MissingField { kind, field })
        };
        let replacer =
            |pattern: &str| Replacer::new(pattern, &spec.replacement, spec.group.as_deref());

        let rule = match kind {
            SanitizerKind::RegexBodyReplace => {
                Rule::Body(replacer(&require(&spec.pattern, "pattern")?)?)
            }
            SanitizerKind::GeneralRegexReplace => {
                Rule::Everywhere(replacer(&require(&spec.pattern, "pattern")?)?)
            }
            SanitizerKind::GeneralStringSanitize => {
                let literal = require(&spec.pattern, "pattern")?;
                Rule::Everywhere(Replacer::new(&regex::escape(&literal), &spec.replacement, None)?)
            }
            SanitizerKind::UriRegexReplace => {
                Rule::Uri(replacer(&require(&spec.pattern, "pattern")?)?)
            }
            SanitizerKind::HeaderRedact => Rule::Header {
                name: require(&spec.key, "key")?,
                replacer: spec.pattern.as_deref().map(replacer).transpose()?,
                replacement: spec.replacement.clone(),
            },
            SanitizerKind::BodyKeyReplace => {
                let path = require(&spec.key, "key")?;
                Rule::BodyKey {
                    path: JsonPath::parse(&path).map_err(|reason| {
                        SanitizerError::InvalidJsonPath { path: path.clone(), reason }
                    })?,
                    replacer: spec.pattern.as_deref().map(replacer).transpose()?,
                    replacement: spec.replacement.clone(),
                }
            }
            SanitizerKind::RemoveHeader => Rule::RemoveHeaders(
                require(&spec.key, "key")?
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            ),
        };
        let condition = spec.condition.as_deref().map(compile_regex).transpose()?;
        Ok(Self { spec, rule, condition })
    }

    /// The spec this sanitizer was compiled from.
    #[must_use]
    pub fn spec(&self) -> &SanitizerSpec {
        &self.spec
    }

    /// Applies the rule to one interaction in place.
    pub fn apply(&self, interaction: &mut Interaction) {
        if let Some(condition) = &self.condition {
            if !condition.is_match(&interaction.request.uri) {
                return;
            }
        }
        let scope = self.spec.applies_to;
        let request = &mut interaction.request;
        let response = &mut interaction.response;
        let mut halves: Vec<(&mut Headers, &mut Option<Vec<u8>>)> = Vec::with_capacity(2);
        if scope.request() {
            halves.push((&mut request.headers, &mut request.body));
        }
        if scope.response() {
            halves.push((&mut response.headers, &mut response.body));
        }

        match &self.rule {
            Rule::Uri(replacer) => {
                if scope.request() {
                    replace_string(&mut request.uri, replacer);
                }
            }
            Rule::Everywhere(replacer) => {
                if scope.request() {
                    replace_string(&mut request.uri, replacer);
                }
                for (headers, body) in halves {
                    for values in headers.values_mut() {
                        values.iter_mut().for_each(|value| replace_string(value, replacer));
                    }
                    rewrite_text_body(headers, body, |text| replacer.apply(text));
                }
            }
            Rule::Body(replacer) => {
                for (headers, body) in halves {
                    rewrite_text_body(headers, body, |text| replacer.apply(text));
                }
            }
            Rule::Header { name, replacer, replacement } => {
                for (headers, _) in halves {
                    let Some(values) = headers
                        .iter_mut()
                        .find(|(key, _)| key.eq_ignore_ascii_case(name))
                        .map(|(_, v)| v)
                    else {
                        continue;
                    };
                    for value in values.iter_mut() {
                        match replacer {
                            Some(replacer) => replace_string(value, replacer),
                            None => replacement.clone_into(value),
                        }
                    }
                }
            }
            Rule::BodyKey { path, replacer, replacement } => {
                for (headers, body) in halves {
                    rewrite_json_body(headers, body, path, replacer.as_ref(), replacement);
                }
            }
            Rule::RemoveHeaders(names) => {
                for (headers, _) in halves {
                    for name in names {
                        remove_header(headers, name);
                    }
                }
            }
        }
    }
}

/// Applies sanitizers in order to every interaction of a recording.
pub fn apply_all(sanitizers: &[Sanitizer], recording: &mut Recording) {
    for interaction in &mut recording.interactions {
        for sanitizer in sanitizers {
            sanitizer.apply(interaction);
        }
    }
}

/// Runs sanitizers over a live request so it compares equal to a recorded
/// request that went through the same sanitizers.
#[must_use]
pub fn sanitize_request(sanitizers: &[Sanitizer], request: &RequestRecord) -> RequestRecord {
    let mut interaction = Interaction {
        ordinal: 0,
        request: request.clone(),
        response: ResponseRecord { status: 0, headers: Headers::default(), body: None },
        duration: None,
    };
    for sanitizer in sanitizers {
        sanitizer.apply(&mut interaction);
    }
    interaction.request
}

fn replace_string(target: &mut String, replacer: &Replacer) {
    if let Cow::Owned(replaced) = replacer.apply(target.as_str()) {
        *target = replaced;
    }
}

/// Rewrites a body when it is text. Bodies without a content type count as
/// text when they are valid UTF-8.
fn rewrite_text_body<F>(headers: &mut Headers, body: &mut Option<Vec<u8>>, rewrite: F)
where
    F: for<'t> Fn(&'t str) -> Cow<'t, str>,
{
    let content_type = header_value(headers, "content-type");
    if content_type.is_some() && !body::is_textual(content_type) {
        return;
    }
    let Some(bytes) = body.as_mut() else {
        return;
    };
    let Ok(text) = std::str::from_utf8(bytes) else {
        return;
    };
    let replaced = match rewrite(text) {
        Cow::Owned(replaced) if replaced != text => replaced,
        _ => return,
    };
    *bytes = replaced.into_bytes();
    let length = bytes.len();
    update_content_length(headers, length);
}

fn rewrite_json_body(
    headers: &mut Headers,
    body: &mut Option<Vec<u8>>,
    path: &JsonPath,
    replacer: Option<&Replacer>,
    replacement: &str,
) {
    let Some(bytes) = body.as_mut() else {
        return;
    };
    let Ok(mut value) = serde_json::from_slice::<Value>(bytes) else {
        return;
    };
    let changed = path.update(&mut value, &mut |selected| match replacer {
        Some(replacer) => match selected {
            Value::String(text) => match replacer.apply(text) {
                Cow::Owned(replaced) if replaced != *text => {
                    *text = replaced;
                    true
                }
                _ => false,
            },
            _ => false,
        },
        None => {
            if selected.as_str() == Some(replacement) {
                false
            } else {
                *selected = Value::String(replacement.to_string());
                true
            }
        }
    });
    if !changed {
        return;
    }
    if let Ok(serialized) = serde_json::to_vec(&value) {
        *bytes = serialized;
        let length = bytes.len();
        update_content_length(headers, length);
    }
}

fn update_content_length(headers: &mut Headers, length: usize) {
    if header_value(headers, "content-length").is_some() {
        set_header(headers, "content-length", length.to_string());
    }
}
