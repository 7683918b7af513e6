//! Target resolution for the outbound dial boundary.
//!
//! Turns a URL template plus typed parameter bindings into a concrete
//! `ws://` / `wss://` URL, canonicalizes header bindings, and derives the
//! cache key for the resulting session.

use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

/// Characters left untouched in a substituted path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("required path parameter [{0}] is not bound")]
    MissingPathParameter(String),

    #[error("invalid target url [{url}]: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unsupported scheme [{0}], expected ws or wss")]
    UnsupportedScheme(String),
}

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Text(String),
    Number(f64),
    Integer(i64),
    Boolean(bool),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Text(s) => f.write_str(s),
            ParamValue::Number(n) => write!(f, "{n}"),
            ParamValue::Integer(i) => write!(f, "{i}"),
            ParamValue::Boolean(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_owned())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Text(s)
    }
}

impl From<i64> for ParamValue {
    fn from(i: i64) -> Self {
        ParamValue::Integer(i)
    }
}

impl From<f64> for ParamValue {
    fn from(n: f64) -> Self {
        ParamValue::Number(n)
    }
}

impl From<bool> for ParamValue {
    fn from(b: bool) -> Self {
        ParamValue::Boolean(b)
    }
}

/// A named binding with one or more values.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub values: Vec<ParamValue>,
    pub repeating: bool,
}

impl Parameter {
    pub fn single(name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
            repeating: false,
        }
    }

    pub fn repeating(name: impl Into<String>, values: Vec<ParamValue>) -> Self {
        Self {
            name: name.into(),
            values,
            repeating: true,
        }
    }

    /// Rendered values with comma-separated text expanded into items.
    ///
    /// Non-repeating parameters keep only their first item.
    pub fn rendered(&self) -> Vec<String> {
        let items = self.values.iter().flat_map(|value| match value {
            ParamValue::Text(s) => split_items(s),
            other => vec![other.to_string()],
        });
        if self.repeating {
            items.collect()
        } else {
            items.take(1).collect()
        }
    }
}

fn split_items(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Substitute `{name}` placeholders, append the query and validate the scheme.
///
/// Every placeholder must be bound. Query pairs are appended sorted by name.
pub fn resolve_target(
    template: &str,
    path: &[Parameter],
    query: &[Parameter],
) -> Result<Url, TargetError> {
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(len) = rest[open..].find('}') else {
            break;
        };
        let name = &rest[open + 1..open + len];
        let value = path
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.values.first())
            .ok_or_else(|| TargetError::MissingPathParameter(name.to_owned()))?;
        resolved.push_str(&rest[..open]);
        resolved.extend(utf8_percent_encode(&value.to_string(), PATH_SEGMENT));
        rest = &rest[open + len + 1..];
    }
    resolved.push_str(rest);

    let mut url = Url::parse(&resolved).map_err(|e| TargetError::InvalidUrl {
        url: resolved.clone(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(TargetError::UnsupportedScheme(url.scheme().to_owned()));
    }

    let mut sorted: Vec<&Parameter> = query.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let pairs: Vec<(&str, String)> = sorted
        .iter()
        .flat_map(|p| p.rendered().into_iter().map(move |v| (p.name.as_str(), v)))
        .collect();
    if !pairs.is_empty() {
        let mut serializer = url.query_pairs_mut();
        for (name, value) in pairs {
            serializer.append_pair(name, &value);
        }
    }
    Ok(url)
}

/// Header bindings keyed case-insensitively.
///
/// The first spelling seen for a name is kept for the wire; equality and
/// hashing use only the lower-cased name and the values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct HeaderSet(BTreeMap<String, HeaderValues>);

#[derive(Debug, Clone, Default)]
struct HeaderValues {
    name: String,
    values: Vec<String>,
}

impl PartialEq for HeaderValues {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Eq for HeaderValues {}

impl std::hash::Hash for HeaderValues {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.values.hash(state);
    }
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header binding, splitting comma-separated values and dropping
    /// blanks.
    pub fn insert(&mut self, name: &str, value: &str) {
        let items = split_items(value);
        if items.is_empty() {
            return;
        }
        self.entry(name).extend(items);
    }

    /// Add one header value verbatim, as received on the wire.
    pub fn append(&mut self, name: &str, value: &str) {
        self.entry(name).push(value.to_owned());
    }

    fn entry(&mut self, name: &str) -> &mut Vec<String> {
        let name = name.trim();
        &mut self
            .0
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| HeaderValues {
                name: name.to_owned(),
                values: Vec::new(),
            })
            .values
    }

    pub fn from_parameters(params: &[Parameter]) -> Self {
        let mut headers = Self::new();
        for param in params {
            for value in &param.values {
                headers.insert(&param.name, &value.to_string());
            }
        }
        headers
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0
            .get(&name.trim().to_ascii_lowercase())
            .map(|entry| entry.values.as_slice())
    }

    /// Names as first spelled, with their values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0
            .values()
            .map(|entry| (entry.name.as_str(), entry.values.as_slice()))
    }

    fn canonical(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0
            .iter()
            .map(|(key, entry)| (key.as_str(), entry.values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for HeaderSet {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// Cache key for an outbound session: handler, resolved URL and headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionFingerprint {
    handler: String,
    url: String,
    headers: HeaderSet,
}

impl SessionFingerprint {
    pub fn new(handler: impl Into<String>, url: &Url, headers: &HeaderSet) -> Self {
        Self {
            handler: handler.into(),
            url: url.to_string(),
            headers: headers.clone(),
        }
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl fmt::Display for SessionFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.handler, self.url)?;
        for (name, values) in self.headers.canonical() {
            write!(f, "|{}={}", name, values.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_and_encodes_path_parameters() {
        let url = resolve_target(
            "ws://localhost:9000/rooms/{room}/users/{id}",
            &[
                Parameter::single("room", "lobby one"),
                Parameter::single("id", 42i64),
            ],
            &[],
        )
        .unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9000/rooms/lobby%20one/users/42");
    }

    #[test]
    fn unbound_placeholder_fails() {
        let err = resolve_target("ws://h/{room}", &[], &[]).unwrap_err();
        assert_eq!(err, TargetError::MissingPathParameter("room".into()));
    }

    #[test]
    fn query_is_sorted_and_split() {
        let url = resolve_target(
            "wss://h/feed",
            &[],
            &[
                Parameter::single("zeta", true),
                Parameter::repeating("alpha", vec!["a, b,,c".into()]),
            ],
        )
        .unwrap();
        assert_eq!(url.query(), Some("alpha=a&alpha=b&alpha=c&zeta=true"));
    }

    #[test]
    fn non_websocket_scheme_rejected() {
        let err = resolve_target("http://h/feed", &[], &[]).unwrap_err();
        assert_eq!(err, TargetError::UnsupportedScheme("http".into()));
    }

    #[test]
    fn headers_are_canonical() {
        let a: HeaderSet = [("X-Tags", "one, two"), ("Authorization", "token")]
            .into_iter()
            .collect();
        let b: HeaderSet = [("authorization", "token"), ("x-tags", "one,,two")]
            .into_iter()
            .collect();
        assert_eq!(a, b);
        assert_eq!(a.get("X-TAGS").unwrap(), ["one", "two"]);

        let names: Vec<&str> = a.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Authorization", "X-Tags"]);
        assert_eq!(
            SessionFingerprint::new("h", &Url::parse("ws://h/").unwrap(), &a).to_string(),
            "h|ws://h/|authorization=token|x-tags=one,two"
        );
    }

    #[test]
    fn appended_values_are_not_split() {
        let mut headers = HeaderSet::new();
        headers.append("Date", "Tue, 15 Nov 1994 08:12:31 GMT");
        headers.append("date", "Wed, 16 Nov 1994 08:12:31 GMT");
        assert_eq!(
            headers.get("DATE").unwrap(),
            ["Tue, 15 Nov 1994 08:12:31 GMT", "Wed, 16 Nov 1994 08:12:31 GMT"]
        );
        assert_eq!(headers.iter().next().map(|(name, _)| name), Some("Date"));
    }

    #[test]
    fn fingerprints_distinguish_headers() {
        let url = Url::parse("ws://h/feed").unwrap();
        let plain = HeaderSet::new();
        let authed: HeaderSet = [("authorization", "t")].into_iter().collect();

        let a = SessionFingerprint::new("handler", &url, &plain);
        let b = SessionFingerprint::new("handler", &url, &plain);
        let c = SessionFingerprint::new("handler", &url, &authed);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
