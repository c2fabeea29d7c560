//! HTTP request model.
//!
//! A [`Request`] is an immutable record produced by the parser and handed to
//! handlers. Header names are case-insensitive and multi-valued; both headers
//! and query parameters preserve duplicates in arrival order.

use std::fmt;

/// Ordered, case-insensitive, multi-valued header collection.
///
/// Each distinct name keeps the casing it first arrived with (used when a
/// header is echoed back) and an ordered list of values. Lookup is by
/// lowercased name.
#[derive(Debug, Default)]
pub struct Headers {
    entries: Vec<HeaderEntry>,
}

#[derive(Debug)]
struct HeaderEntry {
    /// Original casing of the first occurrence.
    display_name: String,
    /// Lowercased lookup key.
    key: String,
    values: Vec<String>,
}

impl Headers {
    /// Create an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value, folding into the existing entry for the same
    /// case-insensitive name if one exists.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let display_name = name.into();
        let key = display_name.to_ascii_lowercase();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.values.push(value);
        } else {
            self.entries.push(HeaderEntry {
                display_name,
                key,
                values: vec![value],
            });
        }
    }

    /// First value for a name (case-insensitive), if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        let key = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|e| e.key == key)
            .and_then(|e| e.values.first())
            .map(String::as_str)
    }

    /// All values for a name (case-insensitive), in arrival order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> &[String] {
        let key = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map_or(&[], |e| e.values.as_slice())
    }

    /// Whether any value exists for a name (case-insensitive).
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        self.entries.iter().any(|e| e.key == key)
    }

    /// Number of distinct header names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no headers are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(display_name, values)` in first-arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|e| (e.display_name.as_str(), e.values.as_slice()))
    }
}

/// Ordered query-string multimap with duplicates preserved.
///
/// Keys and values are percent-decoded. `+` is left as-is, matching the
/// path decoding rule.
#[derive(Debug, Default)]
pub struct QueryMap {
    pairs: Vec<(String, String)>,
}

impl QueryMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, key: String, value: String) {
        self.pairs.push((key, value));
    }

    /// First value for a key, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for a key, in arrival order.
    #[must_use]
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Number of key/value pairs (duplicates counted).
    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Returns true if the query string was absent or empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Iterate `(key, value)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// One parsed HTTP request.
///
/// The method is uppercased; the path is percent-decoded with the query
/// split off. Lenient parsing admits methods outside the usual set, so the
/// method is a plain string rather than a closed enum.
#[derive(Debug)]
pub struct Request {
    method: String,
    path: String,
    raw_query: Option<String>,
    query: QueryMap,
    version: String,
    headers: Headers,
    body: Vec<u8>,
}

impl Request {
    pub(crate) fn new(
        method: String,
        path: String,
        raw_query: Option<String>,
        query: QueryMap,
        version: String,
        headers: Headers,
        body: Vec<u8>,
    ) -> Self {
        Self {
            method,
            path,
            raw_query,
            query,
            version,
            headers,
            body,
        }
    }

    /// Uppercased request method, e.g. `GET`.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Percent-decoded path without the query string.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string (after `?`, undecoded), if present.
    #[must_use]
    pub fn raw_query(&self) -> Option<&str> {
        self.raw_query.as_deref()
    }

    /// Parsed query parameters.
    #[must_use]
    pub fn query(&self) -> &QueryMap {
        &self.query
    }

    /// Version token from the request line, e.g. `HTTP/1.1`.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Request headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Request body; empty when no `Content-Length` was supplied.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns true for `HEAD` requests (response bodies are suppressed).
    #[must_use]
    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    /// Returns true when the version token is `HTTP/1.1` or later.
    ///
    /// Compares the `major.minor` suffix numerically; unparsable versions
    /// are treated as too old.
    #[must_use]
    pub fn is_at_least_http11(&self) -> bool {
        let Some(rest) = self.version.strip_prefix("HTTP/") else {
            return false;
        };
        let mut parts = rest.splitn(2, '.');
        let major: u32 = match parts.next().and_then(|s| s.parse().ok()) {
            Some(v) => v,
            None => return false,
        };
        let minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        (major, minor) >= (1, 1)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.method, self.path, self.version)
    }
}
