//! The capture-file line format.
//!
//! Each plaintext line of a capture file is one JSON-encoded
//! [`CaptureRecord`]. Records are immutable once written; unknown top-level
//! keys survive a load/store round trip via the flattened `extra` map.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// HTTP verbs accepted by the capture pipeline. Anything else is dropped at
/// the pipeline edge.
pub const STANDARD_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "DELETE", "CONNECT", "OPTIONS", "TRACE", "PATCH",
];

/// Returns true if `method` is a standard HTTP verb (uppercase comparison).
pub fn is_standard_method(method: &str) -> bool {
    STANDARD_METHODS.contains(&method)
}

/// A header mapping with case-preserved names and case-insensitive lookup.
///
/// Serializes as a plain JSON object. Iteration order is the names' sort
/// order, which keeps serialized records diffable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMap(pub BTreeMap<String, String>);

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Inserts `value` under `name`, replacing any entry whose name matches
    /// case-insensitively. The new spelling of the name wins.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.0.insert(name, value.into());
    }

    /// Removes all entries whose name matches case-insensitively.
    pub fn remove(&mut self, name: &str) {
        self.0.retain(|k, _| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for HeaderMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut map = HeaderMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// One observed browser request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Opaque id, unique within a browser session.
    pub request_id: String,

    /// Uppercase HTTP verb.
    pub method: String,

    /// Absolute request URL as seen by the browser.
    pub url: String,

    /// Registrable hostname derived from `url`.
    pub host: String,

    /// Browser-reported classification (`Document`, `XHR`, `Fetch`, ...).
    pub resource_type: String,

    /// Request headers; never null.
    #[serde(default)]
    pub headers: HeaderMap,

    /// Request body, present only when post-data collection was configured
    /// and the follow-up fetch succeeded.
    #[serde(default)]
    pub post_data: Option<String>,

    /// Wall-clock capture time, RFC3339.
    pub captured_at: DateTime<Utc>,

    /// Hostname of the initiating document, when the browser reported one.
    #[serde(default)]
    pub initiator_host: Option<String>,

    /// Unknown top-level keys, preserved for round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert("Cookie", "s=1");
        assert_eq!(headers.get("cookie"), Some("s=1"));
        assert_eq!(headers.get("COOKIE"), Some("s=1"));
        assert!(headers.contains("CoOkIe"));
        assert_eq!(headers.get("Authorization"), None);
    }

    #[test]
    fn header_insert_replaces_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "text/plain");
        headers.insert("Content-Type", "application/json");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("content-type"), Some("application/json"));
    }

    #[test]
    fn record_round_trips_unknown_keys() {
        let json = r#"{
            "request_id": "1000.1",
            "method": "GET",
            "url": "https://a.example/x",
            "host": "a.example",
            "resource_type": "XHR",
            "headers": {"Cookie": "s=1"},
            "post_data": null,
            "captured_at": "2026-08-01T10:00:00Z",
            "initiator_host": null,
            "trace_id": "abc123"
        }"#;

        let record: CaptureRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.extra["trace_id"], "abc123");

        let out = serde_json::to_value(&record).unwrap();
        assert_eq!(out["trace_id"], "abc123");
        assert_eq!(out["post_data"], serde_json::Value::Null);
    }

    #[test]
    fn missing_optional_keys_default() {
        let json = r#"{
            "request_id": "1",
            "method": "GET",
            "url": "https://a.example/",
            "host": "a.example",
            "resource_type": "Document",
            "captured_at": "2026-08-01T10:00:00Z"
        }"#;

        let record: CaptureRecord = serde_json::from_str(json).unwrap();
        assert!(record.headers.is_empty());
        assert!(record.post_data.is_none());
        assert!(record.initiator_host.is_none());
    }

    #[test]
    fn standard_method_check() {
        assert!(is_standard_method("GET"));
        assert!(is_standard_method("PATCH"));
        assert!(!is_standard_method("get"));
        assert!(!is_standard_method("SPECULATE"));
    }
}
