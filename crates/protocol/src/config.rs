//! Capture and replay job descriptions.
//!
//! These are the JSON bodies accepted by the control plane and the structs
//! taken by the programmatic facade. Decoding is permissive: every field not
//! strictly required has a default so callers only spell out what they need.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::record::HeaderMap;

/// Where the store encryption key comes from, resolved at open time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// Store is plaintext.
    #[default]
    None,
    /// Key material inline, base64url.
    Inline(String),
    /// Name of an environment variable holding the base64url key.
    Env(String),
    /// Path to a key file holding the base64url key.
    File(PathBuf),
}

impl KeySource {
    pub fn is_none(&self) -> bool {
        matches!(self, KeySource::None)
    }
}

/// One capture job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Browser debug host.
    #[serde(default = "default_browser_host")]
    pub browser_host: String,

    /// Browser debug port.
    #[serde(default = "default_browser_port")]
    pub browser_port: u16,

    /// Substring matched (case-insensitively) against target url/title when
    /// picking a debug target. Empty picks the first page.
    #[serde(default)]
    pub target_hint: String,

    /// Stop after this many seconds. `None` runs until `max_records` or
    /// cancellation.
    #[serde(default)]
    pub duration_seconds: Option<u64>,

    /// Stop after this many records. `None` is unbounded.
    #[serde(default)]
    pub max_records: Option<u64>,

    /// Retain every request header instead of only auth/sensitive ones.
    #[serde(default)]
    pub include_all_headers: bool,

    /// Fetch request bodies with a follow-up protocol call.
    #[serde(default)]
    pub capture_post_data: bool,

    /// Also observe response/loading-failure events (counted, not stored).
    #[serde(default)]
    pub capture_responses: bool,

    /// Keep only requests whose URL host contains one of these entries.
    #[serde(default)]
    pub host_filter: Vec<String>,

    /// Keep only these methods (uppercase). Empty keeps all.
    #[serde(default)]
    pub method_filter: Vec<String>,

    /// Keep only these browser resource types. Empty keeps all.
    #[serde(default)]
    pub resource_type_filter: Vec<String>,

    /// Capture store to append to.
    pub output_file: PathBuf,

    /// Encryption key for the store, if any.
    #[serde(default)]
    pub encryption_key_source: KeySource,
}

fn default_browser_host() -> String {
    "127.0.0.1".to_string()
}

fn default_browser_port() -> u16 {
    9222
}

/// Constraints used to pick one capture out of a store.
///
/// Filters apply in record order; with `index` unset the last match wins
/// (the most recent observation is the most likely to still carry valid
/// auth).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Selector {
    /// Substring match on the capture URL.
    #[serde(default)]
    pub url_contains: Option<String>,

    /// Exact method match.
    #[serde(default)]
    pub method: Option<String>,

    /// Exact resource-type match.
    #[serde(default)]
    pub resource_type: Option<String>,

    /// Pick the Nth match (0-based) instead of the last.
    #[serde(default)]
    pub index: Option<usize>,
}

/// Body to send on replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodySource {
    /// No body.
    #[default]
    None,
    /// Use the selected capture's `post_data`.
    Captured,
    /// Inline text.
    Inline(String),
    /// Contents of a file.
    File(PathBuf),
    /// Structured JSON, serialized canonically; sets
    /// `Content-Type: application/json` unless one is already present.
    Json(serde_json::Value),
}

/// Retry behavior for replay attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, at least 1.
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Base backoff; attempt n sleeps `backoff_seconds * 2^(n-1)`.
    #[serde(default)]
    pub backoff_seconds: f64,

    /// Apply full jitter to each backoff.
    #[serde(default)]
    pub jitter: bool,
}

fn default_attempts() -> u32 {
    1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff_seconds: 0.0,
            jitter: false,
        }
    }
}

/// One replay request description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Capture store to select from.
    pub capture_file: PathBuf,

    /// How to pick the capture.
    #[serde(default)]
    pub selector: Selector,

    /// Outbound URL to issue; may differ from the capture URL.
    pub request_url: String,

    /// Outbound method; defaults to the selected capture's method.
    #[serde(default)]
    pub method: Option<String>,

    /// Outbound body.
    #[serde(default)]
    pub body: BodySource,

    /// Merged over the capture's headers; wins on conflict.
    #[serde(default)]
    pub extra_headers: HeaderMap,

    /// Require the outbound host to equal the capture's host.
    #[serde(default)]
    pub enforce_capture_host: bool,

    /// Named adapter to rewrite headers before guards run.
    #[serde(default)]
    pub adapter: Option<String>,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-attempt deadline in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,

    /// Maximum redirects to follow.
    #[serde(default = "default_redirect_limit")]
    pub redirect_limit: u32,

    /// Key for reading an encrypted store.
    #[serde(default)]
    pub encryption_key_source: KeySource,
}

fn default_timeout_seconds() -> f64 {
    30.0
}

fn default_redirect_limit() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_config_minimal_json() {
        let config: CaptureConfig =
            serde_json::from_str(r#"{"output_file": "cap.jsonl"}"#).unwrap();
        assert_eq!(config.browser_host, "127.0.0.1");
        assert_eq!(config.browser_port, 9222);
        assert!(!config.include_all_headers);
        assert!(config.encryption_key_source.is_none());
    }

    #[test]
    fn replay_config_minimal_json() {
        let config: ReplayConfig = serde_json::from_str(
            r#"{"capture_file": "cap.jsonl", "request_url": "https://a.example/x"}"#,
        )
        .unwrap();
        assert_eq!(config.retry.attempts, 1);
        assert_eq!(config.timeout_seconds, 30.0);
        assert_eq!(config.redirect_limit, 10);
        assert_eq!(config.body, BodySource::None);
    }

    #[test]
    fn key_source_tags() {
        let inline: KeySource = serde_json::from_str(r#"{"inline": "AAAA"}"#).unwrap();
        assert_eq!(inline, KeySource::Inline("AAAA".into()));

        let env: KeySource = serde_json::from_str(r#"{"env": "CM_KEY"}"#).unwrap();
        assert_eq!(env, KeySource::Env("CM_KEY".into()));

        let none: KeySource = serde_json::from_str(r#""none""#).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn body_source_tags() {
        let captured: BodySource = serde_json::from_str(r#""captured""#).unwrap();
        assert_eq!(captured, BodySource::Captured);

        let json: BodySource = serde_json::from_str(r#"{"json": {"a": 1}}"#).unwrap();
        assert!(matches!(json, BodySource::Json(_)));
    }
}
