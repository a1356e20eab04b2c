//! Header classification and display redaction.
//!
//! Pure and stateless. The capture pipeline uses [`classify`] to decide
//! default retention; the control plane uses [`redact_headers`] before
//! echoing captured values back to a client.

use cm_protocol::HeaderMap;

/// What a header name means for retention and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderClass {
    /// Carries session identity: cookies, bearer tokens, CSRF tokens.
    Auth,
    /// Not identity-bearing but worth keeping for faithful replay.
    Sensitive,
    /// Everything else.
    Safe,
}

/// Classifies a header by name, case-insensitively.
pub fn classify(name: &str) -> HeaderClass {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "cookie" | "authorization" | "proxy-authorization" | "x-csrf-token" | "set-cookie" => {
            HeaderClass::Auth
        }
        "referer" | "origin" | "user-agent" => HeaderClass::Sensitive,
        _ if lower.starts_with("x-auth-") => HeaderClass::Auth,
        _ => HeaderClass::Safe,
    }
}

/// Returns true if the header carries auth material.
pub fn is_auth(name: &str) -> bool {
    classify(name) == HeaderClass::Auth
}

/// Deterministic display redaction: an 8-hex-char hash prefix plus the value
/// length. Equal values redact identically, so redacted captures stay
/// diffable; the length marker hints at truncated or rotated tokens.
pub fn redact(name: &str, value: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.to_ascii_lowercase().as_bytes());
    hasher.update(&[0]);
    hasher.update(value.as_bytes());
    let hex = hasher.finalize().to_hex();
    format!("{}:{}", &hex.as_str()[..8], value.len())
}

/// Copies `headers` with every auth-classified value redacted.
pub fn redact_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .map(|(name, value)| {
            let value = if is_auth(name) {
                redact(name, value)
            } else {
                value.to_string()
            };
            (name.to_string(), value)
        })
        .collect()
}
