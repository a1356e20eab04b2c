//! Result payloads returned by capture and replay jobs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::record::HeaderMap;

/// What a finished capture did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureSummary {
    /// Records appended to the store.
    pub count: u64,

    /// Bytes written, encrypted size where applicable.
    pub bytes_written: u64,

    /// Events discarded by host/method/resource-type filters.
    pub dropped_by_filter: u64,

    /// Post-data follow-up calls that failed or timed out.
    pub post_data_misses: u64,

    /// Events lost to the bounded handoff queue overflowing.
    pub queue_drops: u64,

    /// Response events observed (only when configured).
    pub responses_seen: u64,

    /// Loading failures observed (only when configured).
    pub loading_failures: u64,

    pub elapsed_ms: u64,

    pub output_path: PathBuf,
}

/// What a replay request came back with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayResult {
    pub status_code: u16,

    pub response_headers: HeaderMap,

    /// Response body; carried as base64 in JSON.
    #[serde(rename = "body_b64", with = "crate::b64")]
    pub body: Vec<u8>,

    pub elapsed_ms: u64,

    /// HTTP attempts actually made.
    pub attempts: u32,

    pub final_url_after_redirects: String,

    pub selected_capture_request_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_result_body_is_base64_in_json() {
        let result = ReplayResult {
            status_code: 200,
            response_headers: HeaderMap::new(),
            body: b"hello".to_vec(),
            elapsed_ms: 12,
            attempts: 1,
            final_url_after_redirects: "https://a.example/x".into(),
            selected_capture_request_id: "1000.1".into(),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["body_b64"], "aGVsbG8=");

        let back: ReplayResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.body, b"hello");
    }
}
