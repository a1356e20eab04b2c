//! Error types for the CDP runtime.

use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur talking to a browser over CDP.
#[derive(Debug, Error)]
pub enum Error {
    /// Could not reach the browser's debug endpoint.
    #[error("failed to connect to browser: {0}")]
    ConnectFailed(String),

    /// The browser exposes no debuggable page target.
    #[error("no debuggable page target{}", if hint.is_empty() { String::new() } else { format!(" matching '{hint}'") })]
    NoDebuggableTarget { hint: String },

    /// A protocol call did not answer in time.
    #[error("CDP call '{method}' timed out after {ms}ms")]
    CallTimeout { method: String, ms: u64 },

    /// An inbound frame exceeded the transport cap; the transport is closed.
    #[error("inbound frame of {size} bytes exceeds the {limit} byte cap")]
    FrameOversize { size: usize, limit: usize },

    /// The browser answered a call with an error payload.
    #[error("CDP error {code}: {message}")]
    Cdp { code: i64, message: String },

    /// Malformed or unexpected protocol traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection went away under a pending call.
    #[error("connection closed unexpectedly")]
    ChannelClosed,

    /// The operation was cancelled from outside.
    #[error("operation cancelled")]
    Cancelled,

    /// WebSocket-level failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true if this is a call timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::CallTimeout { .. })
    }

    /// Returns true if the transport is gone and further calls are pointless.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::ChannelClosed | Error::ConnectFailed(_) | Error::FrameOversize { .. }
        )
    }
}
