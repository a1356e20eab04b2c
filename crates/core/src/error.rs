//! Error types for the capture/replay engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur capturing or replaying.
#[derive(Debug, Error)]
pub enum Error {
    /// A config value failed validation before any work started.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// CDP-layer failure (discovery, connect, call, transport).
    #[error(transparent)]
    Runtime(#[from] cm_runtime::Error),

    /// The store holds `ENC:` lines but no key was supplied.
    #[error("capture store contains encrypted lines; an encryption key is required")]
    EncryptedStoreRequiresKey,

    /// An encrypted line failed authentication under the supplied key.
    #[error("capture line failed authentication")]
    CaptureAuthFailure,

    /// A record serialized beyond the per-record cap.
    #[error("record of {size} bytes exceeds the {limit} byte cap")]
    RecordTooLarge { size: usize, limit: usize },

    /// The selector matched nothing in the store.
    #[error("no capture matches the selector")]
    NoMatchingCapture,

    /// The outbound host differs from the selected capture's host.
    #[error("replay host '{actual}' does not match capture host '{expected}'")]
    CaptureHostMismatch { expected: String, actual: String },

    /// The outbound host is outside the domain allowlist.
    #[error("host '{0}' is not in the domain allowlist")]
    DomainNotAllowed(String),

    /// A deny rule matched the outbound request.
    #[error("replay denied by policy rule {rule_index}")]
    PolicyDenied { rule_index: usize },

    /// The response body exceeded the cap.
    #[error("response of at least {size} bytes exceeds the {limit} byte cap")]
    ResponseTooLarge { size: u64, limit: u64 },

    /// Retriable network failure; exhausting retries surfaces the last one.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// The operation was cancelled from outside.
    #[error("operation cancelled")]
    Cancelled,

    /// The control plane refused a non-loopback bind address.
    #[error("bind address '{0}' is not loopback; refusing to start")]
    NonLoopbackBindRefused(String),

    /// A control-plane request body exceeded the cap.
    #[error("request body exceeds the {0} byte cap")]
    RequestBodyTooLarge(usize),

    /// Missing or mismatched API token.
    #[error("unauthorized")]
    Unauthorized,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable kind string used in control-plane error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigInvalid(_) => "ConfigInvalid",
            Error::Runtime(e) => match e {
                cm_runtime::Error::NoDebuggableTarget { .. } => "NoDebuggableTarget",
                cm_runtime::Error::ConnectFailed(_) => "CdpConnectFailed",
                cm_runtime::Error::CallTimeout { .. } => "CdpCallTimeout",
                cm_runtime::Error::FrameOversize { .. } => "CdpFrameOversize",
                cm_runtime::Error::Cancelled => "Cancelled",
                _ => "CdpConnectFailed",
            },
            Error::EncryptedStoreRequiresKey => "EncryptedStoreRequiresKey",
            Error::CaptureAuthFailure => "CaptureAuthFailure",
            Error::RecordTooLarge { .. } => "RecordTooLarge",
            Error::NoMatchingCapture => "NoMatchingCapture",
            Error::CaptureHostMismatch { .. } => "CaptureHostMismatch",
            Error::DomainNotAllowed(_) => "DomainNotAllowed",
            Error::PolicyDenied { .. } => "PolicyDenied",
            Error::ResponseTooLarge { .. } => "ResponseTooLarge",
            Error::Transient(_) => "Transient",
            Error::Cancelled => "Cancelled",
            Error::NonLoopbackBindRefused(_) => "NonLoopbackBindRefused",
            Error::RequestBodyTooLarge(_) => "RequestBodyTooLarge",
            Error::Unauthorized => "Unauthorized",
            Error::Io(_) => "Io",
            Error::Json(_) => "Json",
        }
    }

    /// Returns true if a replay attempt hitting this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Returns true for guard refusals, which are never retried.
    pub fn is_policy_refusal(&self) -> bool {
        matches!(
            self,
            Error::CaptureHostMismatch { .. }
                | Error::DomainNotAllowed(_)
                | Error::PolicyDenied { .. }
        )
    }
}
