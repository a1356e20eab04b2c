//! Capture/replay engine for browser authentication headers.
//!
//! Attach to a running Chromium-family browser over the Chrome DevTools
//! Protocol, record the authentication-bearing headers of the requests it
//! makes, and later replay HTTP requests built from those records - behind
//! host and domain guards, with bounded retries.
//!
//! # Quick start
//!
//! ```no_run
//! use cm::CookieMonster;
//! use cm_protocol::{CaptureConfig, ReplayConfig};
//!
//! # async fn demo() -> cm::Result<()> {
//! let engine = CookieMonster::new();
//!
//! let capture: CaptureConfig = serde_json::from_str(
//!     r#"{"output_file": "cap.jsonl", "host_filter": ["a.example"]}"#,
//! )?;
//! let summary = engine.capture(&capture).await?;
//! println!("captured {} requests", summary.count);
//!
//! let replay: ReplayConfig = serde_json::from_str(
//!     r#"{"capture_file": "cap.jsonl", "request_url": "https://a.example/api"}"#,
//! )?;
//! let result = engine.replay(&replay).await?;
//! println!("{}", result.status_code);
//! # Ok(())
//! # }
//! ```
//!
//! # Module map
//!
//! - [`headers`]: classify header names, redact values for display
//! - [`crypto`]: per-line AEAD for capture stores
//! - [`store`]: append-only JSONL reader/writer and capture selection
//! - [`pipeline`]: CDP event stream to store records
//! - [`replay`]: guarded outbound HTTP from stored captures
//! - [`adapter`]: named header-rewrite plugins
//! - [`facade`]: the [`CookieMonster`] entry point

pub mod adapter;
pub mod crypto;
pub mod error;
pub mod facade;
pub mod headers;
pub mod pipeline;
pub mod replay;
pub mod store;

pub use adapter::{Adapter, AdapterRegistry};
pub use crypto::StoreKey;
pub use error::{Error, Result};
pub use facade::CookieMonster;
pub use store::{LoadStats, RecordSummary, StoreWriter, load_all, select, summarize};

// The wire types are part of this crate's public surface.
pub use cm_protocol::{
    BodySource, CaptureConfig, CaptureRecord, CaptureSummary, DenyRule, HeaderMap, KeySource,
    ReplayConfig, ReplayPolicy, ReplayResult, RetryConfig, Selector,
};
