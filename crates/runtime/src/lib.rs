//! CDP runtime - transport, correlation, and target discovery.
//!
//! This crate provides the low-level plumbing for talking to a
//! Chromium-family browser over the Chrome DevTools Protocol:
//!
//! - **Discovery**: Probing the debug HTTP endpoint and picking a page target
//! - **Transport**: JSON text frames over WebSocket with a size cap
//! - **Connection**: call/response correlation and event fan-out
//! - **Queue**: bounded drop-oldest handoff between reader and consumers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │    cm-rs    │  Capture pipeline / replay engine
//! └──────┬──────┘
//!        │ call() / subscribe()
//! ┌──────▼──────┐
//! │  cm-runtime │  This crate
//! │  ┌────────┐ │
//! │  │ Conn   │ │  id correlation, event queues
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Trans  │ │  WebSocket transport
//! │  └────────┘ │
//! │  ┌────────┐ │
//! │  │ Disco  │ │  /json/version, /json probing
//! │  └────────┘ │
//! └─────────────┘
//! ```

pub mod connection;
pub mod discovery;
pub mod error;
pub mod queue;
pub mod transport;

pub use connection::{CdpConnection, CdpErrorPayload, CdpRequest};
pub use discovery::{DiscoveryConfig, TargetInfo, discover_target};
pub use error::{Error, Result};
pub use queue::{EVENT_QUEUE_CAPACITY, EventQueue};
pub use transport::MAX_FRAME_BYTES;
