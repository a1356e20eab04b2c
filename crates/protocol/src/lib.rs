//! Wire types for the capture/replay engine.
//!
//! This crate contains the serde-serializable types shared across the
//! workspace: the capture-file line format, capture and replay configs, the
//! replay guard policy, and the summary/result payloads returned by the
//! control plane. These types represent the "wire layer" - the shapes of
//! data as they appear in capture files and HTTP bodies.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! - **Pure data**: No behavior beyond (de)serialization and small accessors
//! - **Permissive**: Unknown JSON keys are tolerated (and round-tripped on
//!   [`CaptureRecord`]); missing optional keys default
//! - **Stable**: Changes only when the file format or API surface changes
//!
//! The engine built on top of these types lives in `cm-rs`.

pub mod config;
pub mod policy;
pub mod record;
pub mod summary;

pub use config::*;
pub use policy::*;
pub use record::*;
pub use summary::*;

/// Serde helper for byte fields carried as base64 in JSON payloads.
pub mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}
