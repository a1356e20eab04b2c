//! Single typed entry point over capture and replay.
//!
//! A [`CookieMonster`] owns its policy and adapter registry and nothing
//! else; every job opens and closes its own transport and store handles, so
//! instances are cheap and independent. Blocking variants drive the async
//! form on a dedicated current-thread runtime.

use tokio::sync::watch;

use crate::adapter::AdapterRegistry;
use crate::error::Result;
use crate::{pipeline, replay};
use cm_protocol::{CaptureConfig, CaptureSummary, ReplayConfig, ReplayPolicy, ReplayResult};

/// The programmatic facade.
#[derive(Default)]
pub struct CookieMonster {
    policy: Option<ReplayPolicy>,
    adapters: AdapterRegistry,
}

impl CookieMonster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies this guard policy to every replay.
    pub fn with_policy(mut self, policy: ReplayPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn policy(&self) -> Option<&ReplayPolicy> {
        self.policy.as_ref()
    }

    /// Runs a capture until its duration elapses or its record cap is hit.
    pub async fn capture(&self, config: &CaptureConfig) -> Result<CaptureSummary> {
        // Held so the pipeline's cancel branch stays quiet.
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        pipeline::run_capture(config, cancel_rx).await
    }

    /// Like [`capture`](Self::capture) with an external cancel signal; on
    /// cancellation the store is flushed and `Cancelled` returned.
    pub async fn capture_with_cancel(
        &self,
        config: &CaptureConfig,
        cancel: watch::Receiver<bool>,
    ) -> Result<CaptureSummary> {
        pipeline::run_capture(config, cancel).await
    }

    /// Replays one request from a capture store.
    pub async fn replay(&self, config: &ReplayConfig) -> Result<ReplayResult> {
        replay::run_replay(config, self.policy.as_ref(), &self.adapters).await
    }

    /// Blocking form of [`capture`](Self::capture).
    pub fn capture_blocking(&self, config: &CaptureConfig) -> Result<CaptureSummary> {
        blocking_runtime()?.block_on(self.capture(config))
    }

    /// Blocking form of [`replay`](Self::replay).
    pub fn replay_blocking(&self, config: &ReplayConfig) -> Result<ReplayResult> {
        blocking_runtime()?.block_on(self.replay(config))
    }
}

fn blocking_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_blocking_drives_async_engine() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.jsonl");

        let config: ReplayConfig = serde_json::from_value(serde_json::json!({
            "capture_file": missing,
            "request_url": "https://a.example/x",
        }))
        .unwrap();

        // No store file: the engine must surface an I/O error without a
        // surrounding runtime.
        let err = CookieMonster::new().replay_blocking(&config).unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }
}
