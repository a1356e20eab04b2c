//! Named header-rewrite adapters.
//!
//! Site-specific header tweaks live outside the core; the engine only knows
//! the [`Adapter`] capability and a name-keyed registry handed in at
//! construction. Adapters are stateless and run after the header merge and
//! before the replay guards.

use std::collections::HashMap;
use std::sync::Arc;

use cm_protocol::{CaptureRecord, HeaderMap};

/// A stateless header rewrite keyed by name.
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    /// Takes the merged outbound headers and returns the set to send.
    fn rewrite_headers(&self, capture: &CaptureRecord, headers: HeaderMap) -> HeaderMap;
}

/// Adapters available to replay configs, resolved by name.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StripUserAgent;

    impl Adapter for StripUserAgent {
        fn name(&self) -> &str {
            "strip-user-agent"
        }

        fn rewrite_headers(&self, _capture: &CaptureRecord, mut headers: HeaderMap) -> HeaderMap {
            headers.remove("User-Agent");
            headers
        }
    }

    #[test]
    fn registry_resolves_by_name() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(StripUserAgent));

        assert!(registry.get("strip-user-agent").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names().collect::<Vec<_>>(), ["strip-user-agent"]);
    }
}
