//! Declarative replay guardrails.
//!
//! A [`ReplayPolicy`] is pure data; enforcement (including glob matching of
//! deny rules) lives in the replay engine. Policies are immutable after
//! construction and safe to share.

use serde::{Deserialize, Serialize};

/// One deny rule: host glob, method set, path glob. First matching rule
/// denies the replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenyRule {
    /// Glob matched against the outbound host, e.g. `*.internal.example`.
    pub host: String,

    /// Uppercase methods this rule applies to. Empty applies to all.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Glob matched against the outbound URL path, e.g. `/admin/*`.
    #[serde(default = "default_path_glob")]
    pub path: String,
}

fn default_path_glob() -> String {
    "*".to_string()
}

/// Guardrail set applied before a replay issues any network I/O.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayPolicy {
    /// Hosts the outbound URL must equal or be a dot-suffix of. Empty means
    /// no domain allowlist.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    /// Ordered deny rules; first match denies.
    #[serde(default)]
    pub deny_rules: Vec<DenyRule>,

    /// Require the outbound host to equal the selected capture's host.
    #[serde(default)]
    pub enforce_capture_host: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_permissive() {
        let policy = ReplayPolicy::default();
        assert!(policy.allowed_domains.is_empty());
        assert!(policy.deny_rules.is_empty());
        assert!(!policy.enforce_capture_host);
    }

    #[test]
    fn deny_rule_path_defaults_to_match_all() {
        let rule: DenyRule = serde_json::from_str(r#"{"host": "*.example"}"#).unwrap();
        assert_eq!(rule.path, "*");
        assert!(rule.methods.is_empty());
    }
}
