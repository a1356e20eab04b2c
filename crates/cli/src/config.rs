//! Environment fallbacks, read once at config-resolution time.
//!
//! The rest of the binary only ever sees the resolved [`EnvConfig`] value;
//! nothing reads the process environment after startup.

/// Environment variables consumed by the binary.
pub const ENV_ENCRYPTION_KEY: &str = "COOKIE_MONSTER_ENCRYPTION_KEY";
pub const ENV_API_TOKEN: &str = "COOKIE_MONSTER_API_TOKEN";
pub const ENV_ALLOW_REMOTE: &str = "COOKIE_MONSTER_ALLOW_REMOTE";

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    /// base64url store key, if exported.
    pub encryption_key: Option<String>,
    /// Control-plane token, if exported.
    pub api_token: Option<String>,
    /// `1`/`true` permits a non-loopback bind.
    pub allow_remote: bool,
}

pub fn resolve_env() -> EnvConfig {
    EnvConfig {
        encryption_key: non_empty(std::env::var(ENV_ENCRYPTION_KEY).ok()),
        api_token: non_empty(std::env::var(ENV_API_TOKEN).ok()),
        allow_remote: std::env::var(ENV_ALLOW_REMOTE)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_remote_accepts_1_and_true() {
        unsafe { std::env::set_var(ENV_ALLOW_REMOTE, "true") };
        assert!(resolve_env().allow_remote);
        unsafe { std::env::set_var(ENV_ALLOW_REMOTE, "1") };
        assert!(resolve_env().allow_remote);
        unsafe { std::env::set_var(ENV_ALLOW_REMOTE, "0") };
        assert!(!resolve_env().allow_remote);
        unsafe { std::env::remove_var(ENV_ALLOW_REMOTE) };
    }
}
