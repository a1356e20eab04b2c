//! Replay engine: build an outbound request from a stored capture and
//! execute it behind guards.
//!
//! Guards run strictly before any network I/O. Retries cover transient
//! transport failures and 5xx responses only; guard refusals and 4xx
//! responses are final. Redirects are followed manually so the domain
//! allowlist can be re-applied on every cross-host hop.

use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::Method;
use reqwest::header::{HeaderName, HeaderValue};
use url::Url;

use crate::adapter::AdapterRegistry;
use crate::crypto::StoreKey;
use crate::error::{Error, Result};
use crate::store;
use cm_protocol::{
    BodySource, CaptureRecord, HeaderMap, ReplayConfig, ReplayPolicy, ReplayResult,
};

/// Response bodies above this size abort the replay.
pub const MAX_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;

/// Hop-by-hop headers never forwarded from a capture.
const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

/// Runs one replay to completion.
pub async fn run_replay(
    config: &ReplayConfig,
    policy: Option<&ReplayPolicy>,
    adapters: &AdapterRegistry,
) -> Result<ReplayResult> {
    let key = StoreKey::resolve(&config.encryption_key_source)?;
    let (records, stats) = store::load_all(&config.capture_file, key.as_ref())?;
    if stats.corrupt_lines > 0 || stats.auth_failures > 0 {
        tracing::warn!(
            corrupt = stats.corrupt_lines,
            auth_failures = stats.auth_failures,
            "capture store loaded with skipped lines"
        );
    }

    let selected = store::select(&records, &config.selector).ok_or(Error::NoMatchingCapture)?;
    tracing::debug!(
        request_id = %selected.request_id,
        url = %selected.url,
        "selected capture"
    );

    let url = parse_request_url(&config.request_url)?;
    let method = config
        .method
        .as_deref()
        .unwrap_or(&selected.method)
        .to_ascii_uppercase();

    let mut headers = forwardable_headers(&selected.headers);
    for (name, value) in config.extra_headers.iter() {
        headers.insert(name.to_string(), value.to_string());
    }

    let body = resolve_body(config, selected, &mut headers)?;

    if let Some(name) = &config.adapter {
        let adapter = adapters
            .get(name)
            .ok_or_else(|| Error::ConfigInvalid(format!("unknown adapter '{name}'")))?;
        headers = adapter.rewrite_headers(selected, headers);
    }

    // Everything above is local work; nothing has touched the network yet.
    enforce_guards(config, policy, selected, &url, &method)?;

    execute(config, policy, selected, url, method, headers, body).await
}

fn parse_request_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| Error::ConfigInvalid(format!("request_url '{raw}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::ConfigInvalid(format!(
            "request_url must be http or https, got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(Error::ConfigInvalid(format!(
            "request_url '{raw}' has no host"
        )));
    }
    Ok(url)
}

/// Capture headers minus hop-by-hop and proxy headers.
fn forwardable_headers(captured: &HeaderMap) -> HeaderMap {
    captured
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            !HOP_BY_HOP.contains(&lower.as_str()) && !lower.starts_with("proxy-")
        })
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn resolve_body(
    config: &ReplayConfig,
    selected: &CaptureRecord,
    headers: &mut HeaderMap,
) -> Result<Option<Vec<u8>>> {
    match &config.body {
        BodySource::None => Ok(None),
        BodySource::Captured => Ok(selected
            .post_data
            .as_ref()
            .map(|text| text.as_bytes().to_vec())),
        BodySource::Inline(text) => Ok(Some(text.as_bytes().to_vec())),
        BodySource::File(path) => Ok(Some(std::fs::read(path)?)),
        BodySource::Json(value) => {
            if !headers.contains("Content-Type") {
                headers.insert("Content-Type", "application/json");
            }
            Ok(Some(serde_json::to_vec(value)?))
        }
    }
}

/// Host equality, domain allowlist, then deny rules - in that order, all
/// before any socket is opened.
fn enforce_guards(
    config: &ReplayConfig,
    policy: Option<&ReplayPolicy>,
    selected: &CaptureRecord,
    url: &Url,
    method: &str,
) -> Result<()> {
    let host = url.host_str().unwrap_or_default();

    let enforce_host =
        config.enforce_capture_host || policy.is_some_and(|p| p.enforce_capture_host);
    if enforce_host && !host.eq_ignore_ascii_case(&selected.host) {
        return Err(Error::CaptureHostMismatch {
            expected: selected.host.clone(),
            actual: host.to_string(),
        });
    }

    if let Some(policy) = policy {
        check_allowlist(policy, host)?;

        for (rule_index, rule) in policy.deny_rules.iter().enumerate() {
            let host_glob = glob::Pattern::new(&rule.host).map_err(|e| {
                Error::ConfigInvalid(format!("deny rule {rule_index} host glob: {e}"))
            })?;
            let path_glob = glob::Pattern::new(&rule.path).map_err(|e| {
                Error::ConfigInvalid(format!("deny rule {rule_index} path glob: {e}"))
            })?;

            let method_hit = rule.methods.is_empty()
                || rule.methods.iter().any(|m| m.eq_ignore_ascii_case(method));
            if method_hit && host_glob.matches(host) && path_glob.matches(url.path()) {
                return Err(Error::PolicyDenied { rule_index });
            }
        }
    }

    Ok(())
}

/// Equal to, or a dot-suffix of, some allowlist entry.
fn check_allowlist(policy: &ReplayPolicy, host: &str) -> Result<()> {
    if policy.allowed_domains.is_empty() {
        return Ok(());
    }
    let allowed = policy.allowed_domains.iter().any(|domain| {
        host.eq_ignore_ascii_case(domain)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", domain.to_ascii_lowercase()))
    });
    if allowed {
        Ok(())
    } else {
        Err(Error::DomainNotAllowed(host.to_string()))
    }
}

async fn execute(
    config: &ReplayConfig,
    policy: Option<&ReplayPolicy>,
    selected: &CaptureRecord,
    url: Url,
    method: String,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
) -> Result<ReplayResult> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs_f64(config.timeout_seconds.max(0.001)))
        .build()
        .map_err(|e| Error::ConfigInvalid(e.to_string()))?;

    let attempts = config.retry.attempts.max(1);
    let started = Instant::now();
    let mut last_transient = String::new();

    for attempt in 1..=attempts {
        if attempt > 1 {
            let exp = config.retry.backoff_seconds * 2f64.powi(attempt as i32 - 2);
            let sleep_secs = if config.retry.jitter && exp > 0.0 {
                rand::thread_rng().gen_range(0.0..exp)
            } else {
                exp
            };
            if sleep_secs > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(sleep_secs)).await;
            }
        }

        match attempt_once(
            &client,
            config,
            policy,
            url.clone(),
            &method,
            &headers,
            body.as_deref(),
        )
        .await
        {
            Ok(outcome) => {
                let retriable = outcome.status_code >= 500 && attempt < attempts;
                if retriable {
                    tracing::debug!(attempt, status = outcome.status_code, "retrying on 5xx");
                    continue;
                }
                return Ok(ReplayResult {
                    status_code: outcome.status_code,
                    response_headers: outcome.headers,
                    body: outcome.body,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    attempts: attempt,
                    final_url_after_redirects: outcome.final_url,
                    selected_capture_request_id: selected.request_id.clone(),
                });
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                last_transient = e.to_string();
                tracing::debug!(attempt, error = %last_transient, "retrying on transient failure");
            }
            Err(e) => return Err(e),
        }
    }

    Err(Error::Transient(last_transient))
}

struct AttemptOutcome {
    status_code: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    final_url: String,
}

async fn attempt_once(
    client: &reqwest::Client,
    config: &ReplayConfig,
    policy: Option<&ReplayPolicy>,
    mut url: Url,
    method: &str,
    headers: &HeaderMap,
    body: Option<&[u8]>,
) -> Result<AttemptOutcome> {
    let mut method = Method::from_bytes(method.as_bytes())
        .map_err(|_| Error::ConfigInvalid(format!("invalid method '{method}'")))?;
    let mut body = body.map(<[u8]>::to_vec);
    let mut redirects = 0u32;

    loop {
        let mut request = client.request(method.clone(), url.clone());
        for (name, value) in headers.iter() {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                tracing::debug!(name, "skipping unsendable header");
                continue;
            };
            request = request.header(name, value);
        }
        if let Some(bytes) = &body {
            request = request.body(bytes.clone());
        }

        let response = request.send().await.map_err(classify_send_error)?;
        let status = response.status();

        if status.is_redirection() && redirects < config.redirect_limit {
            if let Some(next) = redirect_target(&response, &url) {
                let cross_host = next.host_str() != url.host_str();
                if cross_host {
                    let next_host = next.host_str().unwrap_or_default();
                    if let Some(policy) = policy {
                        if check_allowlist(policy, next_host).is_err() {
                            // The redirect escapes the allowlist: surface the
                            // 3xx itself rather than following it.
                            tracing::warn!(
                                host = next_host,
                                "redirect target outside allowlist; stopping"
                            );
                            return read_outcome(response, &url).await;
                        }
                    }
                }

                // Browsers and clients rewrite these to GET; keep parity.
                if status == 303
                    || ((status == 301 || status == 302)
                        && method != Method::GET
                        && method != Method::HEAD)
                {
                    method = Method::GET;
                    body = None;
                }

                redirects += 1;
                url = next;
                continue;
            }
        }

        return read_outcome(response, &url).await;
    }
}

fn redirect_target(response: &reqwest::Response, base: &Url) -> Option<Url> {
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)?
        .to_str()
        .ok()?;
    base.join(location).ok()
}

fn classify_send_error(e: reqwest::Error) -> Error {
    // Connect failures, timeouts, and mid-body drops are all worth a retry.
    Error::Transient(e.to_string())
}

async fn read_outcome(mut response: reqwest::Response, url: &Url) -> Result<AttemptOutcome> {
    if let Some(length) = response.content_length() {
        if length > MAX_RESPONSE_BYTES {
            return Err(Error::ResponseTooLarge {
                size: length,
                limit: MAX_RESPONSE_BYTES,
            });
        }
    }

    let status_code = response.status().as_u16();
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            // Joining repeats keeps the mapping shape without losing data.
            let merged = match headers.get(name.as_str()) {
                Some(existing) => format!("{existing}, {value}"),
                None => value.to_string(),
            };
            headers.insert(name.to_string(), merged);
        }
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(classify_send_error)? {
        if (body.len() + chunk.len()) as u64 > MAX_RESPONSE_BYTES {
            return Err(Error::ResponseTooLarge {
                size: (body.len() + chunk.len()) as u64,
                limit: MAX_RESPONSE_BYTES,
            });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(AttemptOutcome {
        status_code,
        headers,
        body,
        final_url: url.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cm_protocol::DenyRule;

    fn capture(url: &str) -> CaptureRecord {
        CaptureRecord {
            request_id: "1000.1".to_string(),
            method: "GET".to_string(),
            url: url.to_string(),
            host: Url::parse(url).unwrap().host_str().unwrap().to_string(),
            resource_type: "XHR".to_string(),
            headers: [
                ("Cookie".to_string(), "s=1".to_string()),
                ("Connection".to_string(), "keep-alive".to_string()),
                ("Proxy-Connection".to_string(), "keep-alive".to_string()),
            ]
            .into_iter()
            .collect(),
            post_data: None,
            captured_at: "2026-08-01T10:00:00Z".parse().unwrap(),
            initiator_host: None,
            extra: serde_json::Map::new(),
        }
    }

    fn replay_config(url: &str) -> ReplayConfig {
        serde_json::from_value(serde_json::json!({
            "capture_file": "cap.jsonl",
            "request_url": url,
        }))
        .unwrap()
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let headers = forwardable_headers(&capture("https://a.example/x").headers);
        assert_eq!(headers.get("Cookie"), Some("s=1"));
        assert!(headers.get("Connection").is_none());
        assert!(headers.get("Proxy-Connection").is_none());
    }

    #[test]
    fn capture_host_guard() {
        let selected = capture("https://a.example/x");
        let url = Url::parse("https://evil.example/x").unwrap();
        let mut config = replay_config("https://evil.example/x");
        config.enforce_capture_host = true;

        let err = enforce_guards(&config, None, &selected, &url, "GET").unwrap_err();
        assert!(matches!(err, Error::CaptureHostMismatch { .. }));
    }

    #[test]
    fn allowlist_accepts_exact_and_dot_suffix() {
        let policy = ReplayPolicy {
            allowed_domains: vec!["a.example".to_string()],
            ..Default::default()
        };

        assert!(check_allowlist(&policy, "a.example").is_ok());
        assert!(check_allowlist(&policy, "api.a.example").is_ok());
        assert!(matches!(
            check_allowlist(&policy, "nota.example"),
            Err(Error::DomainNotAllowed(_))
        ));
        assert!(matches!(
            check_allowlist(&policy, "a.example.evil"),
            Err(Error::DomainNotAllowed(_))
        ));
    }

    #[test]
    fn deny_rules_match_first_and_report_index() {
        let selected = capture("https://a.example/x");
        let url = Url::parse("https://a.example/admin/users").unwrap();
        let config = replay_config("https://a.example/admin/users");
        let policy = ReplayPolicy {
            deny_rules: vec![
                DenyRule {
                    host: "*.other".to_string(),
                    methods: vec![],
                    path: "*".to_string(),
                },
                DenyRule {
                    host: "a.example".to_string(),
                    methods: vec!["GET".to_string()],
                    path: "/admin/*".to_string(),
                },
            ],
            ..Default::default()
        };

        let err = enforce_guards(&config, Some(&policy), &selected, &url, "GET").unwrap_err();
        assert!(matches!(err, Error::PolicyDenied { rule_index: 1 }));
    }

    #[test]
    fn deny_rule_method_set_limits_scope() {
        let selected = capture("https://a.example/x");
        let url = Url::parse("https://a.example/admin/users").unwrap();
        let config = replay_config("https://a.example/admin/users");
        let policy = ReplayPolicy {
            deny_rules: vec![DenyRule {
                host: "a.example".to_string(),
                methods: vec!["DELETE".to_string()],
                path: "/admin/*".to_string(),
            }],
            ..Default::default()
        };

        assert!(enforce_guards(&config, Some(&policy), &selected, &url, "GET").is_ok());
    }

    #[test]
    fn json_body_sets_content_type_once() {
        let selected = capture("https://a.example/x");
        let mut config = replay_config("https://a.example/x");
        config.body = BodySource::Json(serde_json::json!({"k": "v"}));

        let mut headers = HeaderMap::new();
        let body = resolve_body(&config, &selected, &mut headers).unwrap();
        assert_eq!(body.as_deref(), Some(br#"{"k":"v"}"#.as_slice()));
        assert_eq!(headers.get("content-type"), Some("application/json"));

        let mut preset = HeaderMap::new();
        preset.insert("Content-Type", "application/vnd.custom+json");
        resolve_body(&config, &selected, &mut preset).unwrap();
        assert_eq!(preset.get("content-type"), Some("application/vnd.custom+json"));
    }

    #[test]
    fn non_http_scheme_is_config_error() {
        assert!(matches!(
            parse_request_url("ftp://a.example/x"),
            Err(Error::ConfigInvalid(_))
        ));
        assert!(matches!(
            parse_request_url("not a url"),
            Err(Error::ConfigInvalid(_))
        ));
    }
}
