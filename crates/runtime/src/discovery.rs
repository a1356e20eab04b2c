//! Browser debug-target discovery.
//!
//! Probes the DevTools HTTP endpoint (`/json/version`, then `/json`) and
//! picks a page target, optionally narrowed by a hint matched against the
//! target's url and title.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Backoff base between version probes.
const PROBE_BACKOFF_BASE: Duration = Duration::from_millis(250);
/// Backoff ceiling between version probes.
const PROBE_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// How to find the browser and which target to pick.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub host: String,
    pub port: u16,
    /// Case-insensitive substring matched against target url/title. Empty
    /// picks the first page.
    pub target_hint: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Probe attempts against `/json/version` before giving up.
    pub retries: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9222,
            target_hint: String::new(),
            timeout: Duration::from_secs(5),
            retries: 5,
        }
    }
}

/// One debuggable target as reported by `/json`.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetInfo {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: Option<String>,
}

/// Resolves the WebSocket debugger URL of the best-matching page target.
pub async fn discover_target(config: &DiscoveryConfig) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| Error::ConnectFailed(e.to_string()))?;

    let base = format!("http://{}:{}", config.host, config.port);

    probe_version(&client, &base, config.retries).await?;

    let targets: Vec<TargetInfo> = client
        .get(format!("{base}/json"))
        .send()
        .await
        .map_err(|e| Error::ConnectFailed(e.to_string()))?
        .json()
        .await
        .map_err(|e| Error::Protocol(format!("invalid /json payload: {e}")))?;

    select_target(&targets, &config.target_hint)
        .and_then(|t| t.web_socket_debugger_url.clone())
        .ok_or_else(|| Error::NoDebuggableTarget {
            hint: config.target_hint.clone(),
        })
}

/// Retries `/json/version` with exponential backoff until it answers 200.
async fn probe_version(client: &reqwest::Client, base: &str, retries: u32) -> Result<()> {
    let url = format!("{base}/json/version");
    let mut last_error = String::new();

    for attempt in 0..retries.max(1) {
        if attempt > 0 {
            let backoff = PROBE_BACKOFF_BASE
                .saturating_mul(1 << (attempt - 1).min(8))
                .min(PROBE_BACKOFF_CAP);
            tokio::time::sleep(backoff).await;
        }

        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => {
                last_error = format!("{url} answered {}", response.status());
            }
            Err(e) => {
                last_error = e.to_string();
            }
        }
        tracing::debug!(attempt, error = %last_error, "version probe failed");
    }

    Err(Error::ConnectFailed(last_error))
}

/// First page matching the hint, else the first page.
fn select_target<'a>(targets: &'a [TargetInfo], hint: &str) -> Option<&'a TargetInfo> {
    let pages = || targets.iter().filter(|t| t.kind == "page");

    if !hint.is_empty() {
        let hint = hint.to_ascii_lowercase();
        if let Some(hit) = pages().find(|t| {
            t.url.to_ascii_lowercase().contains(&hint)
                || t.title.to_ascii_lowercase().contains(&hint)
        }) {
            return Some(hit);
        }
    }

    pages().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn target(kind: &str, url: &str, title: &str) -> TargetInfo {
        TargetInfo {
            kind: kind.to_string(),
            url: url.to_string(),
            title: title.to_string(),
            web_socket_debugger_url: Some(format!("ws://127.0.0.1:9222/devtools/{url}")),
        }
    }

    #[test]
    fn hint_matches_url_or_title_case_insensitively() {
        let targets = vec![
            target("page", "https://a.example/", "Front page"),
            target("page", "https://mail.example/inbox", "Inbox"),
        ];

        let by_url = select_target(&targets, "MAIL.example").unwrap();
        assert_eq!(by_url.url, "https://mail.example/inbox");

        let by_title = select_target(&targets, "inbox").unwrap();
        assert_eq!(by_title.title, "Inbox");
    }

    #[test]
    fn unmatched_hint_falls_back_to_first_page() {
        let targets = vec![
            target("service_worker", "https://w.example/", "worker"),
            target("page", "https://a.example/", "A"),
            target("page", "https://b.example/", "B"),
        ];

        let selected = select_target(&targets, "nothing-matches").unwrap();
        assert_eq!(selected.url, "https://a.example/");
    }

    #[test]
    fn no_pages_selects_nothing() {
        let targets = vec![target("service_worker", "https://w.example/", "worker")];
        assert!(select_target(&targets, "").is_none());
    }

    /// One-connection-at-a-time HTTP responder serving canned bodies by path.
    async fn fake_devtools_http(version_failures: u32) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut version_failures = version_failures;
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]).to_string();

                let (status, body) = if head.starts_with("GET /json/version") {
                    if version_failures > 0 {
                        version_failures -= 1;
                        ("503 Service Unavailable", String::new())
                    } else {
                        ("200 OK", r#"{"Browser":"Chrome/126.0"}"#.to_string())
                    }
                } else if head.starts_with("GET /json") {
                    let addr_str = addr.to_string();
                    (
                        "200 OK",
                        format!(
                            r#"[{{"type":"page","url":"https://a.example/","title":"A","webSocketDebuggerUrl":"ws://{addr_str}/devtools/page/1"}}]"#
                        ),
                    )
                } else {
                    ("404 Not Found", String::new())
                };

                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        addr
    }

    #[tokio::test]
    async fn discovers_after_probe_retries() {
        let addr = fake_devtools_http(2).await;
        let config = DiscoveryConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            retries: 4,
            ..Default::default()
        };

        let ws_url = discover_target(&config).await.unwrap();
        assert!(ws_url.starts_with("ws://"));
        assert!(ws_url.ends_with("/devtools/page/1"));
    }

    #[tokio::test]
    async fn probe_exhaustion_is_connect_failed() {
        let addr = fake_devtools_http(10).await;
        let config = DiscoveryConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            retries: 2,
            ..Default::default()
        };

        let err = discover_target(&config).await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed(_)), "got {err:?}");
    }
}
