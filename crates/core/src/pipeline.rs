//! Capture pipeline: browser events in, store records out.
//!
//! Resolves a debug target, subscribes to `Network.requestWillBeSent`, and
//! appends every event that survives the configured filters. Records are
//! assembled fully in memory before the append, so the store never sees a
//! partial line.

use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::watch;

use crate::crypto::StoreKey;
use crate::error::{Error, Result};
use crate::headers::{HeaderClass, classify};
use crate::store::StoreWriter;
use cm_protocol::{CaptureConfig, CaptureRecord, CaptureSummary, HeaderMap, is_standard_method};
use cm_runtime::{CdpConnection, DiscoveryConfig, discover_target};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
const POST_DATA_TIMEOUT: Duration = Duration::from_secs(2);

/// Post-data bytes requested from the browser per event.
const MAX_POST_DATA_BYTES: u64 = 64 * 1024;

/// Runs one capture to completion: duration elapsed, record cap reached, or
/// cancellation. On cancellation the store is flushed and closed before
/// `Cancelled` is returned.
pub async fn run_capture(
    config: &CaptureConfig,
    mut cancel: watch::Receiver<bool>,
) -> Result<CaptureSummary> {
    validate(config)?;
    let key = StoreKey::resolve(&config.encryption_key_source)?;

    let discovery = DiscoveryConfig {
        host: config.browser_host.clone(),
        port: config.browser_port,
        target_hint: config.target_hint.clone(),
        ..Default::default()
    };
    let ws_url = discover_target(&discovery).await?;
    tracing::info!(ws_url = %ws_url, "attaching to browser target");

    let conn = CdpConnection::connect(&ws_url, CONNECT_TIMEOUT).await?;

    // Subscriptions must exist before enabling the domain or early events
    // would miss their queues.
    let requests = conn.subscribe("Network.requestWillBeSent");
    let responses = config
        .capture_responses
        .then(|| conn.subscribe("Network.responseReceived"));
    let failures = config
        .capture_responses
        .then(|| conn.subscribe("Network.loadingFailed"));

    let mut enable_params = json!({});
    if config.capture_post_data {
        enable_params = json!({ "maxPostDataSize": MAX_POST_DATA_BYTES });
    }
    // Enable failures are fatal; nothing would ever arrive.
    if let Err(e) = conn.call("Network.enable", enable_params, CALL_TIMEOUT).await {
        conn.close().await;
        return Err(e.into());
    }

    let mut writer = match StoreWriter::open_append(&config.output_file, key) {
        Ok(writer) => writer,
        Err(e) => {
            conn.close().await;
            return Err(e);
        }
    };
    let started = Instant::now();
    let deadline = config
        .duration_seconds
        .map(|secs| started + Duration::from_secs(secs));

    let mut summary = CaptureSummary {
        output_path: config.output_file.clone(),
        ..Default::default()
    };
    let mut cancelled = false;
    let mut cancel_gone = false;
    let mut failure: Option<Error> = None;

    loop {
        tokio::select! {
            biased;

            changed = cancel.changed(), if !cancel_gone => {
                match changed {
                    Ok(()) if *cancel.borrow() => {
                        cancelled = true;
                        break;
                    }
                    Ok(()) => {}
                    // Sender dropped; cancellation can no longer arrive.
                    Err(_) => cancel_gone = true,
                }
            }

            _ = sleep_until_opt(deadline) => break,

            event = requests.pop() => {
                let Some(params) = event else { break };
                match build_record(config, &params) {
                    Some(mut record) => {
                        if config.capture_post_data && record.post_data.is_none() {
                            record.post_data =
                                fetch_post_data(&conn, &params, &mut summary).await;
                        }
                        if let Err(e) = writer.append(&record) {
                            failure = Some(e);
                            break;
                        }
                        summary.count += 1;
                        if config.max_records.is_some_and(|max| summary.count >= max) {
                            break;
                        }
                    }
                    None => summary.dropped_by_filter += 1,
                }
            }

            event = pop_opt(&responses) => {
                if event.is_some() {
                    summary.responses_seen += 1;
                }
            }

            event = pop_opt(&failures) => {
                if event.is_some() {
                    summary.loading_failures += 1;
                }
            }
        }
    }

    conn.close().await;

    summary.queue_drops = requests.drops();
    summary.bytes_written = writer.bytes_written();
    summary.elapsed_ms = started.elapsed().as_millis() as u64;
    writer.close()?;

    if let Some(e) = failure {
        return Err(e);
    }
    if cancelled {
        return Err(Error::Cancelled);
    }

    tracing::info!(
        count = summary.count,
        dropped = summary.dropped_by_filter,
        "capture finished"
    );
    Ok(summary)
}

fn validate(config: &CaptureConfig) -> Result<()> {
    if config.output_file.as_os_str().is_empty() {
        return Err(Error::ConfigInvalid("output_file is required".to_string()));
    }
    for method in &config.method_filter {
        if !is_standard_method(method) {
            return Err(Error::ConfigInvalid(format!(
                "method filter entry '{method}' is not an uppercase HTTP verb"
            )));
        }
    }
    Ok(())
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn pop_opt(queue: &Option<std::sync::Arc<cm_runtime::EventQueue>>) -> Option<Value> {
    match queue {
        Some(queue) => queue.pop().await,
        None => std::future::pending().await,
    }
}

/// Builds a record from one `Network.requestWillBeSent` payload, or drops it.
fn build_record(config: &CaptureConfig, params: &Value) -> Option<CaptureRecord> {
    let request = params.get("request")?;
    let url = request.get("url")?.as_str()?;
    let method = request.get("method")?.as_str()?.to_ascii_uppercase();
    let request_id = params.get("requestId")?.as_str()?.to_string();
    let resource_type = params
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("Other")
        .to_string();

    if !is_standard_method(&method) {
        return None;
    }
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_string();

    if !config.host_filter.is_empty()
        && !config.host_filter.iter().any(|entry| host.contains(entry))
    {
        return None;
    }
    if !config.method_filter.is_empty() && !config.method_filter.iter().any(|m| *m == method) {
        return None;
    }
    if !config.resource_type_filter.is_empty()
        && !config
            .resource_type_filter
            .iter()
            .any(|rt| *rt == resource_type)
    {
        return None;
    }

    let mut headers = HeaderMap::new();
    if let Some(map) = request.get("headers").and_then(Value::as_object) {
        for (name, value) in map {
            let Some(value) = value.as_str() else { continue };
            let keep =
                config.include_all_headers || classify(name) != HeaderClass::Safe;
            if keep {
                headers.insert(name.clone(), value.to_string());
            }
        }
    }

    let post_data = request
        .get("postData")
        .and_then(Value::as_str)
        .map(str::to_string);

    let initiator_host = params
        .get("initiator")
        .and_then(|i| i.get("url"))
        .or_else(|| params.get("documentURL"))
        .and_then(Value::as_str)
        .and_then(|u| url::Url::parse(u).ok())
        .and_then(|u| u.host_str().map(str::to_string));

    Some(CaptureRecord {
        request_id,
        method,
        url: url.to_string(),
        host,
        resource_type,
        headers,
        post_data,
        captured_at: chrono::Utc::now(),
        initiator_host,
        extra: serde_json::Map::new(),
    })
}

/// Follow-up body fetch; misses are counted, never fatal.
async fn fetch_post_data(
    conn: &CdpConnection,
    params: &Value,
    summary: &mut CaptureSummary,
) -> Option<String> {
    let has_post_data = params
        .get("request")
        .and_then(|r| r.get("hasPostData"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !has_post_data {
        return None;
    }

    let request_id = params.get("requestId")?.as_str()?;
    match conn
        .call(
            "Network.getRequestPostData",
            json!({ "requestId": request_id }),
            POST_DATA_TIMEOUT,
        )
        .await
    {
        Ok(result) => result
            .get("postData")
            .and_then(Value::as_str)
            .map(str::to_string),
        Err(e) => {
            tracing::debug!(request_id, error = %e, "post data fetch missed");
            summary.post_data_misses += 1;
            None
        }
    }
}
