//! Local control-plane HTTP server.
//!
//! JSON over HTTP/1.1 in front of the capture/replay engine. Binding is
//! refused outright for non-loopback addresses unless `allow_remote` is set,
//! and every mutating endpoint requires the configured `X-CM-Token` via a
//! constant-time compare. Jobs against the same `(endpoint, capture file)`
//! pair are serialized so store writes never interleave.

use std::collections::HashMap;
use std::future::Future;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use cm::{CookieMonster, StoreKey};
use cm_protocol::{CaptureConfig, KeySource, ReplayConfig};

/// Request bodies above this size answer 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Client-closed-request, nginx style; used for cancelled jobs.
const STATUS_CANCELLED: u16 = 499;

pub type CollaboratorFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<Value, String>> + Send + 'a>>;

/// An external capability the control plane fronts but does not implement:
/// session health probes, capture diffing, browser-session management.
pub trait Collaborator: Send + Sync {
    fn handle(&self, request: Value) -> CollaboratorFuture<'_>;
}

/// Optional collaborator endpoints. With none registered the corresponding
/// routes answer 400.
#[derive(Default, Clone)]
pub struct Collaborators {
    pub session_health: Option<Arc<dyn Collaborator>>,
    pub diffing: Option<Arc<dyn Collaborator>>,
    pub browser_session: Option<Arc<dyn Collaborator>>,
}

/// How to run the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` to listen on.
    pub bind: String,
    /// Token required on every POST when set.
    pub api_token: Option<String>,
    /// Permit binding beyond loopback.
    pub allow_remote: bool,
}

struct AppState {
    engine: CookieMonster,
    api_token: Option<String>,
    collaborators: Collaborators,
    job_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// A running control plane.
#[derive(Debug)]
pub struct ControlPlane {
    local_addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ControlPlane {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

/// Validates the bind address, binds, and serves in a background task.
///
/// The loopback check happens before any socket is opened: a refused
/// configuration leaves no listener behind.
pub async fn start(
    config: ServerConfig,
    engine: CookieMonster,
    collaborators: Collaborators,
) -> cm::Result<ControlPlane> {
    let addrs: Vec<SocketAddr> = config
        .bind
        .to_socket_addrs()
        .map_err(|e| cm::Error::ConfigInvalid(format!("bind address '{}': {e}", config.bind)))?
        .collect();
    if addrs.is_empty() {
        return Err(cm::Error::ConfigInvalid(format!(
            "bind address '{}' resolved to nothing",
            config.bind
        )));
    }

    if !config.allow_remote && addrs.iter().any(|addr| !addr.ip().is_loopback()) {
        return Err(cm::Error::NonLoopbackBindRefused(config.bind.clone()));
    }

    let listener = tokio::net::TcpListener::bind(addrs.as_slice()).await?;
    let local_addr = listener.local_addr()?;

    if config.api_token.is_none() {
        warn!("control plane running without an API token");
    }

    let state = Arc::new(AppState {
        engine,
        api_token: config.api_token,
        collaborators,
        job_locks: parking_lot::Mutex::new(HashMap::new()),
    });

    let app = router(state);
    info!(%local_addr, "control plane listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "control plane stopped");
        }
    });

    Ok(ControlPlane { local_addr, handle })
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/capture", post(capture))
        .route("/replay", post(replay))
        .route("/session-health", post(session_health))
        .route("/diff", post(diff))
        .route("/ui/cache-auth", post(cache_auth))
        .route("/ui/check-auth", post(check_auth))
        // Above the enforced cap so over-cap bodies reach our own 413.
        .layer(DefaultBodyLimit::max(8 * MAX_BODY_BYTES))
        .with_state(state)
}

fn envelope(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = json!({"error": {"kind": kind, "message": message}});
    (status, Json(body)).into_response()
}

fn error_response(err: &cm::Error) -> Response {
    envelope(status_for(err), err.kind(), &err.to_string())
}

fn status_for(err: &cm::Error) -> StatusCode {
    // Cancellation may surface from the engine or the CDP layer.
    if err.kind() == "Cancelled" {
        return StatusCode::from_u16(STATUS_CANCELLED).unwrap();
    }

    match err {
        cm::Error::ConfigInvalid(_)
        | cm::Error::EncryptedStoreRequiresKey
        | cm::Error::Json(_) => StatusCode::BAD_REQUEST,
        cm::Error::Unauthorized => StatusCode::UNAUTHORIZED,
        cm::Error::CaptureHostMismatch { .. }
        | cm::Error::DomainNotAllowed(_)
        | cm::Error::PolicyDenied { .. } => StatusCode::FORBIDDEN,
        cm::Error::NoMatchingCapture => StatusCode::NOT_FOUND,
        cm::Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        cm::Error::RequestBodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Token gate for mutating endpoints. Missing or mismatched tokens answer
/// 401 with an empty body; comparison is constant-time.
fn authorize(state: &AppState, headers: &HeaderMap) -> std::result::Result<(), Response> {
    let Some(expected) = &state.api_token else {
        return Ok(());
    };
    let presented = headers
        .get("x-cm-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let matches: bool = expected.as_bytes().ct_eq(presented.as_bytes()).into();
    if matches {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED.into_response())
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> std::result::Result<T, Response> {
    if body.len() > MAX_BODY_BYTES {
        return Err(error_response(&cm::Error::RequestBodyTooLarge(
            MAX_BODY_BYTES,
        )));
    }
    serde_json::from_slice(body)
        .map_err(|e| error_response(&cm::Error::ConfigInvalid(format!("request body: {e}"))))
}

/// One job at a time per `(endpoint, file)`; different files proceed in
/// parallel.
async fn job_guard(
    state: &AppState,
    endpoint: &str,
    file: &Path,
) -> tokio::sync::OwnedMutexGuard<()> {
    let key = format!("{endpoint}:{}", file.display());
    let lock = Arc::clone(
        state
            .job_locks
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
    );
    lock.lock_owned().await
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

async fn capture(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let config: CaptureConfig = match parse_body(&body) {
        Ok(config) => config,
        Err(rejected) => return rejected,
    };

    let _guard = job_guard(&state, "capture", &config.output_file).await;
    match state.engine.capture(&config).await {
        Ok(summary) => Json(serde_json::to_value(summary).unwrap_or_default()).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn replay(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let config: ReplayConfig = match parse_body(&body) {
        Ok(config) => config,
        Err(rejected) => return rejected,
    };

    let _guard = job_guard(&state, "replay", &config.capture_file).await;
    match state.engine.replay(&config).await {
        Ok(result) => Json(serde_json::to_value(result).unwrap_or_default()).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn session_health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let collaborator = state.collaborators.session_health.clone();
    delegate(&state, collaborator, "session-health", &headers, &body).await
}

async fn diff(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> Response {
    let collaborator = state.collaborators.diffing.clone();
    delegate(&state, collaborator, "diff", &headers, &body).await
}

async fn delegate(
    state: &AppState,
    collaborator: Option<Arc<dyn Collaborator>>,
    name: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Response {
    if let Err(denied) = authorize(state, headers) {
        return denied;
    }
    let request: Value = match parse_body(body) {
        Ok(request) => request,
        Err(rejected) => return rejected,
    };

    let Some(collaborator) = collaborator else {
        return error_response(&cm::Error::ConfigInvalid(format!(
            "no {name} collaborator configured"
        )));
    };

    match collaborator.handle(request).await {
        Ok(result) => Json(result).into_response(),
        Err(message) => envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            "CollaboratorFailed",
            &message,
        ),
    }
}

/// `/ui/cache-auth`: the browser-session collaborator launches or attaches
/// to a browser and reports its debug endpoint, then the capture pipeline
/// runs against it.
async fn cache_auth(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let request: Value = match parse_body(&body) {
        Ok(request) => request,
        Err(rejected) => return rejected,
    };

    let Some(collaborator) = state.collaborators.browser_session.clone() else {
        return error_response(&cm::Error::ConfigInvalid(
            "no browser-session collaborator configured".to_string(),
        ));
    };

    let endpoint = match collaborator.handle(request.clone()).await {
        Ok(endpoint) => endpoint,
        Err(message) => {
            return envelope(
                StatusCode::INTERNAL_SERVER_ERROR,
                "CollaboratorFailed",
                &message,
            );
        }
    };

    let mut config: CaptureConfig =
        match serde_json::from_value(request.get("capture").cloned().unwrap_or(Value::Null)) {
            Ok(config) => config,
            Err(e) => {
                return error_response(&cm::Error::ConfigInvalid(format!(
                    "capture config: {e}"
                )));
            }
        };
    if let Some(host) = endpoint.get("browser_host").and_then(Value::as_str) {
        config.browser_host = host.to_string();
    }
    if let Some(port) = endpoint.get("browser_port").and_then(Value::as_u64) {
        config.browser_port = port as u16;
    }

    let _guard = job_guard(&state, "capture", &config.output_file).await;
    match state.engine.capture(&config).await {
        Ok(summary) => Json(serde_json::to_value(summary).unwrap_or_default()).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct CheckAuthRequest {
    capture_file: PathBuf,
    #[serde(default)]
    encryption_key_source: KeySource,
}

/// `/ui/check-auth`: which captures carry auth headers, by name only.
async fn check_auth(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let request: CheckAuthRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(rejected) => return rejected,
    };

    let key = match StoreKey::resolve(&request.encryption_key_source) {
        Ok(key) => key,
        Err(e) => return error_response(&e),
    };
    let (records, stats) = match cm::load_all(&request.capture_file, key.as_ref()) {
        Ok(loaded) => loaded,
        Err(e) => return error_response(&e),
    };

    let summaries = cm::summarize(&records);
    Json(json!({
        "records": summaries,
        "corrupt_lines": stats.corrupt_lines,
        "auth_failures": stats.auth_failures,
    }))
    .into_response()
}
