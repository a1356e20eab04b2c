//! JSON-RPC connection layer for the DevTools protocol.
//!
//! Implements request/response correlation on top of the transport:
//! - Generating monotonically increasing request ids
//! - Correlating responses with pending calls via oneshot channels
//! - Fanning events out to per-event bounded queues
//!
//! A single background reader dispatches every inbound frame: frames with an
//! `id` resolve the matching pending call; frames with a `method` go to the
//! subscribers of that event; anything else is counted and dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex as ParkingLotMutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::error::{Error, Result};
use crate::queue::{EVENT_QUEUE_CAPACITY, EventQueue};
use crate::transport::{self, MAX_FRAME_BYTES};

/// Outbound protocol call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdpRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

/// Error payload inside a response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdpErrorPayload {
    #[serde(default)]
    pub code: i64,
    pub message: String,
}

/// Why the connection stopped accepting traffic.
#[derive(Debug, Clone)]
enum CloseReason {
    /// Deliberate close from our side.
    Cancelled,
    /// Peer closed or the pump ended.
    PeerGone,
    /// A frame exceeded the transport cap.
    Oversize { size: usize },
    /// Transport-level failure.
    Failed(String),
}

impl CloseReason {
    fn to_error(&self) -> Error {
        match self {
            CloseReason::Cancelled => Error::Cancelled,
            CloseReason::PeerGone => Error::ChannelClosed,
            CloseReason::Oversize { size } => Error::FrameOversize {
                size: *size,
                limit: MAX_FRAME_BYTES,
            },
            CloseReason::Failed(message) => Error::Protocol(message.clone()),
        }
    }
}

struct Inner {
    last_id: AtomicU64,
    /// Pending calls keyed by request id.
    pending: TokioMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    /// Event queues keyed by event name.
    subscriptions: ParkingLotMutex<HashMap<String, Vec<Arc<EventQueue>>>>,
    outbound_tx: mpsc::UnboundedSender<Value>,
    closed: ParkingLotMutex<Option<CloseReason>>,
    /// Tells the writer task to send a close frame and exit.
    close_signal: Arc<Notify>,
    unknown_frames: AtomicU64,
}

impl Inner {
    fn closed_error(&self) -> Option<Error> {
        self.closed.lock().as_ref().map(CloseReason::to_error)
    }

    async fn shutdown(&self, reason: CloseReason) {
        {
            let mut closed = self.closed.lock();
            if closed.is_some() {
                return;
            }
            *closed = Some(reason.clone());
        }

        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(reason.to_error()));
        }

        for queue in self.subscriptions.lock().values().flatten() {
            queue.close();
        }

        self.close_signal.notify_one();
    }

    async fn dispatch(&self, frame: Value) {
        if let Some(id) = frame.get("id").and_then(Value::as_u64) {
            let Some(tx) = self.pending.lock().await.remove(&id) else {
                tracing::debug!(id, "response for unknown call id");
                self.unknown_frames.fetch_add(1, Ordering::Relaxed);
                return;
            };

            let result = match frame.get("error") {
                Some(error) => {
                    match serde_json::from_value::<CdpErrorPayload>(error.clone()) {
                        Ok(payload) => Err(Error::Cdp {
                            code: payload.code,
                            message: payload.message,
                        }),
                        Err(_) => Err(Error::Protocol(format!("malformed error payload: {error}"))),
                    }
                }
                None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
            };

            let _ = tx.send(result);
        } else if let Some(method) = frame.get("method").and_then(Value::as_str) {
            let params = frame.get("params").cloned().unwrap_or(Value::Null);
            let subscriptions = self.subscriptions.lock();
            match subscriptions.get(method) {
                Some(queues) if !queues.is_empty() => {
                    for queue in queues {
                        queue.push(params.clone());
                    }
                }
                _ => {
                    tracing::trace!(method, "event with no subscriber");
                }
            }
        } else {
            self.unknown_frames.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("dropping frame that is neither response nor event");
        }
    }
}

/// A live CDP connection.
///
/// `call` is serialized: one outstanding protocol call at a time. Events
/// flow independently of calls through subscriber queues.
pub struct CdpConnection {
    inner: Arc<Inner>,
    call_gate: TokioMutex<()>,
}

impl CdpConnection {
    /// Connects to a `webSocketDebuggerUrl` and starts the background reader.
    pub async fn connect(ws_url: &str, connect_timeout: Duration) -> Result<Self> {
        let (mut sender, receiver, mut message_rx) =
            transport::connect(ws_url, connect_timeout).await?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
        let close_signal = Arc::new(Notify::new());

        let inner = Arc::new(Inner {
            last_id: AtomicU64::new(0),
            pending: TokioMutex::new(HashMap::new()),
            subscriptions: ParkingLotMutex::new(HashMap::new()),
            outbound_tx,
            closed: ParkingLotMutex::new(None),
            close_signal: Arc::clone(&close_signal),
            unknown_frames: AtomicU64::new(0),
        });

        // Writer: drains the outbound queue until close or channel end, then
        // sends a close frame.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_signal.notified() => break,
                    value = outbound_rx.recv() => {
                        let Some(value) = value else { break };
                        if let Err(e) = sender.send(value).await {
                            tracing::debug!(error = %e, "transport write failed");
                            break;
                        }
                    }
                }
            }
            sender.close().await;
        });

        // Reader pump: ends the dispatch loop by dropping message_tx.
        let pump = tokio::spawn(receiver.run());

        // Dispatch loop: correlates responses and fans out events, then
        // settles every pending call with the pump's outcome.
        let dispatch_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(frame) = message_rx.recv().await {
                dispatch_inner.dispatch(frame).await;
            }

            let reason = match pump.await {
                Ok(Ok(())) => CloseReason::PeerGone,
                Ok(Err(Error::FrameOversize { size, .. })) => CloseReason::Oversize { size },
                Ok(Err(e)) => CloseReason::Failed(e.to_string()),
                Err(join) => CloseReason::Failed(join.to_string()),
            };
            dispatch_inner.shutdown(reason).await;
        });

        Ok(Self {
            inner,
            call_gate: TokioMutex::new(()),
        })
    }

    /// Issues one protocol call and awaits its response.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        request_timeout: Duration,
    ) -> Result<Value> {
        let _gate = self.call_gate.lock().await;

        if let Some(error) = self.inner.closed_error() {
            return Err(error);
        }

        let id = self.inner.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(id, method, "sending CDP call");

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let request = CdpRequest {
            id,
            method: method.to_string(),
            params,
        };

        if self
            .inner
            .outbound_tx
            .send(serde_json::to_value(&request)?)
            .is_err()
        {
            self.inner.pending.lock().await.remove(&id);
            return Err(self.inner.closed_error().unwrap_or(Error::ChannelClosed));
        }

        match tokio::time::timeout(request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.inner.closed_error().unwrap_or(Error::ChannelClosed)),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                Err(Error::CallTimeout {
                    method: method.to_string(),
                    ms: request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Subscribes to an event by protocol name. Every matching event frame's
    /// `params` is pushed to the returned queue; the reader never blocks on
    /// a slow consumer (the queue drops its oldest entry when full).
    pub fn subscribe(&self, event_name: &str) -> Arc<EventQueue> {
        let queue = Arc::new(EventQueue::new(EVENT_QUEUE_CAPACITY));
        self.inner
            .subscriptions
            .lock()
            .entry(event_name.to_string())
            .or_default()
            .push(Arc::clone(&queue));
        queue
    }

    /// Frames that were neither a known response nor an event.
    pub fn unknown_frames(&self) -> u64 {
        self.inner.unknown_frames.load(Ordering::Relaxed)
    }

    /// Closes the connection. In-flight calls are released with `Cancelled`;
    /// subscriber queues drain and end.
    pub async fn close(&self) {
        self.inner.shutdown(CloseReason::Cancelled).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    /// Minimal in-process CDP endpoint: answers every call via `respond`,
    /// then streams `events` after the first call arrives.
    async fn fake_cdp_server(
        respond: fn(u64, &str) -> Value,
        events: Vec<Value>,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (mut tx, mut rx) = ws.split();

            let mut sent_events = false;
            while let Some(Ok(frame)) = rx.next().await {
                let Message::Text(text) = frame else { continue };
                let request: Value = serde_json::from_str(&text).unwrap();
                let id = request["id"].as_u64().unwrap();
                let method = request["method"].as_str().unwrap();

                let response = respond(id, method);
                tx.send(Message::Text(response.to_string())).await.unwrap();

                if !sent_events {
                    sent_events = true;
                    for event in &events {
                        tx.send(Message::Text(event.to_string())).await.unwrap();
                    }
                }
            }
        });

        format!("ws://{addr}/devtools/page/1")
    }

    #[tokio::test]
    async fn call_round_trip() {
        let url = fake_cdp_server(|id, _| json!({"id": id, "result": {"ok": true}}), vec![]).await;
        let conn = CdpConnection::connect(&url, Duration::from_secs(5))
            .await
            .unwrap();

        let result = conn
            .call("Network.enable", json!({}), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);

        conn.close().await;
    }

    #[tokio::test]
    async fn call_ids_increase() {
        let url = fake_cdp_server(|id, _| json!({"id": id, "result": {"echo": id}}), vec![]).await;
        let conn = CdpConnection::connect(&url, Duration::from_secs(5))
            .await
            .unwrap();

        for expected in 1u64..=3 {
            let result = conn
                .call("Probe.next", json!({}), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(result["echo"], expected);
        }

        conn.close().await;
    }

    #[tokio::test]
    async fn error_response_surfaces_message() {
        let url = fake_cdp_server(
            |id, _| json!({"id": id, "error": {"code": -32601, "message": "method missing"}}),
            vec![],
        )
        .await;
        let conn = CdpConnection::connect(&url, Duration::from_secs(5))
            .await
            .unwrap();

        let err = conn
            .call("Bogus.method", json!({}), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            Error::Cdp { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method missing");
            }
            other => panic!("expected Cdp error, got {other:?}"),
        }

        conn.close().await;
    }

    #[tokio::test]
    async fn events_reach_subscriber() {
        let url = fake_cdp_server(
            |id, _| json!({"id": id, "result": {}}),
            vec![
                json!({"method": "Network.requestWillBeSent", "params": {"requestId": "a"}}),
                json!({"method": "Network.requestWillBeSent", "params": {"requestId": "b"}}),
                json!({"method": "Other.event", "params": {}}),
            ],
        )
        .await;

        let conn = CdpConnection::connect(&url, Duration::from_secs(5))
            .await
            .unwrap();
        let queue = conn.subscribe("Network.requestWillBeSent");

        conn.call("Network.enable", json!({}), Duration::from_secs(5))
            .await
            .unwrap();

        let first = queue.pop().await.unwrap();
        assert_eq!(first["requestId"], "a");
        let second = queue.pop().await.unwrap();
        assert_eq!(second["requestId"], "b");

        conn.close().await;
    }

    #[tokio::test]
    async fn call_timeout_fires() {
        // Server that never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (_tx, mut rx) = ws.split();
            while rx.next().await.is_some() {}
        });

        let conn = CdpConnection::connect(&format!("ws://{addr}/"), Duration::from_secs(5))
            .await
            .unwrap();

        let err = conn
            .call("Network.enable", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {err:?}");

        conn.close().await;
    }

    #[tokio::test]
    async fn close_releases_pending_with_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let (_tx, mut rx) = ws.split();
            while rx.next().await.is_some() {}
        });

        let conn = Arc::new(
            CdpConnection::connect(&format!("ws://{addr}/"), Duration::from_secs(5))
                .await
                .unwrap(),
        );

        let caller = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                conn.call("Network.enable", json!({}), Duration::from_secs(30))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        conn.close().await;

        let err = caller.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got {err:?}");
    }
}
