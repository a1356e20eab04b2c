//! WebSocket transport to a DevTools endpoint.
//!
//! Speaks text frames carrying one JSON value each. The receiver half pumps
//! inbound frames into an unbounded channel; correlation and event dispatch
//! happen one layer up in [`crate::connection`].

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{Error, Result};

/// Inbound frames above this size close the transport.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the transport.
pub struct TransportSender {
    sink: SplitSink<WsStream, Message>,
}

impl TransportSender {
    /// Serializes and sends one JSON value as a text frame.
    pub async fn send(&mut self, value: Value) -> Result<()> {
        let text = serde_json::to_string(&value)?;
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Sends a close frame; errors are ignored since the peer may already be
    /// gone.
    pub async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

/// Read half of the transport; owns the pump loop.
pub struct TransportReceiver {
    stream: SplitStream<WsStream>,
    message_tx: mpsc::UnboundedSender<Value>,
}

impl TransportReceiver {
    /// Pumps inbound frames into the message channel until the peer closes,
    /// the channel consumer goes away, or a frame breaks the size cap.
    pub async fn run(mut self) -> Result<()> {
        while let Some(frame) = self.stream.next().await {
            let text = match frame? {
                Message::Text(text) => {
                    if text.len() > MAX_FRAME_BYTES {
                        return Err(Error::FrameOversize {
                            size: text.len(),
                            limit: MAX_FRAME_BYTES,
                        });
                    }
                    text
                }
                Message::Binary(bytes) => {
                    if bytes.len() > MAX_FRAME_BYTES {
                        return Err(Error::FrameOversize {
                            size: bytes.len(),
                            limit: MAX_FRAME_BYTES,
                        });
                    }
                    String::from_utf8(bytes)
                        .map_err(|e| Error::Protocol(format!("non-UTF8 binary frame: {e}")))?
                }
                Message::Close(_) => break,
                // tungstenite answers pings internally
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            match serde_json::from_str::<Value>(&text) {
                Ok(value) => {
                    if self.message_tx.send(value).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "dropping unparseable frame");
                }
            }
        }
        Ok(())
    }
}

/// Opens the WebSocket and splits it into halves plus the inbound channel.
pub async fn connect(
    ws_url: &str,
    connect_timeout: Duration,
) -> Result<(
    TransportSender,
    TransportReceiver,
    mpsc::UnboundedReceiver<Value>,
)> {
    let (stream, _response) = tokio::time::timeout(connect_timeout, connect_async(ws_url))
        .await
        .map_err(|_| Error::ConnectFailed(format!("timed out connecting to {ws_url}")))?
        .map_err(|e| Error::ConnectFailed(e.to_string()))?;

    let (sink, stream) = stream.split();
    let (message_tx, message_rx) = mpsc::unbounded_channel();

    Ok((
        TransportSender { sink },
        TransportReceiver { stream, message_tx },
        message_rx,
    ))
}
