use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};
use transport_tunnel::{Multicast, Tunnel, TunnelError, TunnelSink};
use url::Url;

use super::{RelayTunnel, SignalingError};
use crate::model::{CloseCode, WebSocketState};

/// Opens a WebSocket to the relay and exposes it as a byte tunnel.
///
/// A keepalive ping goes out every `ping_interval`. If a write fails the
/// tunnel reports `Closed(AbnormalClosure)` and its streams end.
pub async fn connect_relay(
    url: Url,
    ping_interval: Option<Duration>,
) -> Result<RelayTunnel, SignalingError> {
    let ready = Multicast::replaying_last();
    let incoming: Multicast<Result<Bytes, TunnelError>> = Multicast::new();
    ready.publish(WebSocketState::Connecting);

    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .map_err(|err| SignalingError::Connect(err.to_string()))?;
    debug!(target = "peer_link::relay", url = %url, "relay websocket connected");
    ready.publish(WebSocketState::Connected);

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
    let closed = Arc::new(ClosedLatch::new(ready.clone(), incoming.clone()));

    let writer_closed = Arc::clone(&closed);
    let writer_handle = tokio::spawn(async move {
        let mut ticker = ping_interval
            .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));
        loop {
            let message = tokio::select! {
                message = send_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
                _ = tick(&mut ticker) => Message::Ping(Vec::new()),
            };
            let is_close = matches!(message, Message::Close(_));
            if let Err(err) = ws_write.send(message).await {
                warn!(target = "peer_link::relay", error = %err, "relay websocket write failed");
                writer_closed.close(CloseCode::AbnormalClosure);
                break;
            }
            if is_close {
                break;
            }
        }
    });

    let reader_closed = Arc::clone(&closed);
    let reader_incoming = incoming.clone();
    let reader_handle = tokio::spawn(async move {
        while let Some(message) = ws_read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    trace!(target = "peer_link::relay", kind = "text", len = text.len(), "ws_in");
                    reader_incoming.publish(Ok(Bytes::from(text)));
                }
                Ok(Message::Binary(data)) => {
                    trace!(target = "peer_link::relay", kind = "binary", len = data.len(), "ws_in");
                    reader_incoming.publish(Ok(Bytes::from(data)));
                }
                Ok(Message::Close(frame)) => {
                    let code = frame
                        .map(|frame| CloseCode::from(u16::from(frame.code)))
                        .unwrap_or(CloseCode::Normal);
                    debug!(target = "peer_link::relay", ?code, "relay closed the websocket");
                    reader_closed.close(code);
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target = "peer_link::relay", error = %err, "relay websocket read failed");
                    reader_incoming.publish(Err(TunnelError::Transport(err.to_string())));
                    reader_closed.close(CloseCode::AbnormalClosure);
                    return;
                }
            }
        }
        reader_closed.close(CloseCode::AbnormalClosure);
    });

    Ok(Tunnel::new(
        url,
        ready.clone(),
        incoming,
        Arc::new(WebSocketSink {
            send_tx,
            ready,
            tasks: Mutex::new(vec![writer_handle, reader_handle]),
        }),
    ))
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Publishes the terminal state exactly once, whichever task notices first.
struct ClosedLatch {
    fired: AtomicBool,
    ready: Multicast<WebSocketState>,
    incoming: Multicast<Result<Bytes, TunnelError>>,
}

impl ClosedLatch {
    fn new(
        ready: Multicast<WebSocketState>,
        incoming: Multicast<Result<Bytes, TunnelError>>,
    ) -> Self {
        Self {
            fired: AtomicBool::new(false),
            ready,
            incoming,
        }
    }

    fn close(&self, code: CloseCode) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ready.publish(WebSocketState::Closed(code));
        self.ready.finish();
        self.incoming.finish();
    }
}

struct WebSocketSink {
    send_tx: mpsc::UnboundedSender<Message>,
    ready: Multicast<WebSocketState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl TunnelSink<Bytes> for WebSocketSink {
    async fn send(&self, message: Bytes) -> Result<(), TunnelError> {
        let text = String::from_utf8(message.to_vec())
            .map_err(|err| TunnelError::Encode(err.to_string()))?;
        self.send_tx
            .send(Message::Text(text))
            .map_err(|_| TunnelError::Closed)
    }

    async fn close(&self) {
        self.ready.publish(WebSocketState::Closing);
        let _ = self.send_tx.send(Message::Close(Some(CloseFrame {
            code: WsCloseCode::Normal,
            reason: "".into(),
        })));
    }
}

impl Drop for WebSocketSink {
    fn drop(&mut self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}
