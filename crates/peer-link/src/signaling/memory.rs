//! In-process relay that routes frames between a wallet and an extension endpoint.
//!
//! It answers requests the way the real relay does: a confirmation to the
//! sender once the frame was forwarded, or a missing-client error when the
//! other side is not connected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};
use transport_tunnel::{Multicast, Tunnel, TunnelError, TunnelSink};
use url::Url;

use super::message::{Notification, RelayFrame, RpcMessage};
use super::RelayTunnel;
use crate::model::{ClientSource, CloseCode, WebSocketState};

#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

struct RelayState {
    sides: HashMap<ClientSource, Side>,
    confirm: bool,
}

impl Default for RelayState {
    fn default() -> Self {
        Self {
            sides: HashMap::new(),
            confirm: true,
        }
    }
}

struct Side {
    ready: Multicast<WebSocketState>,
    incoming: Multicast<Result<Bytes, TunnelError>>,
    connected: bool,
}

impl Side {
    fn deliver(&self, frame: &RelayFrame) {
        match serde_json::to_vec(frame) {
            Ok(bytes) => {
                self.incoming.publish(Ok(Bytes::from(bytes)));
            }
            Err(err) => debug!(target = "peer_link::relay", error = %err, "failed to encode frame"),
        }
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects `source` to the relay, replacing any earlier endpoint for it.
    pub fn endpoint(&self, source: ClientSource) -> RelayTunnel {
        let ready = Multicast::replaying_last();
        let incoming = Multicast::new();
        ready.publish(WebSocketState::Connected);

        let mut state = self.state.lock();
        if let Some(previous) = state.sides.insert(
            source,
            Side {
                ready: ready.clone(),
                incoming: incoming.clone(),
                connected: true,
            },
        ) {
            previous.ready.publish(WebSocketState::Closed(CloseCode::GoingAway));
            previous.ready.finish();
            previous.incoming.finish();
        }
        if let Some(remote) = state.sides.get(&source.opposite()).filter(|side| side.connected) {
            remote.deliver(&RelayFrame::RemoteClientJustConnected);
        }
        drop(state);

        let mut url = Url::parse("memory://relay").expect("static relay url is valid");
        url.set_path(source.as_str());
        Tunnel::new(
            url,
            ready,
            incoming,
            Arc::new(MemoryRelaySink {
                relay: self.clone(),
                source,
            }),
        )
    }

    /// Drops `source` from the relay and tells the other side.
    pub fn disconnect(&self, source: ClientSource) {
        let mut state = self.state.lock();
        let Some(side) = state.sides.get_mut(&source) else {
            return;
        };
        if !side.connected {
            return;
        }
        side.connected = false;
        side.ready.publish(WebSocketState::Closing);
        side.ready.publish(WebSocketState::Closed(CloseCode::Normal));
        side.ready.finish();
        side.incoming.finish();
        if let Some(remote) = state.sides.get(&source.opposite()).filter(|side| side.connected) {
            remote.deliver(&RelayFrame::RemoteClientDisconnected);
        }
    }

    /// Whether forwarded requests get a confirmation. On by default.
    pub fn set_confirmations(&self, confirm: bool) {
        self.state.lock().confirm = confirm;
    }

    pub fn notify(&self, source: ClientSource, notification: Notification) {
        let frame = match notification {
            Notification::RemoteClientJustConnected => RelayFrame::RemoteClientJustConnected,
            Notification::RemoteClientIsAlreadyConnected => RelayFrame::RemoteClientIsAlreadyConnected,
            Notification::RemoteClientDisconnected => RelayFrame::RemoteClientDisconnected,
        };
        if let Some(side) = self.state.lock().sides.get(&source) {
            side.deliver(&frame);
        }
    }

    /// Hands `source` an arbitrary frame, as if the relay had sent it.
    pub fn inject_raw(&self, source: ClientSource, frame: Bytes) {
        if let Some(side) = self.state.lock().sides.get(&source) {
            side.incoming.publish(Ok(frame));
        }
    }

    fn route(&self, source: ClientSource, frame: Bytes) -> Result<(), TunnelError> {
        let state = self.state.lock();
        let Some(sender) = state.sides.get(&source).filter(|side| side.connected) else {
            return Err(TunnelError::Closed);
        };

        let message: RpcMessage = match serde_json::from_slice(&frame) {
            Ok(message) => message,
            Err(err) => {
                sender.deliver(&RelayFrame::InvalidMessageError {
                    error: Value::String(err.to_string()),
                    data: Value::Null,
                });
                return Ok(());
            }
        };
        let request_id = message.request_id.clone();

        match state.sides.get(&source.opposite()).filter(|side| side.connected) {
            Some(remote) => {
                trace!(
                    target = "peer_link::relay",
                    from = %source,
                    request_id = %request_id,
                    method = %message.method,
                    "forwarding"
                );
                remote.deliver(&RelayFrame::RemoteData {
                    request_id: request_id.clone(),
                    data: message,
                });
                if state.confirm {
                    sender.deliver(&RelayFrame::Confirmation { request_id });
                }
            }
            None => sender.deliver(&RelayFrame::MissingRemoteClientError { request_id }),
        }
        Ok(())
    }
}

struct MemoryRelaySink {
    relay: MemoryRelay,
    source: ClientSource,
}

#[async_trait]
impl TunnelSink<Bytes> for MemoryRelaySink {
    async fn send(&self, message: Bytes) -> Result<(), TunnelError> {
        self.relay.route(self.source, message)
    }

    async fn close(&self) {
        self.relay.disconnect(self.source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closing_an_endpoint_notifies_the_other_side() {
        let relay = MemoryRelay::new();
        let wallet = relay.endpoint(ClientSource::Wallet);
        let extension = relay.endpoint(ClientSource::Extension);
        let mut wallet_frames = wallet.incoming();
        let mut extension_states = extension.ready_states();
        assert_eq!(extension_states.recv().await, Some(WebSocketState::Connected));

        extension.close().await;
        assert_eq!(extension_states.recv().await, Some(WebSocketState::Closing));
        assert_eq!(
            extension_states.recv().await,
            Some(WebSocketState::Closed(CloseCode::Normal))
        );

        let frame = wallet_frames.recv().await.expect("frame").expect("ok frame");
        let frame: RelayFrame = serde_json::from_slice(&frame).expect("relay frame");
        assert_eq!(frame, RelayFrame::RemoteClientDisconnected);
        assert_eq!(
            extension.send(Bytes::from_static(b"{}")).await,
            Err(TunnelError::Closed)
        );
    }

    #[tokio::test]
    async fn garbage_from_a_client_gets_an_invalid_message_error() {
        let relay = MemoryRelay::new();
        let wallet = relay.endpoint(ClientSource::Wallet);
        let mut frames = wallet.incoming();
        wallet
            .send(Bytes::from_static(b"not json"))
            .await
            .expect("relay accepts bytes");
        let frame = frames.recv().await.expect("frame").expect("ok frame");
        let frame: RelayFrame = serde_json::from_slice(&frame).expect("relay frame");
        assert!(matches!(frame, RelayFrame::InvalidMessageError { .. }));
    }
}
