use std::sync::Arc;

use bytes::Bytes;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use transport_tunnel::{Multicast, Subscription};

use super::message::{FromRelay, IncomingMessage, Notification, RelayFrame, ResponseForRequest};
use super::packer::{Packer, Unpacker};
use super::{RelayTunnel, SignalingError};
use crate::config::SignalingChannelConfig;
use crate::model::{ClientSource, ConnectionSecrets, RtcPrimitive, WebSocketState};

/// Exchanges negotiation primitives with one remote peer through the relay.
///
/// A single pump task decodes relay frames and multicasts them. The primitive
/// and notification streams are both derived from that one stream, so a
/// fatal relay error ends all of them.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

struct Inner {
    transport: RelayTunnel,
    packer: Packer,
    unpacker: Unpacker,
    source: ClientSource,
    config: SignalingChannelConfig,
    incoming: Multicast<Result<IncomingMessage, SignalingError>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}

impl SignalingChannel {
    pub fn new(
        transport: RelayTunnel,
        secrets: &ConnectionSecrets,
        source: ClientSource,
        config: SignalingChannelConfig,
    ) -> Self {
        let incoming = Multicast::new();
        let frames = transport.incoming();
        let pump = tokio::spawn(pump_relay_frames(frames, incoming.clone()));

        Self {
            inner: Arc::new(Inner {
                transport,
                packer: Packer::new(secrets, source),
                unpacker: Unpacker::new(secrets),
                source,
                config,
                incoming,
                pump: Mutex::new(Some(pump)),
            }),
        }
    }

    pub fn source(&self) -> ClientSource {
        self.inner.source
    }

    pub fn ready_states(&self) -> Subscription<WebSocketState> {
        self.inner.transport.ready_states()
    }

    /// Every decoded relay frame, including responses to our own requests.
    pub fn incoming(&self) -> Subscription<Result<IncomingMessage, SignalingError>> {
        self.inner.incoming.subscribe()
    }

    /// Encrypts and sends `primitive` to the remote peer.
    ///
    /// With send confirmation enabled this waits for the relay's response to
    /// this request id and turns a failure response into an error.
    pub async fn send_to_remote(&self, primitive: RtcPrimitive) -> Result<(), SignalingError> {
        let message = self.inner.packer.pack(&primitive)?;
        let request_id = message.request_id.clone();
        let frame = serde_json::to_vec(&message)
            .map(Bytes::from)
            .map_err(|err| SignalingError::Payload(err.to_string()))?;

        if !self.inner.config.require_send_confirmation {
            self.inner.transport.send(frame).await?;
            return Ok(());
        }

        // subscribe before sending so the response cannot slip past
        let mut responses = self.inner.incoming.subscribe();
        self.inner.transport.send(frame).await?;

        let wait_for_response = async {
            while let Some(item) = responses.recv().await {
                match item? {
                    IncomingMessage::FromRelay(FromRelay::Response(response))
                        if response.request_id() == Some(&request_id) =>
                    {
                        return match response {
                            ResponseForRequest::Success(_) => Ok(()),
                            ResponseForRequest::Failure(failure) => Err(failure.into()),
                        };
                    }
                    _ => continue,
                }
            }
            Err(SignalingError::Closed)
        };

        let outcome =
            tokio::time::timeout(self.inner.config.confirmation_timeout, wait_for_response).await;
        match outcome {
            Ok(result) => {
                debug!(
                    target = "peer_link::signaling",
                    request_id = %request_id,
                    method = %primitive.method(),
                    ok = result.is_ok(),
                    "relay answered request"
                );
                result
            }
            Err(_) => Err(SignalingError::SendTimeout(request_id)),
        }
    }

    /// Primitives sent by the remote peer for this connection.
    ///
    /// Messages for another connection id or from our own side are dropped.
    /// A message that fails to decrypt or decode is yielded as an `Err` and
    /// the stream carries on; a fatal relay error is yielded last.
    pub fn primitives_from_remote(&self) -> BoxStream<'static, Result<RtcPrimitive, SignalingError>> {
        let unpacker = self.inner.unpacker.clone();
        let own_source = self.inner.source;
        self.inner
            .incoming
            .subscribe()
            .filter_map(move |item| {
                let primitive = match item {
                    Ok(IncomingMessage::FromRemote(message)) if message.source == own_source => {
                        trace!(
                            target = "peer_link::signaling",
                            request_id = %message.request_id,
                            "ignoring message echoed from our own side"
                        );
                        None
                    }
                    Ok(IncomingMessage::FromRemote(message)) => match unpacker.unpack(&message) {
                        Ok(primitive) => Some(Ok(primitive)),
                        Err(err @ SignalingError::WrongConnectionId { .. }) => {
                            debug!(target = "peer_link::signaling", error = %err, "dropping message");
                            None
                        }
                        Err(err) => {
                            warn!(
                                target = "peer_link::signaling",
                                request_id = %message.request_id,
                                error = %err,
                                "failed to unpack remote message"
                            );
                            Some(Err(err))
                        }
                    },
                    Ok(IncomingMessage::FromRelay(_)) => None,
                    Err(err) => Some(Err(err)),
                };
                future::ready(primitive)
            })
            .boxed()
    }

    /// Relay notifications about the remote client.
    pub fn sip_events(&self) -> BoxStream<'static, Result<Notification, SignalingError>> {
        self.inner
            .incoming
            .subscribe()
            .filter_map(|item| {
                future::ready(match item {
                    Ok(IncomingMessage::FromRelay(FromRelay::Notification(note))) => Some(Ok(note)),
                    Ok(_) => None,
                    Err(err) => Some(Err(err)),
                })
            })
            .boxed()
    }

    pub async fn close(&self) {
        self.inner.transport.close().await;
    }
}

async fn pump_relay_frames(
    mut frames: Subscription<Result<Bytes, transport_tunnel::TunnelError>>,
    incoming: Multicast<Result<IncomingMessage, SignalingError>>,
) {
    while let Some(frame) = frames.recv().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target = "peer_link::signaling", error = %err, "relay transport failed");
                incoming.publish(Err(SignalingError::Transport(err)));
                break;
            }
        };
        match serde_json::from_slice::<RelayFrame>(&bytes) {
            Ok(frame) => {
                incoming.publish(Ok(frame.into()));
            }
            Err(err) => {
                warn!(
                    target = "peer_link::signaling",
                    error = %err,
                    len = bytes.len(),
                    "undecodable relay frame; closing signaling streams"
                );
                incoming.publish(Err(SignalingError::Decode(err.to_string())));
                break;
            }
        }
    }
    incoming.finish();
}
