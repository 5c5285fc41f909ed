//! Application messages over a data channel, chunked and optionally confirmed.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};
use transport_tunnel::{Decoder, Encoder, Subscription, Tunnel, TunnelError};

use crate::chunk::{
    self, ChunkConfig, ChunkError, ChunkReceiver, ChunkedMessagePackage, ContentHash,
    MessageSplitter, ReceiveError, ReceiveErrorReason, Received,
};
use crate::config::{DataChannelConfig, DEFAULT_CONFIRMATION_TIMEOUT};
use crate::coordinator::LinkError;
use crate::model::{DataChannelId, DataChannelState, MessageId};
use crate::peer::DataChannelTunnel;

/// Content hashes remembered for duplicate suppression.
const DEDUPE_WINDOW: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    FireAndForget,
    /// `send_message` returns once the remote confirms the message.
    AwaitConfirmation { timeout: Duration },
}

impl DeliveryPolicy {
    pub fn confirmed() -> Self {
        DeliveryPolicy::AwaitConfirmation {
            timeout: DEFAULT_CONFIRMATION_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub channel: DataChannelConfig,
    pub chunk: ChunkConfig,
    pub delivery: DeliveryPolicy,
    /// Reply with a receive confirmation for every assembled message.
    pub auto_confirm: bool,
    /// Drop messages whose content hash was seen recently.
    pub dedupe: bool,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            channel: DataChannelConfig::default(),
            chunk: *chunk::runtime_config(),
            delivery: DeliveryPolicy::FireAndForget,
            auto_confirm: true,
            dedupe: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound<T> {
    Message { message_id: MessageId, message: T },
    Confirmation(MessageId),
    ReceiveError(ReceiveError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<T> {
    Message { message_id: MessageId, message: T },
    /// The remote assembled one of our messages.
    Confirmation(MessageId),
    /// The remote failed to assemble one of our messages.
    ReceiveError(ReceiveError),
    /// A message from the remote failed validation.
    AssemblyFailed {
        message_id: MessageId,
        error: ChunkError,
    },
}

/// Serializes to JSON and splits into chunk packages.
pub struct ChunkEncoder<T> {
    splitter: MessageSplitter,
    _marker: PhantomData<fn(T)>,
}

impl<T> ChunkEncoder<T> {
    pub fn new(chunk_size_limit: usize) -> Self {
        Self {
            splitter: MessageSplitter::new(chunk_size_limit),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + Send + 'static> Encoder for ChunkEncoder<T> {
    type Item = Outbound<T>;

    fn encode(&self, item: Outbound<T>) -> Result<Vec<Bytes>, TunnelError> {
        let packages = match item {
            Outbound::Message {
                message_id,
                message,
            } => {
                let payload = serde_json::to_vec(&message)
                    .map_err(|err| TunnelError::Encode(err.to_string()))?;
                let packages = self.splitter.split(&payload, message_id.clone());
                trace!(
                    target = "peer_link::messaging",
                    message_id = %message_id,
                    bytes = payload.len(),
                    packages = packages.len(),
                    "encoded message"
                );
                packages
            }
            Outbound::Confirmation(message_id) => {
                vec![ChunkedMessagePackage::confirmation(message_id)]
            }
            Outbound::ReceiveError(error) => vec![ChunkedMessagePackage::ReceiveMessageError(error)],
        };
        packages
            .iter()
            .map(|package| {
                package
                    .to_json()
                    .map_err(|err| TunnelError::Encode(err.to_string()))
            })
            .collect()
    }
}

/// Reassembles chunk packages and deserializes completed messages.
pub struct ChunkDecoder<T> {
    receiver: ChunkReceiver,
    dedupe: Option<RecentHashes>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ChunkDecoder<T> {
    pub fn new(config: ChunkConfig, dedupe: bool) -> Self {
        Self {
            receiver: ChunkReceiver::new(config),
            dedupe: dedupe.then(RecentHashes::default),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned + Clone + Send + 'static> Decoder for ChunkDecoder<T> {
    type Item = Inbound<T>;

    fn decode(&mut self, frame: Bytes) -> Result<Option<Inbound<T>>, TunnelError> {
        let package = ChunkedMessagePackage::from_json(&frame)
            .map_err(|err| TunnelError::Decode(err.to_string()))?;
        match self.receiver.ingest(package, Instant::now()) {
            Received::Pending => Ok(None),
            Received::Confirmation(message_id) => Ok(Some(Inbound::Confirmation(message_id))),
            Received::RemoteError(error) => Ok(Some(Inbound::ReceiveError(error))),
            Received::Failed { message_id, error } => {
                warn!(
                    target = "peer_link::messaging",
                    message_id = %message_id,
                    error = %error,
                    "message failed validation"
                );
                Ok(Some(Inbound::AssemblyFailed { message_id, error }))
            }
            Received::Assembled {
                message_id,
                message,
            } => {
                if let Some(recent) = self.dedupe.as_mut() {
                    if !recent.insert(message.hash) {
                        debug!(
                            target = "peer_link::messaging",
                            message_id = %message_id,
                            "dropping duplicate message"
                        );
                        return Ok(None);
                    }
                }
                let message = serde_json::from_slice(&message.content).map_err(|err| {
                    TunnelError::Decode(format!("message {message_id}: {err}"))
                })?;
                Ok(Some(Inbound::Message {
                    message_id,
                    message,
                }))
            }
        }
    }
}

#[derive(Default)]
struct RecentHashes {
    seen: HashSet<ContentHash>,
    order: VecDeque<ContentHash>,
}

impl RecentHashes {
    /// Returns `false` if `hash` was already present.
    fn insert(&mut self, hash: ContentHash) -> bool {
        if !self.seen.insert(hash) {
            return false;
        }
        self.order.push_back(hash);
        if self.order.len() > DEDUPE_WINDOW {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

pub type TypedChannelTunnel<T> = Tunnel<DataChannelId, DataChannelState, Inbound<T>, Outbound<T>>;

/// Typed, chunked view of a data channel.
#[derive(Clone)]
pub struct MessageTunnel<T> {
    tunnel: TypedChannelTunnel<T>,
    delivery: DeliveryPolicy,
}

impl<T> MessageTunnel<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Wraps `raw` in a typed tunnel.
    ///
    /// The returned future answers inbound messages until the channel closes.
    /// Exactly one of them may run per channel, otherwise the remote receives
    /// every confirmation more than once.
    pub(crate) fn over(
        raw: &DataChannelTunnel,
        options: &TunnelOptions,
    ) -> (Self, impl Future<Output = ()> + Send + 'static) {
        let tunnel = raw.with_codec(
            ChunkEncoder::new(options.chunk.chunk_size_limit),
            ChunkDecoder::new(options.chunk, options.dedupe),
        );
        let responder = respond_to_inbound(tunnel.clone(), tunnel.incoming(), options.auto_confirm);
        let view = Self {
            tunnel,
            delivery: options.delivery,
        };
        (view, responder)
    }

    /// The same tunnel with a different delivery policy.
    pub fn with_delivery(&self, delivery: DeliveryPolicy) -> Self {
        Self {
            tunnel: self.tunnel.clone(),
            delivery,
        }
    }

    pub fn delivery(&self) -> DeliveryPolicy {
        self.delivery
    }

    pub fn id(&self) -> DataChannelId {
        *self.tunnel.id()
    }

    pub fn tunnel(&self) -> &TypedChannelTunnel<T> {
        &self.tunnel
    }

    pub fn ready_states(&self) -> Subscription<DataChannelState> {
        self.tunnel.ready_states()
    }

    pub fn ready_state(&self) -> Option<DataChannelState> {
        self.tunnel.ready_state()
    }

    pub fn incoming(&self) -> Subscription<Result<Inbound<T>, TunnelError>> {
        self.tunnel.incoming()
    }

    /// Sends `message` under a fresh id, honouring the delivery policy.
    pub async fn send_message(&self, message: T) -> Result<MessageId, LinkError> {
        let message_id = MessageId::random();
        let outbound = Outbound::Message {
            message_id: message_id.clone(),
            message,
        };
        let timeout = match self.delivery {
            DeliveryPolicy::FireAndForget => {
                self.tunnel.send(outbound).await?;
                return Ok(message_id);
            }
            DeliveryPolicy::AwaitConfirmation { timeout } => timeout,
        };

        let mut inbound = self.tunnel.incoming();
        self.tunnel.send(outbound).await?;
        let wait_for_confirmation = async {
            while let Some(item) = inbound.recv().await {
                match item {
                    Ok(Inbound::Confirmation(id)) if id == message_id => return Ok(()),
                    Ok(Inbound::ReceiveError(error)) if error.message_id == message_id => {
                        return Err(LinkError::RemoteReceiveError(message_id.clone()))
                    }
                    _ => continue,
                }
            }
            Err(LinkError::Tunnel(TunnelError::Closed))
        };
        let outcome = tokio::time::timeout(timeout, wait_for_confirmation).await;
        match outcome {
            Ok(result) => result.map(|()| message_id),
            Err(_) => Err(LinkError::ConfirmationTimeout(message_id)),
        }
    }

    pub async fn close(&self) {
        self.tunnel.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.tunnel.is_closed()
    }
}

/// Confirms assembled messages and reports integrity failures back to the sender.
async fn respond_to_inbound<T>(
    tunnel: TypedChannelTunnel<T>,
    mut inbound: Subscription<Result<Inbound<T>, TunnelError>>,
    auto_confirm: bool,
) where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    while let Some(item) = inbound.recv().await {
        let reply = match item {
            Ok(Inbound::Message { message_id, .. }) if auto_confirm => {
                Outbound::Confirmation(message_id)
            }
            Ok(Inbound::AssemblyFailed { message_id, error }) if error.is_integrity_failure() => {
                Outbound::ReceiveError(ReceiveError {
                    message_id,
                    error: ReceiveErrorReason::MessageHashesMismatch,
                })
            }
            _ => continue,
        };
        if let Err(err) = tunnel.send(reply).await {
            debug!(target = "peer_link::messaging", error = %err, "failed to answer inbound message");
            if err == TunnelError::Closed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    fn decode_all(decoder: &mut ChunkDecoder<Note>, frames: Vec<Bytes>) -> Vec<Inbound<Note>> {
        frames
            .into_iter()
            .filter_map(|frame| decoder.decode(frame).expect("decode"))
            .collect()
    }

    #[test]
    fn messages_survive_chunking() {
        let encoder = ChunkEncoder::<Note>::new(8);
        let mut decoder = ChunkDecoder::<Note>::new(ChunkConfig::default(), false);
        let note = Note {
            text: "a message longer than one chunk".into(),
        };
        let frames = encoder
            .encode(Outbound::Message {
                message_id: MessageId::from("m1"),
                message: note.clone(),
            })
            .expect("encode");
        assert!(frames.len() > 2);
        assert_eq!(
            decode_all(&mut decoder, frames),
            vec![Inbound::Message {
                message_id: MessageId::from("m1"),
                message: note,
            }]
        );
    }

    #[test]
    fn duplicates_are_dropped_when_enabled() {
        let encoder = ChunkEncoder::<Note>::new(64);
        let mut decoder = ChunkDecoder::<Note>::new(ChunkConfig::default(), true);
        let note = Note { text: "twice".into() };
        let mut delivered = Vec::new();
        for id in ["a", "b"] {
            let frames = encoder
                .encode(Outbound::Message {
                    message_id: MessageId::from(id),
                    message: note.clone(),
                })
                .expect("encode");
            delivered.extend(decode_all(&mut decoder, frames));
        }
        assert_eq!(delivered.len(), 1);
    }

    #[test]
    fn corrupted_chunk_is_reported_per_message() {
        let encoder = ChunkEncoder::<Note>::new(4);
        let mut decoder = ChunkDecoder::<Note>::new(ChunkConfig::default(), false);
        let frames = encoder
            .encode(Outbound::Message {
                message_id: MessageId::from("bad"),
                message: Note { text: "payload".into() },
            })
            .expect("encode");

        let mut inbound = Vec::new();
        for frame in frames {
            let package = ChunkedMessagePackage::from_json(&frame).expect("package");
            let frame = match package {
                ChunkedMessagePackage::Chunk(mut chunk) if chunk.chunk_index == 1 => {
                    let mut data = chunk.chunk_data.to_vec();
                    data[0] ^= 0xff;
                    chunk.chunk_data = Bytes::from(data);
                    ChunkedMessagePackage::Chunk(chunk).to_json().expect("json")
                }
                _ => frame,
            };
            inbound.extend(decoder.decode(frame).expect("decode"));
        }
        assert!(matches!(
            inbound.as_slice(),
            [Inbound::AssemblyFailed { error: ChunkError::HashMismatch { .. }, .. }]
        ));
    }

    #[test]
    fn confirmations_pass_through() {
        let encoder = ChunkEncoder::<Note>::new(64);
        let mut decoder = ChunkDecoder::<Note>::new(ChunkConfig::default(), false);
        let frames = encoder
            .encode(Outbound::Confirmation(MessageId::from("ok")))
            .expect("encode");
        assert_eq!(
            decode_all(&mut decoder, frames),
            vec![Inbound::Confirmation(MessageId::from("ok"))]
        );
    }

    #[test]
    fn garbage_frame_is_a_decode_error() {
        let mut decoder = ChunkDecoder::<Note>::new(ChunkConfig::default(), false);
        assert!(matches!(
            decoder.decode(Bytes::from_static(b"{\"packageType\":\"nope\"}")),
            Err(TunnelError::Decode(_))
        ));
    }
}
