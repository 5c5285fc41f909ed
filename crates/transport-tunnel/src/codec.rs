use bytes::Bytes;

use crate::TunnelError;

/// Turns one outgoing message into the frames written to a raw tunnel.
pub trait Encoder: Send + Sync + 'static {
    type Item: Send + 'static;

    fn encode(&self, item: Self::Item) -> Result<Vec<Bytes>, TunnelError>;
}

/// Turns raw frames back into messages.
///
/// Returning `Ok(None)` means the frame was consumed without completing a
/// message yet, e.g. one chunk of a larger payload.
pub trait Decoder: Send + 'static {
    type Item: Clone + Send + 'static;

    fn decode(&mut self, frame: Bytes) -> Result<Option<Self::Item>, TunnelError>;
}
