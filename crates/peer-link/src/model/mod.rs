//! Identifiers, secrets, negotiation primitives and state enums shared across the crate.

mod ids;
mod primitive;
mod secrets;
mod state;

pub use ids::{DataChannelId, MessageId, PeerConnectionId, RequestId};
pub use primitive::{
    Answer, ClientSource, IceCandidate, NegotiationRole, Offer, RpcMethod, RtcPrimitive,
};
pub use secrets::{ConnectionPassword, ConnectionSecrets, EncryptionKey, SecretError};
pub use state::{
    CloseCode, DataChannelState, NegotiationState, PeerConnectionState, WebSocketState,
};
