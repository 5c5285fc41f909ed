//! Encrypted exchange of negotiation primitives through a relay server.

mod channel;
mod encryption;
pub mod memory;
mod message;
mod packer;
mod websocket;

use thiserror::Error;
use transport_tunnel::{RawTunnel, TunnelError};
use url::Url;

use crate::model::{PeerConnectionId, RequestId, WebSocketState};

pub use channel::SignalingChannel;
pub use encryption::{decrypt, encrypt, EncryptionError};
pub use message::{
    FromRelay, IncomingMessage, Notification, RelayFrame, RequestFailure, ResponseForRequest,
    RpcMessage,
};
pub use packer::{Packer, Unpacker};
pub use websocket::connect_relay;

/// Duplex byte tunnel to the relay, identified by its URL.
pub type RelayTunnel = RawTunnel<Url, WebSocketState>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error("message for connection {got} but this is connection {expected}")]
    WrongConnectionId {
        expected: PeerConnectionId,
        got: PeerConnectionId,
    },
    #[error("invalid primitive payload: {0}")]
    Payload(String),
    #[error("undecodable relay frame: {0}")]
    Decode(String),
    #[error("relay transport: {0}")]
    Transport(#[from] TunnelError),
    #[error("relay did not confirm request {0} in time")]
    SendTimeout(RequestId),
    #[error("no remote client connected to receive request {0}")]
    NoRemoteClientToTalkTo(RequestId),
    #[error("relay rejected request {request_id}: {reason}")]
    ValidationError { request_id: RequestId, reason: String },
    #[error("relay reported an invalid message: {reason}")]
    InvalidMessageError { reason: String },
    #[error("failed to connect to relay: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    Closed,
}

impl SignalingError {
    /// Errors that end the signaling channel rather than a single message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SignalingError::Decode(_) | SignalingError::Transport(_) | SignalingError::Closed
        )
    }
}

impl From<RequestFailure> for SignalingError {
    fn from(failure: RequestFailure) -> Self {
        match failure {
            RequestFailure::NoRemoteClientToTalkTo(request_id) => {
                SignalingError::NoRemoteClientToTalkTo(request_id)
            }
            RequestFailure::ValidationError { request_id, reason } => {
                SignalingError::ValidationError { request_id, reason }
            }
            RequestFailure::InvalidMessageError { reason, .. } => {
                SignalingError::InvalidMessageError { reason }
            }
        }
    }
}
