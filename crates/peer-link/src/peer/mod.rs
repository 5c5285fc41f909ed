//! The peer transport seam: what the coordinator needs from an ICE/SDP engine.
//!
//! [`webrtc`] adapts webrtc-rs, [`memory`] is a deterministic stand-in used by
//! tests. [`PeerConnection`] owns one transport instance together with its
//! data channels and negotiation bookkeeping.

mod connection;
pub mod memory;
pub mod webrtc;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use transport_tunnel::RawTunnel;

use crate::config::{DataChannelConfig, WebRtcConfig};
use crate::model::{
    Answer, DataChannelId, DataChannelState, IceCandidate, NegotiationRole, Offer,
    PeerConnectionId, PeerConnectionState,
};

pub(crate) use connection::ChannelEvent;
pub use connection::{DataChannel, PeerConnection};

/// Byte tunnel over one data channel.
pub type DataChannelTunnel = RawTunnel<DataChannelId, DataChannelState>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// A remote candidate was applied before any remote description.
    #[error("remote description is not set")]
    NoRemoteDescription,
    #[error("failed to create data channel {channel}: {reason}")]
    ChannelCreationFailed {
        channel: DataChannelId,
        reason: String,
    },
    #[error("data channel {channel} already carries {existing} messages")]
    MessageTypeMismatch {
        channel: DataChannelId,
        existing: &'static str,
    },
    #[error("data channel {0} is not open")]
    ChannelNotOpen(DataChannelId),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("peer transport: {0}")]
    Transport(String),
    #[error("peer connection closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDescription {
    Offer(Offer),
    Answer(Answer),
}

/// Everything a transport reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    NegotiationNeeded,
    IceCandidate(IceCandidate),
    IceCandidatesRemoved(Vec<IceCandidate>),
    ConnectionState(PeerConnectionState),
    ChannelMessage { channel: DataChannelId, data: Bytes },
    ChannelState {
        channel: DataChannelId,
        state: DataChannelState,
    },
}

#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn create_offer(&self) -> Result<Offer, PeerError>;
    async fn create_answer(&self) -> Result<Answer, PeerError>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), PeerError>;
    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn remove_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<(), PeerError>;
    async fn open_data_channel(
        &self,
        channel: DataChannelId,
        config: DataChannelConfig,
    ) -> Result<Arc<dyn DataChannelHandle>, PeerError>;
    /// The event stream. Only the first call returns it.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;
    fn connection_state(&self) -> PeerConnectionState;
    async fn close(&self);
}

#[async_trait]
pub trait DataChannelHandle: Send + Sync + 'static {
    fn id(&self) -> DataChannelId;
    fn ready_state(&self) -> DataChannelState;
    async fn send(&self, data: Bytes) -> Result<(), PeerError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync + 'static {
    async fn create(
        &self,
        id: &PeerConnectionId,
        role: NegotiationRole,
        config: &WebRtcConfig,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}
