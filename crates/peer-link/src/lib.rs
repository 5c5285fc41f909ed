//! Peer-to-peer data links negotiated through an encrypted signaling relay.
//!
//! Two endpoints that share a [`model::ConnectionPassword`] meet at a relay,
//! exchange offers, answers and ICE candidates sealed with a key derived from
//! that password, and end up with one or more data channels between them.
//! [`RtcClient`] drives the negotiation and rebuilds connections that fail;
//! [`messaging::MessageTunnel`] carries typed, chunked messages over a channel.

pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod messaging;
pub mod model;
pub mod peer;
pub mod registry;
pub mod signaling;
pub mod telemetry;

pub use config::{
    DataChannelConfig, LinkConfig, ReconnectTriggers, SignalingChannelConfig,
    SignalingServerConfig, WebRtcConfig,
};
pub use coordinator::{LinkError, RtcClient};
pub use messaging::{DeliveryPolicy, Inbound, MessageTunnel, TunnelOptions};
pub use model::{
    ClientSource, ConnectionPassword, ConnectionSecrets, DataChannelId, NegotiationRole,
    NegotiationState, PeerConnectionId, PeerConnectionState,
};
pub use signaling::{connect_relay, SignalingChannel, SignalingError};
