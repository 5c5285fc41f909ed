//! Duplex tunnels with multicast event streams.
//!
//! A [`Tunnel`] bundles an identity, a stream of ready-state updates, a stream
//! of incoming messages and a send/close pair. Raw byte tunnels can be turned
//! into typed ones by composing an [`Encoder`] and a [`Decoder`] over them.

mod codec;
mod multicast;
mod tunnel;

pub use codec::{Decoder, Encoder};
pub use multicast::{Multicast, Subscription};
pub use tunnel::{RawTunnel, Tunnel, TunnelSink};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TunnelError {
    #[error("tunnel closed")]
    Closed,
    #[error("tunnel not open")]
    NotOpen,
    #[error("failed to encode outgoing message: {0}")]
    Encode(String),
    #[error("failed to decode incoming message: {0}")]
    Decode(String),
    #[error("tunnel transport error: {0}")]
    Transport(String),
}

pub type TunnelResult<T> = Result<T, TunnelError>;
