use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::codec::{Decoder, Encoder};
use crate::multicast::{Multicast, Subscription};
use crate::TunnelError;

/// Write half of a tunnel, implemented by whatever owns the underlying channel.
#[async_trait]
pub trait TunnelSink<Out>: Send + Sync {
    async fn send(&self, message: Out) -> Result<(), TunnelError>;
    async fn close(&self);
}

pub type RawTunnel<ID, S> = Tunnel<ID, S, Bytes, Bytes>;

/// A duplex channel: identity, ready-state updates, incoming messages, send and close.
///
/// Clones share the same streams and the same closed flag, so closing any
/// clone closes them all. Typed tunnels built with [`Tunnel::with_codec`] also
/// share the closed flag of the raw tunnel they wrap.
pub struct Tunnel<ID, S, In, Out> {
    id: ID,
    ready_states: Multicast<S>,
    incoming: Multicast<Result<In, TunnelError>>,
    sink: Arc<dyn TunnelSink<Out>>,
    closed: Arc<AtomicBool>,
}

impl<ID: Clone, S, In, Out> Clone for Tunnel<ID, S, In, Out> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            ready_states: self.ready_states.clone(),
            incoming: self.incoming.clone(),
            sink: Arc::clone(&self.sink),
            closed: Arc::clone(&self.closed),
        }
    }
}

impl<ID: fmt::Debug, S, In, Out> fmt::Debug for Tunnel<ID, S, In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<ID, S, In, Out> Tunnel<ID, S, In, Out>
where
    ID: Clone + Send + Sync + 'static,
    S: Clone + Send + 'static,
    In: Clone + Send + 'static,
    Out: Send + 'static,
{
    pub fn new(
        id: ID,
        ready_states: Multicast<S>,
        incoming: Multicast<Result<In, TunnelError>>,
        sink: Arc<dyn TunnelSink<Out>>,
    ) -> Self {
        Self {
            id,
            ready_states,
            incoming,
            sink,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &ID {
        &self.id
    }

    pub fn ready_states(&self) -> Subscription<S> {
        self.ready_states.subscribe()
    }

    pub fn incoming(&self) -> Subscription<Result<In, TunnelError>> {
        self.incoming.subscribe()
    }

    /// Most recent ready state, when the state multicast replays its latest value.
    pub fn ready_state(&self) -> Option<S> {
        self.ready_states.latest()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn send(&self, message: Out) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        self.sink.send(message).await
    }

    /// Closes the tunnel. Only the first call reaches the sink.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.sink.close().await;
    }
}

impl<ID, S> Tunnel<ID, S, Bytes, Bytes>
where
    ID: Clone + Send + Sync + 'static,
    S: Clone + Send + 'static,
{
    /// Wraps this raw tunnel into a typed one.
    ///
    /// Frames are decoded by a background task that lives until the raw
    /// incoming stream finishes. A frame that fails to decode is published as
    /// an `Err` item and the stream carries on.
    pub fn with_codec<E, D>(&self, encoder: E, mut decoder: D) -> Tunnel<ID, S, D::Item, E::Item>
    where
        E: Encoder,
        D: Decoder,
    {
        let decoded: Multicast<Result<D::Item, TunnelError>> = Multicast::new();
        let mut frames = self.incoming.subscribe();
        let out = decoded.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let item = match frame.and_then(|bytes| decoder.decode(bytes)) {
                    Ok(Some(item)) => Ok(item),
                    Ok(None) => continue,
                    Err(err) => {
                        trace!(target = "transport_tunnel", error = %err, "frame failed to decode");
                        Err(err)
                    }
                };
                out.publish(item);
            }
            out.finish();
        });

        Tunnel {
            id: self.id.clone(),
            ready_states: self.ready_states.clone(),
            incoming: decoded,
            sink: Arc::new(CodecSink {
                encoder,
                inner: Arc::clone(&self.sink),
            }),
            closed: Arc::clone(&self.closed),
        }
    }
}

struct CodecSink<E> {
    encoder: E,
    inner: Arc<dyn TunnelSink<Bytes>>,
}

#[async_trait]
impl<E: Encoder> TunnelSink<E::Item> for CodecSink<E> {
    async fn send(&self, message: E::Item) -> Result<(), TunnelError> {
        for frame in self.encoder.encode(message)? {
            self.inner.send(frame).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}
