use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use transport_tunnel::{Multicast, Subscription, Tunnel, TunnelError, TunnelSink};

use super::{DataChannelHandle, DataChannelTunnel, PeerError, PeerTransport, SessionDescription};
use crate::config::DataChannelConfig;
use crate::coordinator::LinkError;
use crate::messaging::{MessageTunnel, TunnelOptions};
use crate::model::{
    DataChannelId, DataChannelState, IceCandidate, NegotiationRole, NegotiationState,
    PeerConnectionId, PeerConnectionState,
};
use crate::registry::{Disconnecting, Disposables, TaskGroup};
use crate::signaling::SignalingChannel;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Message(Bytes),
    State(DataChannelState),
}

#[derive(Default)]
struct CandidateQueue {
    remote_description_set: bool,
    pending: Vec<IceCandidate>,
}

/// One live peer transport instance and everything hanging off it.
///
/// A reconnect replaces the whole instance under the same id; `instance`
/// tells the old one from the new one.
pub struct PeerConnection {
    id: PeerConnectionId,
    role: NegotiationRole,
    instance: u64,
    transport: Arc<dyn PeerTransport>,
    signaling: SignalingChannel,
    negotiation: Multicast<NegotiationState>,
    connection_states: Multicast<PeerConnectionState>,
    channels: Disposables<DataChannelId, DataChannel>,
    routes: Mutex<HashMap<DataChannelId, mpsc::UnboundedSender<ChannelEvent>>>,
    channel_configs: Mutex<BTreeMap<DataChannelId, DataChannelConfig>>,
    candidates: Mutex<CandidateQueue>,
    reconnecting: AtomicBool,
    disconnected: AtomicBool,
}

impl PeerConnection {
    pub(crate) fn new(
        id: PeerConnectionId,
        role: NegotiationRole,
        transport: Arc<dyn PeerTransport>,
        signaling: SignalingChannel,
    ) -> Self {
        let negotiation = Multicast::replaying_last();
        negotiation.publish(NegotiationState::Idle);
        let connection_states = Multicast::replaying_last();
        connection_states.publish(transport.connection_state());
        Self {
            id,
            role,
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            transport,
            signaling,
            negotiation,
            connection_states,
            channels: Disposables::new(),
            routes: Mutex::new(HashMap::new()),
            channel_configs: Mutex::new(BTreeMap::new()),
            candidates: Mutex::new(CandidateQueue::default()),
            reconnecting: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PeerConnectionId {
        self.id
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.signaling
    }

    pub(crate) fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation.latest().unwrap_or(NegotiationState::Idle)
    }

    pub fn negotiation_states(&self) -> Subscription<NegotiationState> {
        self.negotiation.subscribe()
    }

    pub(crate) fn set_negotiation_state(&self, state: NegotiationState) {
        if self.negotiation.latest() == Some(state) {
            return;
        }
        debug!(
            target = "peer_link::peer",
            peer = %self.id,
            instance = self.instance,
            ?state,
            "negotiation state"
        );
        self.negotiation.publish(state);
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.connection_states
            .latest()
            .unwrap_or(PeerConnectionState::New)
    }

    pub fn connection_states(&self) -> Subscription<PeerConnectionState> {
        self.connection_states.subscribe()
    }

    pub(crate) fn publish_connection_state(&self, state: PeerConnectionState) {
        if self.connection_states.latest() == Some(state) {
            return;
        }
        self.connection_states.publish(state);
        match state {
            PeerConnectionState::Failed => self.set_negotiation_state(NegotiationState::Failed),
            PeerConnectionState::Disconnected | PeerConnectionState::Closed
                if self.negotiation_state() == NegotiationState::Connected =>
            {
                self.set_negotiation_state(NegotiationState::Disconnected)
            }
            _ => {}
        }
    }

    /// Marks this instance as being replaced. Only the first caller gets `true`.
    pub(crate) fn begin_reconnect(&self) -> bool {
        !self.reconnecting.swap(true, Ordering::AcqRel)
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Opens a data channel on the transport and registers its tunnel.
    pub async fn open_channel(
        &self,
        channel: DataChannelId,
        config: DataChannelConfig,
    ) -> Result<DataChannelTunnel, LinkError> {
        if self.is_disconnected() {
            return Err(PeerError::Closed.into());
        }
        self.channels.assert_unique(&channel).await?;
        let handle = self
            .transport
            .open_data_channel(channel, config)
            .await
            .map_err(|err| match err {
                err @ PeerError::ChannelCreationFailed { .. } => err,
                other => PeerError::ChannelCreationFailed {
                    channel,
                    reason: other.to_string(),
                },
            })?;

        let ready = Multicast::replaying_last();
        let incoming = Multicast::new();
        let tunnel = Tunnel::new(
            channel,
            ready.clone(),
            incoming.clone(),
            Arc::new(ChannelSink {
                handle: Arc::clone(&handle),
            }),
        );
        let element = Arc::new(DataChannel {
            tunnel: tunnel.clone(),
            config,
            ready,
            incoming,
            messages: Mutex::new(None),
        });

        // the snapshot goes first so a state change racing this registration
        // still arrives after it
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(ChannelEvent::State(handle.ready_state()));
        self.routes.lock().insert(channel, events_tx);

        let mut tasks = TaskGroup::new();
        tasks.spawn(
            "channel-events",
            pump_channel_events(events_rx, Arc::clone(&element)),
        );
        if let Err(err) = self.channels.insert(channel, element, tasks).await {
            self.routes.lock().remove(&channel);
            handle.close().await;
            return Err(err.into());
        }
        self.channel_configs.lock().insert(channel, config);
        debug!(
            target = "peer_link::peer",
            peer = %self.id,
            channel = channel.0,
            ordered = config.ordered,
            "data channel registered"
        );
        Ok(tunnel)
    }

    pub async fn channel(&self, channel: DataChannelId) -> Result<DataChannelTunnel, LinkError> {
        Ok(self.channels.get(&channel).await?.tunnel())
    }

    /// The message tunnel of `channel`, see [`DataChannel::message_tunnel`].
    pub async fn message_tunnel<T>(
        &self,
        channel: DataChannelId,
        options: &TunnelOptions,
    ) -> Result<MessageTunnel<T>, LinkError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.channels.get(&channel).await?.message_tunnel(options)
    }

    pub async fn close_channel(&self, channel: DataChannelId) {
        self.channels.dispose_one(&channel).await;
        self.routes.lock().remove(&channel);
        self.channel_configs.lock().remove(&channel);
    }

    /// Channels to reopen on a replacement instance.
    pub(crate) fn channel_configs(&self) -> Vec<(DataChannelId, DataChannelConfig)> {
        self.channel_configs
            .lock()
            .iter()
            .map(|(id, config)| (*id, *config))
            .collect()
    }

    pub(crate) fn route_channel_event(&self, channel: DataChannelId, event: ChannelEvent) {
        let routes = self.routes.lock();
        match routes.get(&channel) {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => trace!(
                target = "peer_link::peer",
                peer = %self.id,
                channel = channel.0,
                ?event,
                "event for unregistered channel dropped"
            ),
        }
    }

    /// Applies a remote candidate, or holds it until a remote description is set.
    pub(crate) async fn add_remote_candidate(&self, candidate: IceCandidate) {
        {
            let mut queue = self.candidates.lock();
            if !queue.remote_description_set {
                trace!(
                    target = "peer_link::peer",
                    peer = %self.id,
                    queued = queue.pending.len() + 1,
                    "queueing remote candidate"
                );
                queue.pending.push(candidate);
                return;
            }
        }
        self.apply_remote_candidate(candidate).await;
    }

    async fn apply_remote_candidate(&self, candidate: IceCandidate) {
        match self.transport.add_remote_ice_candidate(candidate).await {
            Ok(()) => {}
            // late candidate racing a teardown of the transport
            Err(PeerError::NoRemoteDescription) => warn!(
                target = "peer_link::peer",
                peer = %self.id,
                "remote candidate without remote description; ignored"
            ),
            Err(err) => warn!(
                target = "peer_link::peer",
                peer = %self.id,
                error = %err,
                "failed to add remote candidate"
            ),
        }
    }

    pub(crate) async fn remove_remote_candidates(&self, candidates: Vec<IceCandidate>) {
        if let Err(err) = self.transport.remove_ice_candidates(candidates).await {
            warn!(
                target = "peer_link::peer",
                peer = %self.id,
                error = %err,
                "failed to remove remote candidates"
            );
        }
    }

    /// Sets the remote description and flushes candidates that were waiting for it.
    pub(crate) async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.transport.set_remote_description(description).await?;
        let pending = {
            let mut queue = self.candidates.lock();
            queue.remote_description_set = true;
            std::mem::take(&mut queue.pending)
        };
        if !pending.is_empty() {
            debug!(
                target = "peer_link::peer",
                peer = %self.id,
                count = pending.len(),
                "flushing queued remote candidates"
            );
        }
        for candidate in pending {
            self.apply_remote_candidate(candidate).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Disconnecting for PeerConnection {
    async fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(
            target = "peer_link::peer",
            peer = %self.id,
            instance = self.instance,
            "disconnecting peer connection"
        );
        self.channels.dispose_all().await;
        self.routes.lock().clear();
        self.transport.close().await;
        self.set_negotiation_state(NegotiationState::Disconnected);
        if self.connection_states.latest() != Some(PeerConnectionState::Closed) {
            self.connection_states.publish(PeerConnectionState::Closed);
        }
        self.negotiation.finish();
        self.connection_states.finish();
    }
}

/// A registered data channel: its tunnel and the streams feeding it.
pub struct DataChannel {
    tunnel: DataChannelTunnel,
    config: DataChannelConfig,
    ready: Multicast<DataChannelState>,
    incoming: Multicast<Result<Bytes, TunnelError>>,
    messages: Mutex<Option<MessageView>>,
}

/// The typed view of a channel and the task answering its inbound messages.
struct MessageView {
    message_type: &'static str,
    tunnel: Box<dyn Any + Send + Sync>,
    responder: TaskGroup,
}

impl DataChannel {
    pub fn tunnel(&self) -> DataChannelTunnel {
        self.tunnel.clone()
    }

    pub fn config(&self) -> DataChannelConfig {
        self.config
    }

    /// Returns the channel's message tunnel, creating it on first use.
    ///
    /// The chunking, dedupe and confirmation options of the first call stay in
    /// force for the life of the channel; later calls only pick their own
    /// delivery policy.
    pub fn message_tunnel<T>(&self, options: &TunnelOptions) -> Result<MessageTunnel<T>, LinkError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let channel = *self.tunnel.id();
        let mut messages = self.messages.lock();
        if let Some(view) = messages.as_ref() {
            return view
                .tunnel
                .downcast_ref::<MessageTunnel<T>>()
                .map(|tunnel| tunnel.with_delivery(options.delivery))
                .ok_or_else(|| {
                    PeerError::MessageTypeMismatch {
                        channel,
                        existing: view.message_type,
                    }
                    .into()
                });
        }
        if self.tunnel.is_closed() {
            return Err(TunnelError::Closed.into());
        }

        let (tunnel, responder) = MessageTunnel::<T>::over(&self.tunnel, options);
        let mut tasks = TaskGroup::new();
        tasks.spawn("message-responder", responder);
        *messages = Some(MessageView {
            message_type: std::any::type_name::<T>(),
            tunnel: Box::new(tunnel.clone()),
            responder: tasks,
        });
        debug!(
            target = "peer_link::peer",
            channel = channel.0,
            message_type = std::any::type_name::<T>(),
            "message tunnel attached"
        );
        Ok(tunnel)
    }

    fn publish_state(&self, state: DataChannelState) -> bool {
        match self.ready.latest() {
            Some(current) if current == state => false,
            // a closed channel never reopens
            Some(DataChannelState::Closed) => false,
            _ => {
                self.ready.publish(state);
                true
            }
        }
    }

    fn finish(&self) {
        self.ready.finish();
        self.incoming.finish();
    }
}

#[async_trait]
impl Disconnecting for DataChannel {
    async fn disconnect(&self) {
        let view = self.messages.lock().take();
        if let Some(view) = view {
            view.responder.shutdown().await;
        }
        self.tunnel.close().await;
        self.publish_state(DataChannelState::Closed);
        self.finish();
    }
}

async fn pump_channel_events(mut events: mpsc::UnboundedReceiver<ChannelEvent>, channel: Arc<DataChannel>) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Message(data) => {
                trace!(
                    target = "peer_link::peer",
                    channel = channel.tunnel.id().0,
                    len = data.len(),
                    "channel message"
                );
                channel.incoming.publish(Ok(data));
            }
            ChannelEvent::State(state) => {
                if channel.publish_state(state) && state == DataChannelState::Closed {
                    channel.tunnel.close().await;
                    break;
                }
            }
        }
    }
    channel.finish();
}

struct ChannelSink {
    handle: Arc<dyn DataChannelHandle>,
}

#[async_trait]
impl TunnelSink<Bytes> for ChannelSink {
    async fn send(&self, data: Bytes) -> Result<(), TunnelError> {
        self.handle.send(data).await.map_err(|err| match err {
            PeerError::ChannelNotOpen(_) => TunnelError::NotOpen,
            PeerError::Closed => TunnelError::Closed,
            other => TunnelError::Transport(other.to_string()),
        })
    }

    async fn close(&self) {
        self.handle.close().await;
    }
}
