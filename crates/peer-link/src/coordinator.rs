//! Drives offer/answer/ICE exchange for each peer connection and rebuilds
//! connections when a configured failure is observed.
//!
//! Every peer connection instance owns five tasks, all cancelled together
//! when the instance is disposed:
//!
//! - `peer-events` demultiplexes transport events into channel streams and
//!   negotiation triggers,
//! - `local-ice` forwards locally gathered candidates to the remote peer,
//! - `remote-primitives` routes offers and answers to the negotiation task and
//!   applies remote candidates,
//! - `relay-notifications` reacts to the relay's remote-client events,
//! - `negotiation` runs the initiator or answerer flow.

use std::sync::{Arc, Weak};

use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use transport_tunnel::{Multicast, Subscription, TunnelError};

use crate::config::{DataChannelConfig, WebRtcConfig};
use crate::messaging::{MessageTunnel, TunnelOptions};
use crate::model::{
    Answer, DataChannelId, MessageId, NegotiationRole, NegotiationState, Offer, PeerConnectionId,
    PeerConnectionState, RtcPrimitive,
};
use crate::peer::webrtc::WebRtcTransportFactory;
use crate::peer::{
    ChannelEvent, DataChannelTunnel, PeerConnection, PeerError, PeerEvent, PeerTransportFactory,
    SessionDescription,
};
use crate::registry::{Disconnecting, Disposables, RegistryError, TaskGroup};
use crate::signaling::{Notification, SignalingChannel, SignalingError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("message {0} was not confirmed in time")]
    ConfirmationTimeout(MessageId),
    #[error("remote could not assemble message {0}")]
    RemoteReceiveError(MessageId),
}

/// Why the initiator is (re)running its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    NegotiationNeeded,
    RemoteClientJoined,
}

enum Awaited {
    Answer(Option<Answer>),
    Restart(Option<Trigger>),
}

#[derive(Debug)]
enum LocalIce {
    Send(RtcPrimitive),
    /// The remote client (re)joined the relay; retry what it missed.
    Resend,
}

/// Owns every peer connection of this endpoint.
#[derive(Clone)]
pub struct RtcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: WebRtcConfig,
    factory: Arc<dyn PeerTransportFactory>,
    peers: Disposables<PeerConnectionId, PeerConnection>,
    reconnections: Multicast<PeerConnectionId>,
}

impl RtcClient {
    pub fn new(config: WebRtcConfig, factory: Arc<dyn PeerTransportFactory>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                factory,
                peers: Disposables::new(),
                reconnections: Multicast::new(),
            }),
        }
    }

    /// A client backed by webrtc-rs.
    pub fn with_webrtc(config: WebRtcConfig) -> Result<Self, LinkError> {
        Ok(Self::new(config, Arc::new(WebRtcTransportFactory::new()?)))
    }

    /// Registers a peer connection and starts negotiating over `signaling`.
    ///
    /// The role is fixed for the lifetime of the connection, reconnects included.
    pub async fn new_connection(
        &self,
        id: PeerConnectionId,
        role: NegotiationRole,
        signaling: SignalingChannel,
    ) -> Result<(), LinkError> {
        open_connection(&self.inner, id, role, signaling).await?;
        info!(target = "peer_link::coordinator", peer = %id, ?role, "peer connection created");
        Ok(())
    }

    pub async fn peer_connection(&self, id: &PeerConnectionId) -> Result<Arc<PeerConnection>, LinkError> {
        Ok(self.inner.peers.get(id).await?)
    }

    pub async fn new_channel(
        &self,
        peer: &PeerConnectionId,
        channel: DataChannelId,
        config: DataChannelConfig,
    ) -> Result<DataChannelTunnel, LinkError> {
        self.peer_connection(peer).await?.open_channel(channel, config).await
    }

    /// Opens a channel and wraps it in a chunking message tunnel.
    pub async fn new_tunnel<T>(
        &self,
        peer: &PeerConnectionId,
        channel: DataChannelId,
        options: TunnelOptions,
    ) -> Result<MessageTunnel<T>, LinkError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let connection = self.peer_connection(peer).await?;
        connection.open_channel(channel, options.channel).await?;
        connection.message_tunnel(channel, &options).await
    }

    /// The currently registered tunnel for `channel`.
    pub async fn channel(
        &self,
        peer: &PeerConnectionId,
        channel: DataChannelId,
    ) -> Result<DataChannelTunnel, LinkError> {
        self.peer_connection(peer).await?.channel(channel).await
    }

    /// The message tunnel of the currently registered `channel`.
    ///
    /// Every call for the same channel shares one typed view, so inbound
    /// messages are confirmed once no matter how many handles exist.
    pub async fn tunnel<T>(
        &self,
        peer: &PeerConnectionId,
        channel: DataChannelId,
        options: &TunnelOptions,
    ) -> Result<MessageTunnel<T>, LinkError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.peer_connection(peer).await?.message_tunnel(channel, options).await
    }

    pub async fn negotiation_state(&self, peer: &PeerConnectionId) -> Result<NegotiationState, LinkError> {
        Ok(self.peer_connection(peer).await?.negotiation_state())
    }

    pub async fn negotiation_states(
        &self,
        peer: &PeerConnectionId,
    ) -> Result<Subscription<NegotiationState>, LinkError> {
        Ok(self.peer_connection(peer).await?.negotiation_states())
    }

    pub async fn connection_states(
        &self,
        peer: &PeerConnectionId,
    ) -> Result<Subscription<PeerConnectionState>, LinkError> {
        Ok(self.peer_connection(peer).await?.connection_states())
    }

    /// Ids of peer connections that were just rebuilt. Channels are reopened
    /// with their previous ids, so fetch them again with [`RtcClient::channel`].
    pub fn reconnections(&self) -> Subscription<PeerConnectionId> {
        self.inner.reconnections.subscribe()
    }

    pub async fn disconnect_channel(&self, channel: DataChannelId, peer: &PeerConnectionId) {
        match self.inner.peers.get(peer).await {
            Ok(connection) => connection.close_channel(channel).await,
            Err(err) => debug!(target = "peer_link::coordinator", error = %err, "nothing to disconnect"),
        }
    }

    pub async fn disconnect_peer_connection(&self, peer: &PeerConnectionId) {
        self.inner.peers.dispose_one(peer).await;
    }

    pub async fn disconnect_all(&self) {
        self.inner.peers.dispose_all().await;
    }
}

async fn open_connection(
    client: &Arc<ClientInner>,
    id: PeerConnectionId,
    role: NegotiationRole,
    signaling: SignalingChannel,
) -> Result<Arc<PeerConnection>, LinkError> {
    client.peers.assert_unique(&id).await?;
    let transport = client.factory.create(&id, role, &client.config).await?;
    let events = transport
        .take_events()
        .ok_or_else(|| PeerError::Transport("transport events already taken".into()))?;
    let connection = Arc::new(PeerConnection::new(id, role, transport, signaling));
    let tasks = spawn_connection_tasks(
        Arc::downgrade(client),
        Arc::clone(&connection),
        events,
    );
    if let Err(err) = client.peers.insert(id, Arc::clone(&connection), tasks).await {
        connection.disconnect().await;
        return Err(err.into());
    }
    Ok(connection)
}

impl ClientInner {
    /// Replaces `old` with a fresh instance under the same id and role.
    async fn reconnect(self: Arc<Self>, old: Arc<PeerConnection>) {
        let id = old.id();
        let instance = old.instance();
        let channels = old.channel_configs();
        info!(target = "peer_link::coordinator", peer = %id, instance, "reconnecting peer connection");

        let disposed = self
            .peers
            .dispose_if(&id, |current| current.instance() == instance)
            .await;
        if !disposed {
            debug!(target = "peer_link::coordinator", peer = %id, instance, "instance already gone; not reconnecting");
            return;
        }

        let replacement = match open_connection(&self, id, old.role(), old.signaling().clone()).await {
            Ok(connection) => connection,
            Err(err) => {
                error!(target = "peer_link::coordinator", peer = %id, error = %err, "reconnect failed");
                return;
            }
        };
        for (channel, config) in channels {
            if let Err(err) = replacement.open_channel(channel, config).await {
                warn!(
                    target = "peer_link::coordinator",
                    peer = %id,
                    channel = channel.0,
                    error = %err,
                    "failed to reopen channel after reconnect"
                );
            }
        }
        info!(
            target = "peer_link::coordinator",
            peer = %id,
            instance = replacement.instance(),
            "peer connection rebuilt"
        );
        self.reconnections.publish(id);
    }
}

/// Detached, since disposing the old instance cancels the task that noticed the failure.
fn spawn_reconnect(client: &Weak<ClientInner>, connection: &Arc<PeerConnection>) {
    let Some(client) = client.upgrade() else {
        return;
    };
    if !connection.begin_reconnect() {
        return;
    }
    tokio::spawn(client.reconnect(Arc::clone(connection)));
}

fn spawn_connection_tasks(
    client: Weak<ClientInner>,
    connection: Arc<PeerConnection>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
) -> TaskGroup {
    let triggers = client
        .upgrade()
        .map(|client| client.config.reconnect_triggers.clone())
        .unwrap_or_default();
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let (offer_tx, offer_rx) = mpsc::unbounded_channel();
    let (answer_tx, answer_rx) = mpsc::unbounded_channel();
    let (ice_tx, ice_rx) = mpsc::unbounded_channel();
    // subscribe now so nothing sent before the tasks first run is missed
    let primitives = connection.signaling().primitives_from_remote();
    let notifications = connection.signaling().sip_events();

    let mut tasks = TaskGroup::new();
    tasks.spawn(
        "peer-events",
        pump_peer_events(
            client.clone(),
            Arc::clone(&connection),
            events,
            trigger_tx.clone(),
            ice_tx.clone(),
            triggers.peer_connection_states,
        ),
    );
    tasks.spawn(
        "local-ice",
        forward_local_candidates(Arc::clone(&connection), ice_rx),
    );
    tasks.spawn(
        "remote-primitives",
        pump_remote_primitives(Arc::clone(&connection), primitives, offer_tx, answer_tx),
    );
    tasks.spawn(
        "relay-notifications",
        watch_relay_notifications(
            client,
            Arc::clone(&connection),
            notifications,
            trigger_tx,
            ice_tx,
            triggers.notifications,
        ),
    );
    match connection.role() {
        NegotiationRole::Initiator => {
            tasks.spawn("negotiation", run_initiator(connection, trigger_rx, answer_rx))
        }
        NegotiationRole::Answerer => tasks.spawn("negotiation", run_answerer(connection, offer_rx)),
    }
    tasks
}

async fn pump_peer_events(
    client: Weak<ClientInner>,
    connection: Arc<PeerConnection>,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
    triggers: mpsc::UnboundedSender<Trigger>,
    local_ice: mpsc::UnboundedSender<LocalIce>,
    reconnect_on: Vec<PeerConnectionState>,
) {
    while let Some(event) = events.recv().await {
        match event {
            PeerEvent::NegotiationNeeded => {
                if triggers.send(Trigger::NegotiationNeeded).is_err() {
                    debug!(target = "peer_link::coordinator", peer = %connection.id(), "negotiation-needed with no initiator flow running");
                }
            }
            PeerEvent::IceCandidate(candidate) => {
                if local_ice.send(LocalIce::Send(RtcPrimitive::AddIce(candidate))).is_err() {
                    debug!(target = "peer_link::coordinator", peer = %connection.id(), "local candidate dropped; forwarder stopped");
                }
            }
            PeerEvent::IceCandidatesRemoved(candidates) => {
                if local_ice.send(LocalIce::Send(RtcPrimitive::RemoveIces(candidates))).is_err() {
                    debug!(target = "peer_link::coordinator", peer = %connection.id(), "candidate removal dropped; forwarder stopped");
                }
            }
            PeerEvent::ConnectionState(state) => {
                debug!(
                    target = "peer_link::coordinator",
                    peer = %connection.id(),
                    instance = connection.instance(),
                    %state,
                    "peer connection state"
                );
                connection.publish_connection_state(state);
                if reconnect_on.contains(&state) {
                    spawn_reconnect(&client, &connection);
                }
            }
            PeerEvent::ChannelMessage { channel, data } => {
                connection.route_channel_event(channel, ChannelEvent::Message(data))
            }
            PeerEvent::ChannelState { channel, state } => {
                connection.route_channel_event(channel, ChannelEvent::State(state))
            }
        }
    }
}

async fn forward_local_candidates(
    connection: Arc<PeerConnection>,
    mut commands: mpsc::UnboundedReceiver<LocalIce>,
) {
    let mut undelivered: Vec<RtcPrimitive> = Vec::new();
    while let Some(command) = commands.recv().await {
        let batch = match command {
            LocalIce::Send(primitive) => vec![primitive],
            LocalIce::Resend => std::mem::take(&mut undelivered),
        };
        for primitive in batch {
            match connection.signaling().send_to_remote(primitive.clone()).await {
                Ok(()) => {}
                Err(SignalingError::NoRemoteClientToTalkTo(_)) => {
                    debug!(
                        target = "peer_link::coordinator",
                        peer = %connection.id(),
                        "remote not on relay yet; holding local candidate"
                    );
                    undelivered.push(primitive);
                }
                Err(err) => warn!(
                    target = "peer_link::coordinator",
                    peer = %connection.id(),
                    error = %err,
                    "failed to send local candidate"
                ),
            }
        }
    }
}

async fn pump_remote_primitives(
    connection: Arc<PeerConnection>,
    mut primitives: BoxStream<'static, Result<RtcPrimitive, SignalingError>>,
    offers: mpsc::UnboundedSender<Offer>,
    answers: mpsc::UnboundedSender<Answer>,
) {
    while let Some(item) = primitives.next().await {
        match item {
            Ok(RtcPrimitive::Offer(offer)) => {
                if offers.send(offer).is_err() {
                    warn!(target = "peer_link::coordinator", peer = %connection.id(), "initiator ignoring remote offer");
                }
            }
            Ok(RtcPrimitive::Answer(answer)) => {
                if answers.send(answer).is_err() {
                    warn!(target = "peer_link::coordinator", peer = %connection.id(), "answerer ignoring remote answer");
                }
            }
            Ok(RtcPrimitive::AddIce(candidate)) => connection.add_remote_candidate(candidate).await,
            Ok(RtcPrimitive::RemoveIces(candidates)) => {
                connection.remove_remote_candidates(candidates).await
            }
            Err(err) if err.is_fatal() => {
                error!(
                    target = "peer_link::coordinator",
                    peer = %connection.id(),
                    error = %err,
                    "signaling channel failed"
                );
                break;
            }
            Err(err) => warn!(
                target = "peer_link::coordinator",
                peer = %connection.id(),
                error = %err,
                "dropping undecodable remote primitive"
            ),
        }
    }
}

async fn watch_relay_notifications(
    client: Weak<ClientInner>,
    connection: Arc<PeerConnection>,
    mut notifications: BoxStream<'static, Result<Notification, SignalingError>>,
    triggers: mpsc::UnboundedSender<Trigger>,
    local_ice: mpsc::UnboundedSender<LocalIce>,
    reconnect_on: Vec<Notification>,
) {
    while let Some(item) = notifications.next().await {
        let notification = match item {
            Ok(notification) => notification,
            Err(err) => {
                debug!(target = "peer_link::coordinator", peer = %connection.id(), error = %err, "relay notifications ended");
                break;
            }
        };
        debug!(target = "peer_link::coordinator", peer = %connection.id(), ?notification, "relay notification");
        if notification == Notification::RemoteClientJustConnected {
            if local_ice.send(LocalIce::Resend).is_err() {
                debug!(target = "peer_link::coordinator", peer = %connection.id(), "candidate resend skipped; forwarder stopped");
            }
            if connection.role() == NegotiationRole::Initiator
                && connection.negotiation_state() != NegotiationState::Connected
                && triggers.send(Trigger::RemoteClientJoined).is_err()
            {
                debug!(target = "peer_link::coordinator", peer = %connection.id(), "initiator flow stopped; renegotiation skipped");
            }
        }
        if reconnect_on.contains(&notification) {
            spawn_reconnect(&client, &connection);
        }
    }
}

async fn run_initiator(
    connection: Arc<PeerConnection>,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    mut answers: mpsc::UnboundedReceiver<Answer>,
) {
    let mut next = triggers.recv().await;
    while let Some(mut trigger) = next.take() {
        while let Ok(newer) = triggers.try_recv() {
            trigger = newer;
        }
        // answers to an earlier offer are stale now
        while answers.try_recv().is_ok() {}

        debug!(target = "peer_link::coordinator", peer = %connection.id(), ?trigger, "sending offer");
        connection.set_negotiation_state(NegotiationState::Negotiating);
        if let Err(err) = send_offer(&connection).await {
            error!(target = "peer_link::coordinator", peer = %connection.id(), error = %err, "failed to send offer");
            connection.set_negotiation_state(NegotiationState::Failed);
            next = triggers.recv().await;
            continue;
        }

        let awaited = tokio::select! {
            answer = answers.recv() => Awaited::Answer(answer),
            restart = triggers.recv() => Awaited::Restart(restart),
        };
        match awaited {
            Awaited::Answer(None) => return,
            Awaited::Answer(Some(answer)) => {
                match connection
                    .apply_remote_description(SessionDescription::Answer(answer))
                    .await
                {
                    Ok(()) => connection.set_negotiation_state(NegotiationState::Connected),
                    Err(err) => {
                        error!(target = "peer_link::coordinator", peer = %connection.id(), error = %err, "failed to apply answer");
                        connection.set_negotiation_state(NegotiationState::Failed);
                    }
                }
                next = triggers.recv().await;
            }
            Awaited::Restart(restart) => {
                debug!(target = "peer_link::coordinator", peer = %connection.id(), "restarting offer before answer arrived");
                next = restart;
            }
        }
    }
}

async fn send_offer(connection: &PeerConnection) -> Result<(), LinkError> {
    let offer = connection.transport().create_offer().await?;
    connection
        .transport()
        .set_local_description(SessionDescription::Offer(offer.clone()))
        .await?;
    connection
        .signaling()
        .send_to_remote(RtcPrimitive::Offer(offer))
        .await?;
    Ok(())
}

async fn run_answerer(connection: Arc<PeerConnection>, mut offers: mpsc::UnboundedReceiver<Offer>) {
    while let Some(mut offer) = offers.recv().await {
        while let Ok(newer) = offers.try_recv() {
            offer = newer;
        }
        debug!(target = "peer_link::coordinator", peer = %connection.id(), "answering offer");
        connection.set_negotiation_state(NegotiationState::Negotiating);
        match answer_offer(&connection, offer).await {
            Ok(()) => connection.set_negotiation_state(NegotiationState::Connected),
            Err(err) => {
                error!(target = "peer_link::coordinator", peer = %connection.id(), error = %err, "failed to answer offer");
                connection.set_negotiation_state(NegotiationState::Failed);
            }
        }
    }
}

async fn answer_offer(connection: &PeerConnection, offer: Offer) -> Result<(), LinkError> {
    connection
        .apply_remote_description(SessionDescription::Offer(offer))
        .await?;
    let answer = connection.transport().create_answer().await?;
    connection
        .transport()
        .set_local_description(SessionDescription::Answer(answer.clone()))
        .await?;
    connection
        .signaling()
        .send_to_remote(RtcPrimitive::Answer(answer))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SignalingChannelConfig;
    use crate::model::{ClientSource, ConnectionPassword, ConnectionSecrets};
    use crate::peer::memory::MemoryPeerNetwork;
    use crate::signaling::memory::MemoryRelay;

    fn signaling(relay: &MemoryRelay, secrets: &ConnectionSecrets, source: ClientSource) -> SignalingChannel {
        SignalingChannel::new(
            relay.endpoint(source),
            secrets,
            source,
            SignalingChannelConfig::default(),
        )
    }

    #[tokio::test]
    async fn duplicate_connection_id_is_rejected() {
        let relay = MemoryRelay::new();
        let secrets = ConnectionSecrets::from_password(ConnectionPassword::random());
        let client = RtcClient::new(WebRtcConfig::local_only(), Arc::new(MemoryPeerNetwork::new()));
        let channel = signaling(&relay, &secrets, ClientSource::Wallet);
        let id = secrets.connection_id();

        client
            .new_connection(id, NegotiationRole::Initiator, channel.clone())
            .await
            .expect("first connection");
        let err = client
            .new_connection(id, NegotiationRole::Initiator, channel)
            .await
            .expect_err("duplicate");
        assert!(matches!(err, LinkError::Registry(RegistryError::AlreadyExists(_))));
        assert_eq!(
            client.negotiation_state(&id).await.expect("state"),
            NegotiationState::Idle
        );

        client.disconnect_peer_connection(&id).await;
        assert!(matches!(
            client.negotiation_state(&id).await,
            Err(LinkError::Registry(RegistryError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn channel_on_unknown_peer_fails() {
        let client = RtcClient::new(WebRtcConfig::local_only(), Arc::new(MemoryPeerNetwork::new()));
        let id = PeerConnectionId::new([3; 32]);
        let err = client
            .new_channel(&id, DataChannelId(0), DataChannelConfig::default())
            .await
            .expect_err("no such peer");
        assert!(matches!(err, LinkError::Registry(RegistryError::NotFound(_))));
    }
}
