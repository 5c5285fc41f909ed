use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use test_timeout::tokio_timeout_test;
use tokio::time::timeout;
use transport_tunnel::{Subscription, TunnelError};

use peer_link::config::SignalingChannelConfig;
use peer_link::messaging::{DeliveryPolicy, Inbound, MessageTunnel, TunnelOptions};
use peer_link::model::{
    ClientSource, ConnectionPassword, ConnectionSecrets, DataChannelId, DataChannelState,
    NegotiationRole, NegotiationState, PeerConnectionId, PeerConnectionState, RtcPrimitive,
};
use peer_link::peer::memory::MemoryPeerNetwork;
use peer_link::peer::{DataChannelTunnel, PeerError};
use peer_link::signaling::memory::MemoryRelay;
use peer_link::signaling::SignalingChannel;
use peer_link::{DataChannelConfig, LinkError, RtcClient, WebRtcConfig};

const STEP: Duration = Duration::from_secs(5);
const CHANNEL: DataChannelId = DataChannelId(0);

fn secrets() -> ConnectionSecrets {
    ConnectionSecrets::from_password(ConnectionPassword::new([42; 32]))
}

fn signaling(relay: &MemoryRelay, source: ClientSource) -> SignalingChannel {
    SignalingChannel::new(
        relay.endpoint(source),
        &secrets(),
        source,
        SignalingChannelConfig::default(),
    )
}

async fn wait_for<T>(mut items: Subscription<T>, done: impl FnMut(&T) -> bool) -> T
where
    T: std::fmt::Debug,
{
    wait_in(&mut items, done).await
}

async fn wait_in<T>(items: &mut Subscription<T>, mut done: impl FnMut(&T) -> bool) -> T
where
    T: std::fmt::Debug,
{
    timeout(STEP, async {
        while let Some(item) = items.recv().await {
            if done(&item) {
                return item;
            }
        }
        panic!("stream ended before the expected item");
    })
    .await
    .expect("timed out waiting for stream item")
}

async fn wait_open(channel: &DataChannelTunnel) {
    wait_for(channel.ready_states(), |state| *state == DataChannelState::Open).await;
}

async fn next_bytes(incoming: &mut Subscription<Result<Bytes, TunnelError>>) -> Bytes {
    timeout(STEP, incoming.recv())
        .await
        .expect("timed out waiting for message")
        .expect("incoming stream ended")
        .expect("transport error")
}

/// Two clients sharing one relay and one in-memory peer network.
struct Link {
    network: MemoryPeerNetwork,
    initiator: RtcClient,
    answerer: RtcClient,
    id: PeerConnectionId,
}

impl Link {
    async fn new() -> Self {
        let relay = MemoryRelay::new();
        let network = MemoryPeerNetwork::new();
        let initiator = RtcClient::new(WebRtcConfig::local_only(), Arc::new(network.clone()));
        let answerer = RtcClient::new(WebRtcConfig::local_only(), Arc::new(network.clone()));
        let id = secrets().connection_id();

        answerer
            .new_connection(id, NegotiationRole::Answerer, signaling(&relay, ClientSource::Wallet))
            .await
            .expect("answerer connection");
        initiator
            .new_connection(
                id,
                NegotiationRole::Initiator,
                signaling(&relay, ClientSource::Extension),
            )
            .await
            .expect("initiator connection");

        Self {
            network,
            initiator,
            answerer,
            id,
        }
    }

    async fn open_channels(&self) -> (DataChannelTunnel, DataChannelTunnel) {
        let initiator = self
            .initiator
            .new_channel(&self.id, CHANNEL, DataChannelConfig::default())
            .await
            .expect("initiator channel");
        let answerer = self
            .answerer
            .new_channel(&self.id, CHANNEL, DataChannelConfig::default())
            .await
            .expect("answerer channel");
        wait_open(&initiator).await;
        wait_open(&answerer).await;
        (initiator, answerer)
    }
}

#[tokio_timeout_test(10)]
async fn offer_reaches_the_other_side_first() {
    let relay = MemoryRelay::new();
    let answerer = signaling(&relay, ClientSource::Wallet);
    let initiator = signaling(&relay, ClientSource::Extension);
    let mut primitives = answerer.primitives_from_remote();

    initiator
        .send_to_remote(RtcPrimitive::offer("o"))
        .await
        .expect("offer sent");

    let first = timeout(STEP, primitives.next())
        .await
        .expect("timed out")
        .expect("stream ended");
    assert_eq!(first, Ok(RtcPrimitive::offer("o")));
}

#[tokio_timeout_test(10)]
async fn negotiation_connects_both_sides_and_opens_the_channel() {
    let link = Link::new().await;
    let (initiator_channel, answerer_channel) = link.open_channels().await;

    for client in [&link.initiator, &link.answerer] {
        let states = client.connection_states(&link.id).await.expect("peer");
        wait_for(states, |state| *state == PeerConnectionState::Connected).await;
        let negotiation = client.negotiation_states(&link.id).await.expect("peer");
        wait_for(negotiation, |state| *state == NegotiationState::Connected).await;
    }
    assert_eq!(initiator_channel.ready_state(), Some(DataChannelState::Open));
    assert_eq!(answerer_channel.ready_state(), Some(DataChannelState::Open));
}

#[tokio_timeout_test(10)]
async fn messages_flow_in_both_directions() {
    let link = Link::new().await;
    let (initiator_channel, answerer_channel) = link.open_channels().await;
    let mut at_answerer = answerer_channel.incoming();
    let mut at_initiator = initiator_channel.incoming();

    initiator_channel
        .send(Bytes::from_static(b"Hey Answerer"))
        .await
        .expect("send to answerer");
    assert_eq!(next_bytes(&mut at_answerer).await, Bytes::from_static(b"Hey Answerer"));

    answerer_channel
        .send(Bytes::from_static(b"Hey Initiator"))
        .await
        .expect("send to initiator");
    assert_eq!(next_bytes(&mut at_initiator).await, Bytes::from_static(b"Hey Initiator"));
}

#[tokio_timeout_test(10)]
async fn sending_on_a_disconnected_channel_fails() {
    let link = Link::new().await;
    let (initiator_channel, _answerer_channel) = link.open_channels().await;

    link.initiator.disconnect_channel(CHANNEL, &link.id).await;

    assert_eq!(
        initiator_channel.send(Bytes::from_static(b"late")).await,
        Err(TunnelError::Closed)
    );
    assert_eq!(initiator_channel.ready_state(), Some(DataChannelState::Closed));
    assert!(link.initiator.channel(&link.id, CHANNEL).await.is_err());
}

#[tokio_timeout_test(10)]
async fn disconnecting_the_peer_closes_its_channels() {
    let link = Link::new().await;
    let (initiator_channel, _answerer_channel) = link.open_channels().await;

    link.initiator.disconnect_peer_connection(&link.id).await;

    assert!(initiator_channel.is_closed());
    assert!(link.initiator.peer_connection(&link.id).await.is_err());
}

#[tokio_timeout_test(15)]
async fn failed_connection_is_rebuilt_with_its_channels() {
    let link = Link::new().await;
    let (old_channel, answerer_channel) = link.open_channels().await;
    let first_instance = link.initiator.peer_connection(&link.id).await.expect("peer").instance();
    let mut reconnections = link.initiator.reconnections();

    assert!(link.network.fail(&link.id, NegotiationRole::Initiator));

    let rebuilt = timeout(STEP, reconnections.recv()).await.expect("timed out");
    assert_eq!(rebuilt, Some(link.id));
    let connection = link.initiator.peer_connection(&link.id).await.expect("peer");
    assert_ne!(connection.instance(), first_instance);
    assert!(old_channel.is_closed());

    let channel = link.initiator.channel(&link.id, CHANNEL).await.expect("reopened channel");
    wait_open(&channel).await;

    let mut at_answerer = answerer_channel.incoming();
    channel
        .send(Bytes::from_static(b"after reconnect"))
        .await
        .expect("send after reconnect");
    assert_eq!(
        next_bytes(&mut at_answerer).await,
        Bytes::from_static(b"after reconnect")
    );
    assert_eq!(link.network.created(), 3);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Note {
    text: String,
}

#[tokio_timeout_test(10)]
async fn typed_messages_are_confirmed_by_the_receiver() {
    let link = Link::new().await;
    let options = TunnelOptions {
        delivery: DeliveryPolicy::AwaitConfirmation { timeout: STEP },
        chunk: TunnelOptions::default().chunk.with_chunk_size_limit(16),
        ..TunnelOptions::default()
    };
    let sender: MessageTunnel<Note> = link
        .initiator
        .new_tunnel(&link.id, DataChannelId(1), options.clone())
        .await
        .expect("initiator tunnel");
    let receiver: MessageTunnel<Note> = link
        .answerer
        .new_tunnel(&link.id, DataChannelId(1), options)
        .await
        .expect("answerer tunnel");
    wait_for(sender.ready_states(), |state| *state == DataChannelState::Open).await;
    wait_for(receiver.ready_states(), |state| *state == DataChannelState::Open).await;
    let mut inbound = receiver.incoming();

    let note = Note {
        text: "split across several chunks".into(),
    };
    let message_id = sender.send_message(note.clone()).await.expect("confirmed");

    let received = timeout(STEP, inbound.recv())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("decoded");
    assert_eq!(
        received,
        Inbound::Message {
            message_id,
            message: note,
        }
    );
}

#[tokio_timeout_test(10)]
async fn unconfirmed_message_times_out() {
    let link = Link::new().await;
    let sender_options = TunnelOptions {
        delivery: DeliveryPolicy::AwaitConfirmation {
            timeout: Duration::from_millis(300),
        },
        ..TunnelOptions::default()
    };
    let receiver_options = TunnelOptions {
        auto_confirm: false,
        ..TunnelOptions::default()
    };
    let sender: MessageTunnel<Note> = link
        .initiator
        .new_tunnel(&link.id, DataChannelId(2), sender_options)
        .await
        .expect("initiator tunnel");
    let receiver: MessageTunnel<Note> = link
        .answerer
        .new_tunnel(&link.id, DataChannelId(2), receiver_options)
        .await
        .expect("answerer tunnel");
    wait_for(sender.ready_states(), |state| *state == DataChannelState::Open).await;
    wait_for(receiver.ready_states(), |state| *state == DataChannelState::Open).await;

    let result = sender
        .send_message(Note {
            text: "nobody answers".into(),
        })
        .await;
    assert!(matches!(
        result,
        Err(LinkError::ConfirmationTimeout(_))
    ));
}

#[tokio_timeout_test(10)]
async fn refused_channel_is_reported_and_not_registered() {
    let link = Link::new().await;
    link.network.refuse_channel(DataChannelId(9));

    let refused = link
        .initiator
        .new_channel(&link.id, DataChannelId(9), DataChannelConfig::default())
        .await;
    assert!(matches!(
        refused,
        Err(LinkError::Peer(PeerError::ChannelCreationFailed {
            channel: DataChannelId(9),
            ..
        }))
    ));
    assert!(link.initiator.channel(&link.id, DataChannelId(9)).await.is_err());

    let (initiator_channel, answerer_channel) = link.open_channels().await;
    let mut at_answerer = answerer_channel.incoming();
    initiator_channel
        .send(Bytes::from_static(b"still usable"))
        .await
        .expect("send");
    assert_eq!(next_bytes(&mut at_answerer).await, Bytes::from_static(b"still usable"));
}

#[tokio_timeout_test(10)]
async fn negotiation_needed_after_connect_renegotiates() {
    let link = Link::new().await;
    let (initiator_channel, answerer_channel) = link.open_channels().await;
    let mut states = link.initiator.negotiation_states(&link.id).await.expect("peer");
    wait_in(&mut states, |state| *state == NegotiationState::Connected).await;
    let mut answerer_states = link.answerer.negotiation_states(&link.id).await.expect("peer");
    wait_in(&mut answerer_states, |state| *state == NegotiationState::Connected).await;
    let instance = link.initiator.peer_connection(&link.id).await.expect("peer").instance();

    // the answerer has no offer flow; its request is only logged
    assert!(link.network.renegotiate(&link.id, NegotiationRole::Answerer));
    assert!(link.network.renegotiate(&link.id, NegotiationRole::Initiator));
    wait_in(&mut states, |state| *state == NegotiationState::Negotiating).await;
    wait_in(&mut states, |state| *state == NegotiationState::Connected).await;

    let connection = link.initiator.peer_connection(&link.id).await.expect("peer");
    assert_eq!(connection.instance(), instance);
    wait_in(&mut answerer_states, |state| *state == NegotiationState::Negotiating).await;
    wait_in(&mut answerer_states, |state| *state == NegotiationState::Connected).await;
    assert_eq!(link.network.created(), 2);

    let mut at_answerer = answerer_channel.incoming();
    initiator_channel
        .send(Bytes::from_static(b"after renegotiation"))
        .await
        .expect("send");
    assert_eq!(
        next_bytes(&mut at_answerer).await,
        Bytes::from_static(b"after renegotiation")
    );
}

#[tokio_timeout_test(10)]
async fn every_view_of_a_channel_shares_one_confirmation() {
    let link = Link::new().await;
    let channel = DataChannelId(7);
    let options = TunnelOptions::default();
    let sender: MessageTunnel<Note> = link
        .initiator
        .new_tunnel(&link.id, channel, options.clone())
        .await
        .expect("initiator tunnel");
    let receiver: MessageTunnel<Note> = link
        .answerer
        .new_tunnel(&link.id, channel, options.clone())
        .await
        .expect("answerer tunnel");
    let second_view: MessageTunnel<Note> = link
        .answerer
        .tunnel(&link.id, channel, &options)
        .await
        .expect("second view");
    wait_for(sender.ready_states(), |state| *state == DataChannelState::Open).await;
    wait_for(receiver.ready_states(), |state| *state == DataChannelState::Open).await;
    let mut at_sender = sender.incoming();
    let mut at_second_view = second_view.incoming();

    let note = Note { text: "once".into() };
    let message_id = sender.send_message(note.clone()).await.expect("send");
    let received = timeout(STEP, at_second_view.recv())
        .await
        .expect("timed out")
        .expect("stream ended")
        .expect("decoded");
    assert_eq!(
        received,
        Inbound::Message {
            message_id: message_id.clone(),
            message: note,
        }
    );

    let mut confirmations = 0;
    let _ = timeout(Duration::from_millis(500), async {
        while let Some(item) = at_sender.recv().await {
            if item == Ok(Inbound::Confirmation(message_id.clone())) {
                confirmations += 1;
            }
        }
    })
    .await;
    assert_eq!(confirmations, 1);

    let other_type = link.answerer.tunnel::<String>(&link.id, channel, &options).await;
    assert!(matches!(
        other_type,
        Err(LinkError::Peer(PeerError::MessageTypeMismatch { .. }))
    ));
}

#[tokio_timeout_test(30)]
#[ignore = "opens real webrtc sockets on loopback"]
async fn webrtc_loopback_carries_messages() {
    let relay = MemoryRelay::new();
    let initiator = RtcClient::with_webrtc(WebRtcConfig::local_only()).expect("webrtc");
    let answerer = RtcClient::with_webrtc(WebRtcConfig::local_only()).expect("webrtc");
    let id = secrets().connection_id();
    answerer
        .new_connection(id, NegotiationRole::Answerer, signaling(&relay, ClientSource::Wallet))
        .await
        .expect("answerer connection");
    initiator
        .new_connection(id, NegotiationRole::Initiator, signaling(&relay, ClientSource::Extension))
        .await
        .expect("initiator connection");

    let initiator_channel = initiator
        .new_channel(&id, CHANNEL, DataChannelConfig::default())
        .await
        .expect("initiator channel");
    let answerer_channel = answerer
        .new_channel(&id, CHANNEL, DataChannelConfig::default())
        .await
        .expect("answerer channel");
    wait_open(&initiator_channel).await;
    wait_open(&answerer_channel).await;

    let mut at_answerer = answerer_channel.incoming();
    initiator_channel
        .send(Bytes::from_static(b"Hey Answerer"))
        .await
        .expect("send");
    assert_eq!(next_bytes(&mut at_answerer).await, Bytes::from_static(b"Hey Answerer"));

    initiator.disconnect_all().await;
    answerer.disconnect_all().await;
}
