//! In-process peer transport with fake SDP and ICE.
//!
//! Two transports connect once each has its local description set, holds the
//! other's description as remote, and has applied one of the other's
//! candidates. Channels are negotiated by id: a channel opens when both
//! connected ends have opened the same id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    DataChannelHandle, PeerError, PeerEvent, PeerTransport, PeerTransportFactory,
    SessionDescription,
};
use crate::config::{DataChannelConfig, WebRtcConfig};
use crate::model::{
    Answer, DataChannelId, DataChannelState, IceCandidate, NegotiationRole, Offer,
    PeerConnectionId, PeerConnectionState,
};

const SDP_PREFIX: &str = "v=0 memory ";
const CANDIDATE_PREFIX: &str = "candidate:memory ";

#[derive(Clone, Default)]
pub struct MemoryPeerNetwork {
    state: Arc<Mutex<Network>>,
}

#[derive(Default)]
struct Network {
    peers: HashMap<String, PeerSlot>,
    created: Vec<String>,
    refused_channels: HashSet<DataChannelId>,
}

struct PeerSlot {
    id: PeerConnectionId,
    role: NegotiationRole,
    events: mpsc::UnboundedSender<PeerEvent>,
    local_set: bool,
    remote: Option<String>,
    candidates_seen: HashSet<String>,
    state: PeerConnectionState,
    channels: BTreeMap<DataChannelId, DataChannelState>,
}

impl PeerSlot {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&mut self, state: PeerConnectionState) {
        if self.state != state {
            self.state = state;
            self.emit(PeerEvent::ConnectionState(state));
        }
    }

    fn set_channel_state(&mut self, channel: DataChannelId, state: DataChannelState) {
        if let Some(current) = self.channels.get_mut(&channel) {
            if *current != state {
                *current = state;
                let _ = self.events.send(PeerEvent::ChannelState { channel, state });
            }
        }
    }

    fn is_live(&self) -> bool {
        !matches!(
            self.state,
            PeerConnectionState::Closed | PeerConnectionState::Failed
        )
    }

    fn close_channels(&mut self) {
        let ids: Vec<DataChannelId> = self.channels.keys().copied().collect();
        for channel in ids {
            self.set_channel_state(channel, DataChannelState::Closed);
        }
    }
}

impl Network {
    /// Key of the newest live transport for `id` and `role`.
    fn newest_live(&self, id: &PeerConnectionId, role: NegotiationRole) -> Option<String> {
        self.created
            .iter()
            .rev()
            .find(|key| {
                self.peers
                    .get(*key)
                    .map(|slot| slot.id == *id && slot.role == role && slot.is_live())
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn slot(&mut self, key: &str) -> Result<&mut PeerSlot, PeerError> {
        self.peers.get_mut(key).ok_or(PeerError::Closed)
    }

    /// The peer `key` talks to, if both ends point at each other.
    fn linked(&self, key: &str) -> Option<String> {
        let slot = self.peers.get(key)?;
        let remote_key = slot.remote.as_ref()?;
        let remote = self.peers.get(remote_key)?;
        (remote.remote.as_deref() == Some(key)).then(|| remote_key.clone())
    }

    fn try_connect(&mut self, key: &str) {
        let Some(slot) = self.peers.get_mut(key) else {
            return;
        };
        let reachable = slot
            .remote
            .as_ref()
            .map(|remote| slot.candidates_seen.contains(remote))
            .unwrap_or(false);
        if !slot.is_live() || !slot.local_set || !reachable {
            return;
        }
        if slot.state != PeerConnectionState::Connected {
            slot.set_state(PeerConnectionState::Connecting);
            slot.set_state(PeerConnectionState::Connected);
            debug!(target = "peer_link::peer::memory", peer = %slot.id, role = ?slot.role, "connected");
        }
        self.open_shared_channels(key);
    }

    /// Opens channels both ends have created, once both ends are connected.
    fn open_shared_channels(&mut self, key: &str) {
        let Some(remote_key) = self.linked(key) else {
            return;
        };
        let both_connected = [key, remote_key.as_str()].iter().all(|k| {
            self.peers
                .get(*k)
                .map(|slot| slot.state == PeerConnectionState::Connected)
                .unwrap_or(false)
        });
        if !both_connected {
            return;
        }
        let shared: Vec<DataChannelId> = {
            let local = &self.peers[key].channels;
            let remote = &self.peers[&remote_key].channels;
            local
                .iter()
                .filter_map(|(id, state)| {
                    let remote_state = remote.get(id)?;
                    let pending = *state == DataChannelState::Connecting
                        || *remote_state == DataChannelState::Connecting;
                    let closed = *state == DataChannelState::Closed
                        || *remote_state == DataChannelState::Closed;
                    (pending && !closed).then_some(*id)
                })
                .collect()
        };
        for channel in shared {
            for k in [key, remote_key.as_str()] {
                if let Some(slot) = self.peers.get_mut(k) {
                    slot.set_channel_state(channel, DataChannelState::Open);
                }
            }
        }
    }
}

impl MemoryPeerNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces the newest live transport for `id` and `role` into `Failed`.
    pub fn fail(&self, id: &PeerConnectionId, role: NegotiationRole) -> bool {
        let mut network = self.state.lock();
        let key = network.newest_live(id, role);
        match key.and_then(|key| network.peers.get_mut(&key)) {
            Some(slot) => {
                slot.close_channels();
                slot.set_state(PeerConnectionState::Failed);
                true
            }
            None => false,
        }
    }

    /// Makes the newest live transport for `id` and `role` ask for negotiation again.
    pub fn renegotiate(&self, id: &PeerConnectionId, role: NegotiationRole) -> bool {
        let mut network = self.state.lock();
        let key = network.newest_live(id, role);
        match key.and_then(|key| network.peers.get_mut(&key)) {
            Some(slot) => {
                slot.emit(PeerEvent::NegotiationNeeded);
                true
            }
            None => false,
        }
    }

    /// Every transport refuses to open `channel` from now on.
    pub fn refuse_channel(&self, channel: DataChannelId) {
        self.state.lock().refused_channels.insert(channel);
    }

    /// Transports created so far, including closed ones.
    pub fn created(&self) -> usize {
        self.state.lock().created.len()
    }
}

#[async_trait]
impl PeerTransportFactory for MemoryPeerNetwork {
    async fn create(
        &self,
        id: &PeerConnectionId,
        role: NegotiationRole,
        _config: &WebRtcConfig,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let key = Uuid::new_v4().simple().to_string();
        let (events, events_rx) = mpsc::unbounded_channel();
        let mut network = self.state.lock();
        network.peers.insert(
            key.clone(),
            PeerSlot {
                id: *id,
                role,
                events,
                local_set: false,
                remote: None,
                candidates_seen: HashSet::new(),
                state: PeerConnectionState::New,
                channels: BTreeMap::new(),
            },
        );
        network.created.push(key.clone());
        Ok(Arc::new(MemoryPeer {
            key,
            network: Arc::clone(&self.state),
            events: Mutex::new(Some(events_rx)),
        }))
    }
}

struct MemoryPeer {
    key: String,
    network: Arc<Mutex<Network>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

fn sdp_key(sdp: &str) -> Result<String, PeerError> {
    sdp.strip_prefix(SDP_PREFIX)
        .map(str::to_owned)
        .ok_or_else(|| PeerError::InvalidDescription(sdp.to_owned()))
}

#[async_trait]
impl PeerTransport for MemoryPeer {
    async fn create_offer(&self) -> Result<Offer, PeerError> {
        self.network.lock().slot(&self.key)?;
        Ok(Offer {
            sdp: format!("{SDP_PREFIX}{}", self.key),
        })
    }

    async fn create_answer(&self) -> Result<Answer, PeerError> {
        let mut network = self.network.lock();
        if network.slot(&self.key)?.remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        Ok(Answer {
            sdp: format!("{SDP_PREFIX}{}", self.key),
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        let sdp = match &description {
            SessionDescription::Offer(offer) => &offer.sdp,
            SessionDescription::Answer(answer) => &answer.sdp,
        };
        if sdp_key(sdp)? != self.key {
            return Err(PeerError::InvalidDescription(sdp.clone()));
        }
        let mut network = self.network.lock();
        let slot = network.slot(&self.key)?;
        slot.local_set = true;
        slot.emit(PeerEvent::IceCandidate(IceCandidate {
            candidate: format!("{CANDIDATE_PREFIX}{}", self.key),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
        network.try_connect(&self.key);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        let sdp = match &description {
            SessionDescription::Offer(offer) => &offer.sdp,
            SessionDescription::Answer(answer) => &answer.sdp,
        };
        let remote = sdp_key(sdp)?;
        let mut network = self.network.lock();
        let slot = network.slot(&self.key)?;
        slot.remote = Some(remote);
        network.try_connect(&self.key);
        Ok(())
    }

    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let mut network = self.network.lock();
        let slot = network.slot(&self.key)?;
        if slot.remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        if let Some(key) = candidate.candidate.strip_prefix(CANDIDATE_PREFIX) {
            slot.candidates_seen.insert(key.to_owned());
        }
        network.try_connect(&self.key);
        Ok(())
    }

    async fn remove_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<(), PeerError> {
        let mut network = self.network.lock();
        let slot = network.slot(&self.key)?;
        for candidate in &candidates {
            if let Some(key) = candidate.candidate.strip_prefix(CANDIDATE_PREFIX) {
                slot.candidates_seen.remove(key);
            }
        }
        Ok(())
    }

    async fn open_data_channel(
        &self,
        channel: DataChannelId,
        _config: DataChannelConfig,
    ) -> Result<Arc<dyn DataChannelHandle>, PeerError> {
        let mut network = self.network.lock();
        let slot = network.slot(&self.key)?;
        if !slot.is_live() {
            return Err(PeerError::Closed);
        }
        if network.refused_channels.contains(&channel) {
            return Err(PeerError::ChannelCreationFailed {
                channel,
                reason: "refused by the peer network".into(),
            });
        }
        let slot = network.slot(&self.key)?;
        if slot.channels.contains_key(&channel) {
            return Err(PeerError::ChannelCreationFailed {
                channel,
                reason: "channel id already in use".into(),
            });
        }
        let first = slot.channels.is_empty();
        slot.channels.insert(channel, DataChannelState::Connecting);
        slot.emit(PeerEvent::ChannelState {
            channel,
            state: DataChannelState::Connecting,
        });
        if first {
            slot.emit(PeerEvent::NegotiationNeeded);
        }
        network.open_shared_channels(&self.key);
        Ok(Arc::new(MemoryChannel {
            key: self.key.clone(),
            channel,
            network: Arc::clone(&self.network),
        }))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().take()
    }

    fn connection_state(&self) -> PeerConnectionState {
        self.network
            .lock()
            .peers
            .get(&self.key)
            .map(|slot| slot.state)
            .unwrap_or(PeerConnectionState::Closed)
    }

    async fn close(&self) {
        let mut network = self.network.lock();
        if let Some(slot) = network.peers.get_mut(&self.key) {
            slot.close_channels();
            slot.set_state(PeerConnectionState::Closed);
        }
    }
}

struct MemoryChannel {
    key: String,
    channel: DataChannelId,
    network: Arc<Mutex<Network>>,
}

#[async_trait]
impl DataChannelHandle for MemoryChannel {
    fn id(&self) -> DataChannelId {
        self.channel
    }

    fn ready_state(&self) -> DataChannelState {
        self.network
            .lock()
            .peers
            .get(&self.key)
            .and_then(|slot| slot.channels.get(&self.channel).copied())
            .unwrap_or(DataChannelState::Closed)
    }

    async fn send(&self, data: Bytes) -> Result<(), PeerError> {
        let network = self.network.lock();
        let open = |key: &str| {
            network
                .peers
                .get(key)
                .and_then(|slot| slot.channels.get(&self.channel))
                == Some(&DataChannelState::Open)
        };
        if !open(&self.key) {
            return Err(PeerError::ChannelNotOpen(self.channel));
        }
        let remote = network
            .linked(&self.key)
            .filter(|remote| open(remote))
            .ok_or(PeerError::ChannelNotOpen(self.channel))?;
        network.peers[&remote].emit(PeerEvent::ChannelMessage {
            channel: self.channel,
            data,
        });
        Ok(())
    }

    async fn close(&self) {
        let mut network = self.network.lock();
        // a dead transport cannot tell its remote
        let live = network
            .peers
            .get(&self.key)
            .map(PeerSlot::is_live)
            .unwrap_or(false);
        let remote = network.linked(&self.key).filter(|_| live);
        for key in std::iter::once(self.key.clone()).chain(remote) {
            if let Some(slot) = network.peers.get_mut(&key) {
                slot.set_channel_state(self.channel, DataChannelState::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair(network: &MemoryPeerNetwork) -> (Arc<dyn PeerTransport>, Arc<dyn PeerTransport>) {
        let id = PeerConnectionId::new([7; 32]);
        let config = WebRtcConfig::local_only();
        let a = network
            .create(&id, NegotiationRole::Initiator, &config)
            .await
            .expect("initiator");
        let b = network
            .create(&id, NegotiationRole::Answerer, &config)
            .await
            .expect("answerer");
        (a, b)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn candidate_of(events: &[PeerEvent]) -> IceCandidate {
        events
            .iter()
            .find_map(|event| match event {
                PeerEvent::IceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .expect("candidate event")
    }

    #[tokio::test]
    async fn offer_answer_and_candidates_connect_and_open_channels() {
        let network = MemoryPeerNetwork::new();
        let (a, b) = pair(&network).await;
        let mut a_events = a.take_events().expect("events");
        let mut b_events = b.take_events().expect("events");
        assert!(a.take_events().is_none());

        let a_channel = a
            .open_data_channel(DataChannelId(0), DataChannelConfig::default())
            .await
            .expect("channel");
        let b_channel = b
            .open_data_channel(DataChannelId(0), DataChannelConfig::default())
            .await
            .expect("channel");
        assert!(drain(&mut a_events).contains(&PeerEvent::NegotiationNeeded));
        drain(&mut b_events);

        let offer = a.create_offer().await.expect("offer");
        a.set_local_description(SessionDescription::Offer(offer.clone()))
            .await
            .expect("local");
        let a_candidate = candidate_of(&drain(&mut a_events));

        assert_eq!(
            b.add_remote_ice_candidate(a_candidate.clone()).await,
            Err(PeerError::NoRemoteDescription)
        );
        b.set_remote_description(SessionDescription::Offer(offer))
            .await
            .expect("remote");
        let answer = b.create_answer().await.expect("answer");
        b.set_local_description(SessionDescription::Answer(answer.clone()))
            .await
            .expect("local");
        b.add_remote_ice_candidate(a_candidate).await.expect("candidate");
        let b_candidate = candidate_of(&drain(&mut b_events));
        assert_eq!(b.connection_state(), PeerConnectionState::Connected);

        a.set_remote_description(SessionDescription::Answer(answer))
            .await
            .expect("remote");
        a.add_remote_ice_candidate(b_candidate).await.expect("candidate");
        assert_eq!(a.connection_state(), PeerConnectionState::Connected);
        assert_eq!(a_channel.ready_state(), DataChannelState::Open);
        assert_eq!(b_channel.ready_state(), DataChannelState::Open);

        drain(&mut b_events);
        a_channel.send(Bytes::from_static(b"ping")).await.expect("send");
        assert_eq!(
            drain(&mut b_events),
            vec![PeerEvent::ChannelMessage {
                channel: DataChannelId(0),
                data: Bytes::from_static(b"ping"),
            }]
        );

        b_channel.close().await;
        assert_eq!(a_channel.ready_state(), DataChannelState::Closed);
        assert_eq!(
            a_channel.send(Bytes::from_static(b"late")).await,
            Err(PeerError::ChannelNotOpen(DataChannelId(0)))
        );
    }

    #[tokio::test]
    async fn refused_channel_reports_creation_failure() {
        let network = MemoryPeerNetwork::new();
        let (a, _b) = pair(&network).await;
        network.refuse_channel(DataChannelId(3));

        let refused = a
            .open_data_channel(DataChannelId(3), DataChannelConfig::default())
            .await;
        assert!(matches!(
            refused,
            Err(PeerError::ChannelCreationFailed { channel: DataChannelId(3), .. })
        ));
        assert!(a
            .open_data_channel(DataChannelId(4), DataChannelConfig::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn fail_targets_newest_live_transport() {
        let network = MemoryPeerNetwork::new();
        let (a, _b) = pair(&network).await;
        let id = PeerConnectionId::new([7; 32]);
        assert!(network.fail(&id, NegotiationRole::Initiator));
        assert_eq!(a.connection_state(), PeerConnectionState::Failed);
        assert!(!network.fail(&id, NegotiationRole::Initiator));
        assert_eq!(network.created(), 2);
    }
}
