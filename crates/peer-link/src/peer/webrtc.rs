//! [`PeerTransport`] over webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::{
    DataChannelHandle, PeerError, PeerEvent, PeerTransport, PeerTransportFactory,
    SessionDescription,
};
use crate::config::{DataChannelConfig, WebRtcConfig};
use crate::model::{
    Answer, DataChannelId, DataChannelState, IceCandidate, NegotiationRole, Offer,
    PeerConnectionId, PeerConnectionState,
};

fn to_transport_error<E: std::fmt::Display>(err: E) -> PeerError {
    PeerError::Transport(err.to_string())
}

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_transport_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_transport_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn map_channel_state(state: RTCDataChannelState) -> DataChannelState {
    match state {
        RTCDataChannelState::Unspecified | RTCDataChannelState::Connecting => {
            DataChannelState::Connecting
        }
        RTCDataChannelState::Open => DataChannelState::Open,
        RTCDataChannelState::Closing => DataChannelState::Closing,
        RTCDataChannelState::Closed => DataChannelState::Closed,
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match description {
        SessionDescription::Offer(offer) => RTCSessionDescription::offer(offer.sdp),
        SessionDescription::Answer(answer) => RTCSessionDescription::answer(answer.sdp),
    };
    result.map_err(|err| PeerError::InvalidDescription(err.to_string()))
}

fn to_candidate_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

fn from_rtc_candidate(candidate: &RTCIceCandidate) -> Result<IceCandidate, PeerError> {
    let init = candidate.to_json().map_err(to_transport_error)?;
    Ok(IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    })
}

/// Builds one `RTCPeerConnection` per peer connection instance.
pub struct WebRtcTransportFactory {
    api: API,
}

impl WebRtcTransportFactory {
    pub fn new() -> Result<Self, PeerError> {
        Ok(Self { api: build_api()? })
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        id: &PeerConnectionId,
        role: NegotiationRole,
        config: &WebRtcConfig,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let configuration = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(configuration)
                .await
                .map_err(to_transport_error)?,
        );
        let (events, events_rx) = mpsc::unbounded_channel();
        register_connection_callbacks(&pc, *id, role, events.clone());
        debug!(target = "peer_link::peer::webrtc", peer = %id, ?role, "peer connection created");
        Ok(Arc::new(WebRtcTransport {
            pc,
            events,
            events_rx: Mutex::new(Some(events_rx)),
        }))
    }
}

fn register_connection_callbacks(
    pc: &Arc<RTCPeerConnection>,
    id: PeerConnectionId,
    role: NegotiationRole,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            trace!(target = "peer_link::peer::webrtc", peer = %id, "negotiation needed");
            let _ = tx.send(PeerEvent::NegotiationNeeded);
        })
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            // `None` marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            match from_rtc_candidate(&candidate) {
                Ok(candidate) => {
                    let _ = tx.send(PeerEvent::IceCandidate(candidate));
                }
                Err(err) => warn!(
                    target = "peer_link::peer::webrtc",
                    peer = %id,
                    error = %err,
                    "failed to serialize local candidate"
                ),
            }
        })
    }));

    let tx = events;
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(target = "peer_link::peer::webrtc", peer = %id, ?role, ?state, "peer connection state changed");
            let _ = tx.send(PeerEvent::ConnectionState(map_connection_state(state)));
        })
    }));
}

struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<Offer, PeerError> {
        let description = self.pc.create_offer(None).await.map_err(to_transport_error)?;
        Ok(Offer {
            sdp: description.sdp,
        })
    }

    async fn create_answer(&self) -> Result<Answer, PeerError> {
        let description = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| match err {
                webrtc::Error::ErrNoRemoteDescription => PeerError::NoRemoteDescription,
                other => to_transport_error(other),
            })?;
        Ok(Answer {
            sdp: description.sdp,
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(to_transport_error)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(to_transport_error)
    }

    async fn add_remote_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(to_candidate_init(candidate))
            .await
            .map_err(|err| match err {
                webrtc::Error::ErrNoRemoteDescription => PeerError::NoRemoteDescription,
                other => to_transport_error(other),
            })
    }

    async fn remove_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<(), PeerError> {
        // webrtc-rs has no API for withdrawing remote candidates
        debug!(
            target = "peer_link::peer::webrtc",
            count = candidates.len(),
            "ignoring remote candidate removal"
        );
        Ok(())
    }

    async fn open_data_channel(
        &self,
        channel: DataChannelId,
        config: DataChannelConfig,
    ) -> Result<Arc<dyn DataChannelHandle>, PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(config.ordered),
            max_retransmits: config.max_retransmits,
            negotiated: config.negotiated.then_some(channel.0),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(&channel.label(), Some(init))
            .await
            .map_err(|err| PeerError::ChannelCreationFailed {
                channel,
                reason: err.to_string(),
            })?;
        register_channel_callbacks(&dc, channel, self.events.clone());
        Ok(Arc::new(WebRtcChannel { channel, dc }))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    fn connection_state(&self) -> PeerConnectionState {
        map_connection_state(self.pc.connection_state())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            warn!(target = "peer_link::peer::webrtc", error = %err, "failed to close peer connection");
        }
    }
}

fn register_channel_callbacks(
    dc: &Arc<RTCDataChannel>,
    channel: DataChannelId,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            debug!(target = "peer_link::peer::webrtc", channel = channel.0, "data channel opened");
            let _ = tx.send(PeerEvent::ChannelState {
                channel,
                state: DataChannelState::Open,
            });
        })
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ChannelMessage {
                channel,
                data: msg.data,
            });
        })
    }));

    dc.on_error(Box::new(move |err| {
        Box::pin(async move {
            warn!(target = "peer_link::peer::webrtc", channel = channel.0, error = %err, "data channel error");
        })
    }));

    let tx = events;
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            trace!(target = "peer_link::peer::webrtc", channel = channel.0, "data channel closed");
            let _ = tx.send(PeerEvent::ChannelState {
                channel,
                state: DataChannelState::Closed,
            });
        })
    }));
}

struct WebRtcChannel {
    channel: DataChannelId,
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannelHandle for WebRtcChannel {
    fn id(&self) -> DataChannelId {
        self.channel
    }

    fn ready_state(&self) -> DataChannelState {
        map_channel_state(self.dc.ready_state())
    }

    async fn send(&self, data: Bytes) -> Result<(), PeerError> {
        if self.dc.ready_state() != RTCDataChannelState::Open {
            return Err(PeerError::ChannelNotOpen(self.channel));
        }
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(to_transport_error)
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            debug!(
                target = "peer_link::peer::webrtc",
                channel = self.channel.0,
                error = %err,
                "data channel close failed"
            );
        }
    }
}
