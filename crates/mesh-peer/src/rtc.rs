//! [`PeerConnector`] backed by webrtc-rs peer connections and data channels.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_proto::{IceCandidate, ParticipantId, SdpKind, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::MeshConfig;
use crate::error::PeerError;
use crate::link::{ConnectionState, DataLink, LinkEvent, LinkEvents, PeerConnector, PeerLink};

fn build_api() -> Result<API, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_setting_engine(SettingEngine::default())
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn rtc_configuration(ice_servers: &[String]) -> RTCConfiguration {
    let ice_servers = if ice_servers.is_empty() {
        vec![]
    } else {
        vec![RTCIceServer {
            urls: ice_servers.to_vec(),
            ..Default::default()
        }]
    };
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

pub(crate) fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn candidate_from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn candidate_to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

pub struct RtcConnector {
    api: API,
    configuration: RTCConfiguration,
}

impl RtcConnector {
    pub fn new(config: &MeshConfig) -> Result<Self, PeerError> {
        Ok(Self {
            api: build_api()?,
            configuration: rtc_configuration(&config.ice_servers),
        })
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn open(
        &self,
        _local: &ParticipantId,
        remote: &ParticipantId,
        events: LinkEvents,
    ) -> Result<Arc<dyn PeerLink>, PeerError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration.clone())
                .await?,
        );
        trace!(target = "mesh::rtc", peer = %remote, "peer connection created");

        let candidates = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidates.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(LinkEvent::LocalCandidate(candidate_from_init(init))),
                    Err(err) => {
                        warn!(target = "mesh::rtc", peer = %events.peer(), error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let states = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = states.clone();
            Box::pin(async move {
                events.emit(LinkEvent::StateChanged(connection_state(state)));
            })
        }));

        let announced = events.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = announced.clone();
            Box::pin(async move {
                debug!(target = "mesh::rtc", peer = %events.peer(), label = channel.label(), "remote data channel announced");
                events.emit(LinkEvent::ChannelAnnounced(RtcDataLink::start(channel.clone())));
                wire_channel(&channel, events);
            })
        }));

        Ok(Arc::new(RtcLink { pc, events }))
    }
}

struct RtcLink {
    pc: Arc<RTCPeerConnection>,
    events: LinkEvents,
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<Arc<dyn DataLink>, PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let channel = self.pc.create_data_channel(label, Some(init)).await?;
        let link = RtcDataLink::start(channel.clone());
        wire_channel(&channel, self.events.clone());
        Ok(link)
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        if offer.kind != SdpKind::Offer {
            return Err(PeerError::UnexpectedDescription {
                expected: SdpKind::Offer,
            });
        }
        self.pc
            .set_remote_description(RTCSessionDescription::offer(offer.sdp)?)
            .await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        if answer.kind != SdpKind::Answer {
            return Err(PeerError::UnexpectedDescription {
                expected: SdpKind::Answer,
            });
        }
        self.pc
            .set_remote_description(RTCSessionDescription::answer(answer.sdp)?)
            .await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc.add_ice_candidate(candidate_to_init(candidate)).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(target = "mesh::rtc", peer = %self.events.peer(), error = %err, "error closing peer connection");
        }
    }
}

fn wire_channel(channel: &Arc<RTCDataChannel>, events: LinkEvents) {
    let opened = events.clone();
    channel.on_open(Box::new(move || {
        let events = opened.clone();
        Box::pin(async move {
            events.emit(LinkEvent::ChannelOpen);
        })
    }));

    let inbound = events.clone();
    channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = inbound.clone();
        Box::pin(async move {
            events.emit(LinkEvent::ChannelMessage(msg.data));
        })
    }));

    let errors = events.clone();
    channel.on_error(Box::new(move |err| {
        let events = errors.clone();
        Box::pin(async move {
            warn!(target = "mesh::rtc", peer = %events.peer(), error = %err, "data channel error");
        })
    }));

    channel.on_close(Box::new(move || {
        let events = events.clone();
        Box::pin(async move {
            events.emit(LinkEvent::ChannelClosed);
        })
    }));
}

/// Outbound side of a data channel. Sends are queued and drained by one
/// task so callers never wait on SCTP.
struct RtcDataLink {
    channel: Arc<RTCDataChannel>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

impl RtcDataLink {
    fn start(channel: Arc<RTCDataChannel>) -> Arc<dyn DataLink> {
        let (outbound, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let sender = channel.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if let Err(err) = sender.send(&data).await {
                    warn!(target = "mesh::rtc", label = sender.label(), error = %err, "data channel send failed");
                }
            }
            trace!(target = "mesh::rtc", label = sender.label(), "sender loop ended");
        });
        Arc::new(RtcDataLink { channel, outbound })
    }
}

impl DataLink for RtcDataLink {
    fn send(&self, data: Bytes) -> Result<(), PeerError> {
        self.outbound.send(data).map_err(|_| PeerError::Closed)
    }

    fn close(&self) {
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(err) = channel.close().await {
                debug!(target = "mesh::rtc", error = %err, "error closing data channel");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn terminal_states_map_to_teardown() {
        assert!(connection_state(RTCPeerConnectionState::Failed).is_terminal());
        assert!(connection_state(RTCPeerConnectionState::Disconnected).is_terminal());
        assert!(connection_state(RTCPeerConnectionState::Closed).is_terminal());
        assert!(!connection_state(RTCPeerConnectionState::Connecting).is_terminal());
        assert_eq!(
            connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[test_timeout::timeout]
    fn candidate_fields_survive_conversion() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("frag".into()),
        };
        let init = candidate_to_init(candidate.clone());
        assert_eq!(init.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate_from_init(init), candidate);
    }

    #[test_timeout::timeout]
    fn ice_servers_collapse_into_one_entry() {
        let configuration = rtc_configuration(&["stun:a:1".into(), "stun:b:2".into()]);
        assert_eq!(configuration.ice_servers.len(), 1);
        assert_eq!(configuration.ice_servers[0].urls.len(), 2);
        assert!(rtc_configuration(&[]).ice_servers.is_empty());
    }

    #[test_timeout::timeout]
    fn connector_builds_without_network() {
        assert!(RtcConnector::new(&MeshConfig::default().localhost()).is_ok());
    }
}
