//! Peer backend on top of the `webrtc` crate

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::{
    ChannelPayload, ConnectionState, DataChannel, PeerConnection, PeerConnector, PeerError,
    PeerEvent, PeerEventSink, SignalingState,
};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

pub struct RtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, PeerError> {
        // codecs are registered even though only data channels are used
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            vec![]
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(self.configuration()).await?);
        let remote = events.remote().clone();

        let state_sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let sink = state_sink.clone();
            Box::pin(async move {
                info!("Peer connection to {} is {:?}", sink.remote(), s);
                sink.emit(PeerEvent::StateChanged(connection_state(s)));
            })
        }));

        let ice_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |c: Option<RTCIceCandidate>| {
            let sink = ice_sink.clone();
            Box::pin(async move {
                let candidate = match c {
                    Some(c) => match c.to_json() {
                        Ok(init) => Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                        Err(e) => {
                            warn!("Dropping unencodable local candidate: {}", e);
                            return;
                        }
                    },
                    None => None,
                };
                sink.emit(PeerEvent::LocalCandidate(candidate));
            })
        }));

        let dc_sink = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = dc_sink.clone();
            Box::pin(async move {
                debug!("Data channel '{}' announced by {}", dc.label(), sink.remote());
                let channel = RtcChannel::wire(dc, sink.clone());
                sink.emit(PeerEvent::DataChannel(channel));
            })
        }));

        debug!("Created peer connection for {}", remote);
        Ok(Arc::new(RtcPeer { pc, events }))
    }
}

fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSink,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError> {
        let dc = self.pc.create_data_channel(label, None).await?;
        Ok(RtcChannel::wire(dc, self.events.clone()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }
}

struct RtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

impl RtcChannel {
    /// Route inbound messages into the session's event queue
    fn wire(dc: Arc<RTCDataChannel>, sink: PeerEventSink) -> Arc<dyn DataChannel> {
        let label = dc.label().to_string();

        let msg_label = label.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sink = sink.clone();
            let label = msg_label.clone();
            Box::pin(async move {
                let payload = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => ChannelPayload::Text(text),
                        Err(_) => {
                            warn!("Non UTF-8 text message on '{}' from {}", label, sink.remote());
                            return;
                        }
                    }
                } else {
                    ChannelPayload::Binary(msg.data)
                };
                sink.emit(PeerEvent::ChannelMessage { label, payload });
            })
        }));

        Arc::new(RtcChannel { label, dc })
    }
}

#[async_trait]
impl DataChannel for RtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, payload: ChannelPayload) -> Result<(), PeerError> {
        match payload {
            ChannelPayload::Text(text) => self.dc.send_text(text).await?,
            ChannelPayload::Binary(data) => self.dc.send(&data).await?,
        };
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.dc.close().await?;
        Ok(())
    }
}
