//! Native WebRTC backend
//!
//! Wraps the `webrtc` crate. Callbacks registered on the peer connection and data channel
//! only forward into the session's [`RtcEventSink`]; all decisions happen in
//! [`NegotiationSession`](super::NegotiationSession).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
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
    DataChannel, LinkState, NegotiationError, NegotiationResult, PeerConnection, RtcEventKind,
    RtcEventSink, RtcFactory,
};
use crate::protocol::{ChannelFrame, IceCandidate, PeerId, SdpKind, SessionDescription};

impl From<webrtc::Error> for NegotiationError {
    fn from(e: webrtc::Error) -> Self {
        NegotiationError::Backend(e.to_string())
    }
}

/// Creates native peer connections
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    /// Build the WebRTC API with default codecs and interceptors
    pub fn new(ice_servers: Vec<String>) -> NegotiationResult<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(WebRtcFactory { api, ice_servers })
    }
}

#[async_trait]
impl RtcFactory for WebRtcFactory {
    async fn new_connection(
        &self,
        remote: &PeerId,
        events: RtcEventSink,
    ) -> NegotiationResult<Arc<dyn PeerConnection>> {
        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        debug!("Created peer connection for {}", remote);

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => sink.emit(RtcEventKind::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Cannot serialize local candidate: {}", e),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.emit(RtcEventKind::LinkState(link_state(state)));
            })
        }));

        let sink = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sink = sink.clone();
            Box::pin(async move {
                debug!("Remote opened data channel '{}'", dc.label());
                attach_channel(dc, sink);
            })
        }));

        Ok(Arc::new(WebRtcConnection { pc, events }))
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn to_rtc(description: SessionDescription) -> NegotiationResult<RTCSessionDescription> {
    Ok(match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
    })
}

/// Forward a data channel's lifecycle and messages into `sink`
fn attach_channel(dc: Arc<RTCDataChannel>, sink: RtcEventSink) {
    let channel: Arc<dyn DataChannel> = Arc::new(WebRtcChannel { dc: dc.clone() });

    let open_sink = sink.clone();
    dc.on_open(Box::new(move || {
        let sink = open_sink.clone();
        let channel = channel.clone();
        Box::pin(async move {
            sink.emit(RtcEventKind::ChannelOpen(channel));
        })
    }));

    let close_sink = sink.clone();
    dc.on_close(Box::new(move || {
        let sink = close_sink.clone();
        Box::pin(async move {
            sink.emit(RtcEventKind::ChannelClosed);
        })
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sink = sink.clone();
        Box::pin(async move {
            let frame = if msg.is_string {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => ChannelFrame::Text(text),
                    Err(e) => {
                        warn!("Dropping non UTF-8 text frame: {}", e);
                        return;
                    }
                }
            } else {
                ChannelFrame::Binary(msg.data)
            };
            sink.emit(RtcEventKind::Frame(frame));
        })
    }));
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: RtcEventSink,
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> NegotiationResult<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> NegotiationResult<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> NegotiationResult<()> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> NegotiationResult<()> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> NegotiationResult<()> {
        if candidate.candidate.is_empty() {
            // End-of-candidates marker
            return Ok(());
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> NegotiationResult<()> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        attach_channel(dc, self.events.clone());
        Ok(())
    }

    async fn close(&self) -> NegotiationResult<()> {
        self.pc.close().await?;
        Ok(())
    }
}

struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("label", &self.dc.label())
            .field("state", &self.dc.ready_state())
            .finish()
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    async fn send_text(&self, text: &str) -> NegotiationResult<()> {
        self.dc.send_text(text.to_string()).await?;
        Ok(())
    }

    async fn send_binary(&self, data: Bytes) -> NegotiationResult<()> {
        self.dc.send(&data).await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) -> NegotiationResult<()> {
        self.dc.close().await?;
        Ok(())
    }
}
