//! WebRTC peer connection backed by webrtc-rs

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::config::WebRtcConfig;
use super::connection::{PeerEvent, RtcConnection, RtcConnectionFactory};
use super::signaling::{
    ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState, TrackKind,
};
use crate::error::{AppError, Result};
use crate::media::LocalTrack;

struct SenderSlot {
    sender: Arc<RTCRtpSender>,
    track_id: Option<String>,
}

/// Peer connection wrapper with event forwarding
pub struct PeerConnection {
    participant_id: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, SenderSlot>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl PeerConnection {
    /// Create a new peer connection and wire its callbacks to `events`
    pub async fn new(
        api: &API,
        ice_servers: Vec<RTCIceServer>,
        participant_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self> {
        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let (state_tx, state_rx) = watch::channel(ConnectionState::New);

        let peer = Self {
            participant_id: participant_id.to_string(),
            pc: Arc::new(pc),
            senders: Mutex::new(HashMap::new()),
            state_rx,
        };

        peer.setup_event_handlers(generation, events, state_tx);

        Ok(peer)
    }

    fn setup_event_handlers(
        &self,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
        state_tx: watch::Sender<ConnectionState>,
    ) {
        let state_tx = Arc::new(state_tx);

        // Connection state change handler
        let participant_id = self.participant_id.clone();
        let state_events = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let participant_id = participant_id.clone();
                let events = state_events.clone();
                let state_tx = state_tx.clone();

                Box::pin(async move {
                    let new_state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    info!("Peer {} connection state: {}", participant_id, new_state);
                    let _ = state_tx.send(new_state);
                    let _ = events.send(PeerEvent::StateChanged {
                        participant_id,
                        generation,
                        state: new_state,
                    });
                })
            }));

        // ICE candidate handler
        let participant_id = self.participant_id.clone();
        let ice_events = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let participant_id = participant_id.clone();
                let events = ice_events.clone();

                Box::pin(async move {
                    let Some(c) = candidate else {
                        debug!("ICE gathering complete for {}", participant_id);
                        return;
                    };
                    let init = match c.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            debug!("Failed to serialize ICE candidate: {}", e);
                            return;
                        }
                    };

                    trace!("Local ICE candidate for {}: {}", participant_id, init.candidate);
                    let _ = events.send(PeerEvent::IceCandidate {
                        participant_id,
                        generation,
                        candidate: IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        },
                    });
                })
            }));

        // Remote track handler
        let participant_id = self.participant_id.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let participant_id = participant_id.clone();
                let events = events.clone();

                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    let stream_id = track.stream_id();

                    info!(
                        "Remote {} track from {} (stream {})",
                        kind, participant_id, stream_id
                    );
                    let _ = events.send(PeerEvent::RemoteTrack {
                        participant_id,
                        generation,
                        stream_id,
                        kind,
                    });

                    // Keep the receive pipeline flowing; rendering happens elsewhere
                    tokio::spawn(async move { while track.read_rtp().await.is_ok() {} });
                })
            },
        ));
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            return Ok(rollback);
        }
    };
    parsed.map_err(|e| AppError::Negotiation(format!("Invalid SDP: {}", e)))
}

#[async_trait]
impl RtcConnection for PeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then_some(RTCOfferOptions {
            voice_activity_detection: false,
            ice_restart: true,
        });

        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create offer: {}", e)))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create answer: {}", e)))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc.set_local_description(desc).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set local description: {}", e))
        })
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc.set_remote_description(desc).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set remote description: {}", e))
        })
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::Ice(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    async fn set_track(&self, kind: TrackKind, track: Option<Arc<LocalTrack>>) -> Result<()> {
        let existing = self.senders.lock().get(&kind).map(|slot| slot.sender.clone());
        let track_id = track.as_ref().map(|t| t.id().to_string());

        match (existing, track) {
            (Some(sender), track) => {
                sender
                    .replace_track(track.map(|t| t.as_track_local()))
                    .await
                    .map_err(|e| {
                        AppError::WebRtcError(format!("Failed to replace {} track: {}", kind, e))
                    })?;
                if let Some(slot) = self.senders.lock().get_mut(&kind) {
                    slot.track_id = track_id;
                }
            }
            (None, Some(track)) => {
                let sender = self
                    .pc
                    .add_track(track.as_track_local())
                    .await
                    .map_err(|e| {
                        AppError::WebRtcError(format!("Failed to add {} track: {}", kind, e))
                    })?;

                // Drain RTCP so interceptors keep working
                let rtcp_sender = sender.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1500];
                    while rtcp_sender.read(&mut buf).await.is_ok() {}
                });

                self.senders
                    .lock()
                    .insert(kind, SenderSlot { sender, track_id });
            }
            (None, None) => {}
        }

        debug!("Peer {} {} sender now {:?}", self.participant_id, kind, self.sender_track_id(kind));
        Ok(())
    }

    fn sender_track_id(&self, kind: TrackKind) -> Option<String> {
        self.senders
            .lock()
            .get(&kind)
            .and_then(|slot| slot.track_id.clone())
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

/// Builds webrtc-rs connections sharing one API instance
pub struct PeerConnectionFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl PeerConnectionFactory {
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();

        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers(),
        })
    }
}

#[async_trait]
impl RtcConnectionFactory for PeerConnectionFactory {
    async fn create(
        &self,
        participant_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcConnection>> {
        let peer = PeerConnection::new(
            &self.api,
            self.ice_servers.clone(),
            participant_id,
            generation,
            events,
        )
        .await?;
        Ok(Arc::new(peer))
    }
}
