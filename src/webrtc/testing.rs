//! Scripted connection and signal recorder used by unit tests

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::connection::{PeerEvent, RtcConnection, RtcConnectionFactory};
use super::signaling::{
    ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState, TrackKind,
};
use crate::error::{AppError, Result};
use crate::media::LocalTrack;
use crate::signaling::protocol::ClientMessage;
use crate::signaling::SignalSender;

struct MockState {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    senders: HashMap<TrackKind, Option<String>>,
    offers_created: usize,
    ice_restarts: usize,
    closed: bool,
    fail_offers: bool,
    fail_remote: bool,
}

/// In-memory connection following the offer/answer state machine
pub struct MockConnection {
    owner: String,
    participant_id: String,
    state: Mutex<MockState>,
}

impl MockConnection {
    pub fn new(owner: &str, participant_id: &str) -> Self {
        Self {
            owner: owner.to_string(),
            participant_id: participant_id.to_string(),
            state: Mutex::new(MockState {
                signaling: SignalingState::Stable,
                connection: ConnectionState::New,
                local: None,
                remote: None,
                applied: vec![],
                senders: HashMap::new(),
                offers_created: 0,
                ice_restarts: 0,
                closed: false,
                fail_offers: false,
                fail_remote: false,
            }),
        }
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn ice_restarts(&self) -> usize {
        self.state.lock().ice_restarts
    }

    pub fn has_sender(&self, kind: TrackKind) -> bool {
        self.state.lock().senders.contains_key(&kind)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn fail_offers(&self, fail: bool) {
        self.state.lock().fail_offers = fail;
    }

    pub fn fail_remote_descriptions(&self, fail: bool) {
        self.state.lock().fail_remote = fail;
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.state.lock().connection = state;
    }

    fn check_open(state: &MockState) -> Result<()> {
        if state.closed {
            return Err(AppError::WebRtcError("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RtcConnection for MockConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.fail_offers {
            return Err(AppError::Negotiation("offer refused".to_string()));
        }
        state.offers_created += 1;
        if ice_restart {
            state.ice_restarts += 1;
        }
        Ok(SessionDescription::offer(format!(
            "offer {}->{} #{}",
            self.owner, self.participant_id, state.offers_created
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        Self::check_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(AppError::Negotiation(format!(
                "create_answer in {}",
                state.signaling
            )));
        }
        Ok(SessionDescription::answer(format!(
            "answer {}->{}",
            self.owner, self.participant_id
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        let next = match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(AppError::Negotiation(format!(
                    "local {:?} in {}",
                    kind, current
                )))
            }
        };
        state.signaling = next;
        state.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.fail_remote {
            return Err(AppError::Negotiation("malformed sdp".to_string()));
        }
        let next = match (desc.sdp_type, state.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
            (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
            (kind, current) => {
                return Err(AppError::Negotiation(format!(
                    "remote {:?} in {}",
                    kind, current
                )))
            }
        };
        state.signaling = next;
        state.remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.remote.is_none() {
            return Err(AppError::Ice("no remote description".to_string()));
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        let state = self.state.lock();
        if state.closed {
            SignalingState::Closed
        } else {
            state.signaling
        }
    }

    fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    async fn set_track(&self, kind: TrackKind, track: Option<Arc<LocalTrack>>) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        let id = track.map(|t| t.id().to_string());
        if id.is_none() && !state.senders.contains_key(&kind) {
            return Ok(());
        }
        state.senders.insert(kind, id);
        Ok(())
    }

    fn sender_track_id(&self, kind: TrackKind) -> Option<String> {
        self.state.lock().senders.get(&kind).cloned().flatten()
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.connection = ConnectionState::Closed;
        Ok(())
    }
}

/// Factory handing out [`MockConnection`]s and remembering each one
pub struct MockFactory {
    owner: String,
    created: Mutex<Vec<(String, u64, Arc<MockConnection>)>>,
    fail: Mutex<bool>,
}

impl MockFactory {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            created: Mutex::new(vec![]),
            fail: Mutex::new(false),
        }
    }

    pub fn fail_creation(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Most recent connection created for `participant_id`
    pub fn latest(&self, participant_id: &str) -> Option<Arc<MockConnection>> {
        self.connections_for(participant_id).pop()
    }

    pub fn connections_for(&self, participant_id: &str) -> Vec<Arc<MockConnection>> {
        self.created
            .lock()
            .iter()
            .filter(|(id, _, _)| id == participant_id)
            .map(|(_, _, c)| c.clone())
            .collect()
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl RtcConnectionFactory for MockFactory {
    async fn create(
        &self,
        participant_id: &str,
        generation: u64,
        _events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcConnection>> {
        if *self.fail.lock() {
            return Err(AppError::WebRtcError("factory refused".to_string()));
        }
        let conn = Arc::new(MockConnection::new(&self.owner, participant_id));
        self.created
            .lock()
            .push((participant_id.to_string(), generation, conn.clone()));
        Ok(conn)
    }
}

/// Signal sender that records every message
pub struct RecordingSignals {
    messages: Mutex<Vec<ClientMessage>>,
    open: Mutex<bool>,
}

impl RecordingSignals {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(vec![]),
            open: Mutex::new(true),
        }
    }

    pub fn set_open(&self, open: bool) {
        *self.open.lock() = open;
    }

    pub fn messages(&self) -> Vec<ClientMessage> {
        self.messages.lock().clone()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    pub fn offers_to(&self, target: &str) -> Vec<SessionDescription> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                ClientMessage::WebrtcOffer {
                    target_participant_id,
                    data,
                } if target_participant_id == target => Some(data.offer.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn answers_to(&self, target: &str) -> Vec<SessionDescription> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                ClientMessage::WebrtcAnswer {
                    target_participant_id,
                    data,
                } if target_participant_id == target => Some(data.answer.clone()),
                _ => None,
            })
            .collect()
    }

    /// Every `status_update` as `(muted, camera_off, is_screen_sharing)`
    pub fn status_updates(&self) -> Vec<(bool, bool, bool)> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                ClientMessage::StatusUpdate {
                    muted,
                    camera_off,
                    is_screen_sharing,
                    ..
                } => Some((*muted, *camera_off, *is_screen_sharing)),
                _ => None,
            })
            .collect()
    }
}

impl SignalSender for RecordingSignals {
    fn send(&self, message: ClientMessage) -> Result<()> {
        if !*self.open.lock() {
            return Err(AppError::Signaling("socket is disconnected".to_string()));
        }
        self.messages.lock().push(message);
        Ok(())
    }
}
