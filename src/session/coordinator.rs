//! Session coordinator
//!
//! Single owner of the roster, the peer mesh and local media. Every input
//! (signaling frames, connection callbacks, device notifications, speaking
//! transitions and user commands) goes through [`SessionCoordinator::dispatch`]
//! on one task, so none of this state needs a lock.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::roster::{Participant, Roster};
use crate::config::AppConfig;
use crate::error::MediaAcquisitionError;
use crate::events::{EventBus, SessionEvent};
use crate::media::{
    LocalTrack, MediaChange, MediaController, MediaDevices, MediaEvent, SpeakingDetector,
    TrackSource,
};
use crate::signaling::protocol::{ChatMessage, ClientMessage, RemoteParticipant, ServerMessage, UserId};
use crate::signaling::{SignalSender, TransportEvent};
use crate::webrtc::{PeerConnectionManager, PeerEvent, RtcConnectionFactory, TrackKind};

const PEER_CREATE_ATTEMPTS: u32 = 2;

/// Who this client is
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub user_name: String,
}

/// User actions
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    SetMic(bool),
    ToggleMic,
    SetCamera(bool),
    ToggleCamera,
    SetScreenShare(bool),
    ToggleScreenShare,
    RaiseHand(bool),
    ToggleHand,
    SendChat(String),
    Leave,
}

/// Everything the coordinator reacts to
#[derive(Debug)]
pub enum SessionInput {
    Transport(TransportEvent),
    Peer(PeerEvent),
    Media(MediaEvent),
    /// Local speaking transition
    Speaking(bool),
    Command(SessionCommand),
}

/// Whether the session loop keeps running after an input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receivers the session loop has to drain into [`SessionCoordinator::dispatch`]
pub struct CoordinatorChannels {
    pub peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    pub media_rx: mpsc::UnboundedReceiver<MediaEvent>,
    pub speaking_rx: mpsc::UnboundedReceiver<bool>,
}

pub struct SessionCoordinator {
    identity: LocalIdentity,
    roster: Roster,
    peers: PeerConnectionManager,
    media: MediaController,
    speaking: SpeakingDetector,
    speaking_tx: mpsc::UnboundedSender<bool>,
    signals: Arc<dyn SignalSender>,
    events: Arc<EventBus>,
    chat: VecDeque<ChatMessage>,
    chat_limit: usize,
    room_info: Option<serde_json::Value>,
    connected: bool,
}

impl SessionCoordinator {
    pub fn new(
        identity: LocalIdentity,
        config: &AppConfig,
        factory: Arc<dyn RtcConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
        signals: Arc<dyn SignalSender>,
        events: Arc<EventBus>,
    ) -> (Self, CoordinatorChannels) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let (speaking_tx, speaking_rx) = mpsc::unbounded_channel();

        let roster = Roster::new(identity.user_id.clone(), identity.user_name.clone());
        let peers = PeerConnectionManager::new(
            roster.local_id(),
            factory,
            signals.clone(),
            peer_tx,
            config.webrtc.ice_queue_capacity,
        );

        let coordinator = Self {
            identity,
            roster,
            peers,
            media: MediaController::new(devices, media_tx),
            speaking: SpeakingDetector::new(config.speaking.clone()),
            speaking_tx,
            signals,
            events,
            chat: VecDeque::new(),
            chat_limit: config.session.chat_history_limit.max(1),
            room_info: None,
            connected: false,
        };

        let channels = CoordinatorChannels {
            peer_rx,
            media_rx,
            speaking_rx,
        };
        (coordinator, channels)
    }

    pub fn local_id(&self) -> &str {
        self.roster.local_id()
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.roster.participants()
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    pub fn media(&self) -> &MediaController {
        &self.media
    }

    pub fn chat_log(&self) -> impl Iterator<Item = &ChatMessage> {
        self.chat.iter()
    }

    pub fn room_info(&self) -> Option<&serde_json::Value> {
        self.room_info.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Open the microphone muted before the socket connects
    ///
    /// A failure is surfaced and the session goes on without audio.
    pub async fn start_media(&mut self) {
        match self.media.start_muted_microphone().await {
            Ok(Some(change)) => self.apply_media_change(change).await,
            Ok(None) => {}
            Err(e) => self.report_media_error(TrackSource::Microphone, &e),
        }
    }

    /// Process one input
    pub async fn dispatch(&mut self, input: SessionInput) -> Flow {
        match input {
            SessionInput::Transport(event) => self.handle_transport(event).await,
            SessionInput::Peer(event) => self.handle_peer_event(event).await,
            SessionInput::Media(MediaEvent::ScreenShareEnded { track_id }) => {
                if let Some(change) = self.media.screen_share_ended(&track_id).await {
                    self.apply_media_change(change).await;
                }
            }
            SessionInput::Speaking(speaking) => self.handle_local_speaking(speaking),
            SessionInput::Command(command) => return self.handle_command(command).await,
        }
        Flow::Continue
    }

    /// Release devices and close every peer
    pub async fn shutdown(&mut self) {
        self.speaking.stop();
        self.media.stop_all();
        self.peers.close_all().await;
        self.roster.clear_remote();
        self.connected = false;
        self.events.publish(SessionEvent::SessionEnded {
            at: chrono::Utc::now(),
        });
        info!("Session coordinator shut down");
    }

    // ---- signaling ----

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                info!("Signaling connected, joining session as {}", self.local_id());
                self.connected = true;
                self.publish_connection("connected", None);
                self.send_join();
            }
            TransportEvent::Message(message) => self.handle_server_message(message).await,
            TransportEvent::Closed { reason } => {
                info!("Signaling closed: {}", reason.as_deref().unwrap_or("no reason"));
                self.publish_connection("disconnected", reason);
                self.teardown_peers().await;
            }
            TransportEvent::Failed(reason) => {
                error!("Signaling failed: {}", reason);
                self.publish_connection("error", Some(reason));
                self.teardown_peers().await;
            }
        }
    }

    fn publish_connection(&self, status: &str, reason: Option<String>) {
        self.events.publish(SessionEvent::ConnectionStatus {
            status: status.to_string(),
            reason,
        });
    }

    async fn teardown_peers(&mut self) {
        self.connected = false;
        self.peers.close_all().await;
        self.roster.clear_remote();
        self.publish_participants();
    }

    fn send_join(&self) {
        let status = self.media.status();
        self.send(ClientMessage::JoinSession {
            user_id: self.identity.user_id.clone(),
            user_name: self.identity.user_name.clone(),
            muted: status.muted,
            camera_off: status.camera_off,
            is_screen_sharing: status.is_screen_sharing,
            hand_raised: self.roster.local().hand_raised,
        });
    }

    fn send(&self, message: ClientMessage) {
        if let Err(e) = self.signals.send(message) {
            debug!("Signal not sent: {}", e);
        }
    }

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ConnectionEstablished { room_info } => {
                debug!("Connection established");
                self.room_info = room_info;
            }
            ServerMessage::ParticipantsUpdate {
                participants,
                room_info,
            } => {
                if room_info.is_some() {
                    self.room_info = room_info;
                }
                self.reconcile(participants).await;
            }
            ServerMessage::ChatMessage { message } => {
                self.push_chat(message.clone());
                self.events.publish(SessionEvent::ChatMessage { message });
            }
            ServerMessage::ChatHistory { messages } => {
                self.chat.clear();
                for message in messages.iter().cloned() {
                    self.push_chat(message);
                }
                self.events.publish(SessionEvent::ChatHistory { messages });
            }
            ServerMessage::HandRaiseUpdate {
                participant_name,
                user_id,
                hand_raised,
            } => {
                self.roster
                    .update_hand(&participant_name, user_id.as_ref(), hand_raised);
                self.events.publish(SessionEvent::HandRaised {
                    participant_name,
                    hand_raised,
                });
                self.publish_participants();
            }
            ServerMessage::StatusUpdate {
                from_user_id,
                muted,
                camera_off,
                is_screen_sharing,
            } => {
                if self
                    .roster
                    .update_status(&from_user_id, muted, camera_off, is_screen_sharing)
                {
                    self.publish_participants();
                }
            }
            ServerMessage::SpeakingUpdate {
                from_user_id,
                is_speaking,
            } => {
                if from_user_id == self.identity.user_id {
                    return;
                }
                if self.roster.update_speaking(&from_user_id, is_speaking) {
                    self.events.publish(SessionEvent::SpeakingChanged {
                        user_id: from_user_id.to_string(),
                        speaking: is_speaking,
                    });
                }
            }
            ServerMessage::WebrtcOffer {
                from_participant_id,
                data,
            } => {
                if !self.roster.contains(&from_participant_id) {
                    warn!(
                        "Dropping offer from {}: not in the roster",
                        from_participant_id
                    );
                    return;
                }
                if let Err(e) = self.peers.handle_offer(&from_participant_id, data.offer).await {
                    warn!("Offer from {} not applied: {}", from_participant_id, e);
                }
            }
            ServerMessage::WebrtcAnswer {
                from_participant_id,
                data,
            } => {
                if let Err(e) = self
                    .peers
                    .handle_answer(&from_participant_id, data.answer)
                    .await
                {
                    warn!("{}", e);
                }
            }
            ServerMessage::WebrtcIceCandidate {
                from_participant_id,
                data,
            } => {
                if let Err(e) = self
                    .peers
                    .handle_ice_candidate(&from_participant_id, data.candidate)
                    .await
                {
                    warn!("ICE candidate from {} rejected: {}", from_participant_id, e);
                }
            }
            ServerMessage::Error { message } => {
                warn!("Server error: {}", message);
                self.events.publish(SessionEvent::ServerError { message });
            }
            ServerMessage::Unknown => debug!("Ignoring unknown server message"),
        }
    }

    /// Bring the peer table in line with a server roster
    async fn reconcile(&mut self, list: Vec<RemoteParticipant>) {
        self.roster.replace_remote(list);

        let remote = self.roster.remote_ids();
        let wanted: HashSet<&str> = remote.iter().map(String::as_str).collect();
        let known = self.peers.participant_ids();

        for id in known.iter().filter(|id| !wanted.contains(id.as_str())) {
            info!("Participant {} left", id);
            self.peers.remove(id).await;
        }

        let added: Vec<String> = remote
            .into_iter()
            .filter(|id| !self.peers.contains(id))
            .collect();
        for id in added {
            info!("Participant {} joined, sending offer", id);
            if !self.open_peer(&id).await {
                continue;
            }
            if let Err(e) = self.peers.send_offer(&id, false).await {
                warn!("Could not send offer to {}: {}", id, e);
            }
        }

        debug!(
            "Roster reconciled: {} participants, {} peer connections",
            self.roster.count(),
            self.peers.len()
        );
        self.publish_participants();
    }

    /// Create the record for a new participant, retrying once
    ///
    /// A participant whose connection cannot be created leaves the roster
    /// until the next server update lists it again.
    async fn open_peer(&mut self, id: &str) -> bool {
        for attempt in 1..=PEER_CREATE_ATTEMPTS {
            match self.peers.add_peer(id).await {
                Ok(()) => return true,
                Err(e) => warn!(
                    "Could not create connection to {} (attempt {}/{}): {}",
                    id, attempt, PEER_CREATE_ATTEMPTS, e
                ),
            }
        }

        error!("Giving up on {} until the next roster update", id);
        self.roster.remove(id);
        false
    }

    fn push_chat(&mut self, message: ChatMessage) {
        if self.chat.len() == self.chat_limit {
            self.chat.pop_front();
        }
        self.chat.push_back(message);
    }

    fn publish_participants(&self) {
        self.events.publish(SessionEvent::ParticipantsChanged {
            participants: self.roster.participants(),
        });
    }

    // ---- peers ----

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate {
                participant_id,
                generation,
                candidate,
            } => {
                if let Err(e) = self
                    .peers
                    .forward_local_candidate(&participant_id, generation, candidate)
                {
                    debug!("Local candidate for {} not sent: {}", participant_id, e);
                }
            }
            PeerEvent::RemoteTrack {
                participant_id,
                generation,
                stream_id,
                kind,
            } => {
                if self
                    .peers
                    .bind_remote_stream(&participant_id, generation, &stream_id)
                {
                    info!("Bound remote stream {} to {}", stream_id, participant_id);
                    self.events.publish(SessionEvent::RemoteTrackBound {
                        participant_id,
                        stream_id,
                        kind,
                    });
                }
            }
            PeerEvent::StateChanged {
                participant_id,
                generation,
                state,
            } => {
                debug!("Connection to {} is {}", participant_id, state);
                if let Err(e) = self
                    .peers
                    .handle_connection_state(&participant_id, generation, state)
                    .await
                {
                    warn!("ICE restart for {} failed: {}", participant_id, e);
                }
            }
        }
    }

    // ---- local media ----

    async fn handle_command(&mut self, command: SessionCommand) -> Flow {
        let result = match command {
            SessionCommand::SetMic(on) => (TrackSource::Microphone, self.media.set_mic(on).await),
            SessionCommand::ToggleMic => (TrackSource::Microphone, self.media.toggle_mic().await),
            SessionCommand::SetCamera(on) => (TrackSource::Camera, self.media.set_camera(on).await),
            SessionCommand::ToggleCamera => (TrackSource::Camera, self.media.toggle_camera().await),
            SessionCommand::SetScreenShare(on) => {
                (TrackSource::Screen, self.media.set_screen_share(on).await)
            }
            SessionCommand::ToggleScreenShare => {
                (TrackSource::Screen, self.media.toggle_screen_share().await)
            }
            SessionCommand::RaiseHand(raised) => {
                self.raise_hand(raised);
                return Flow::Continue;
            }
            SessionCommand::ToggleHand => {
                self.raise_hand(!self.roster.local().hand_raised);
                return Flow::Continue;
            }
            SessionCommand::SendChat(text) => {
                self.send_chat(&text);
                return Flow::Continue;
            }
            SessionCommand::Leave => return Flow::Stop,
        };

        match result {
            (_, Ok(Some(change))) => self.apply_media_change(change).await,
            (source, Ok(None)) => debug!("{} already in requested state", source),
            (source, Err(e)) => self.report_media_error(source, &e),
        }
        Flow::Continue
    }

    fn report_media_error(&self, source: TrackSource, error: &MediaAcquisitionError) {
        warn!("Could not open {}: {}", source, error);
        self.events.publish(SessionEvent::MediaError {
            device: source.to_string(),
            message: error.to_string(),
        });
    }

    /// Push a media change to every peer, then announce the new state
    async fn apply_media_change(&mut self, change: MediaChange) {
        if let Some(update) = change.track {
            if update.kind == TrackKind::Audio {
                self.restart_speaking(update.track.clone());
            }
            self.peers.set_local_track(update.kind, update.track).await;
        }

        if let Some(ref warning) = change.warning {
            self.report_media_error(TrackSource::Camera, warning);
        }

        let status = self.media.status();
        self.roster.set_local_status(status);
        if self.connected {
            self.send(ClientMessage::StatusUpdate {
                from_user_id: self.identity.user_id.clone(),
                muted: status.muted,
                camera_off: status.camera_off,
                is_screen_sharing: status.is_screen_sharing,
            });
        }
        self.publish_participants();
    }

    fn restart_speaking(&mut self, track: Option<Arc<LocalTrack>>) {
        match track {
            Some(track) => {
                if let Err(e) = self.speaking.start(track, self.speaking_tx.clone()) {
                    warn!("Speaking detection unavailable: {}", e);
                }
            }
            None => self.speaking.stop(),
        }
    }

    fn handle_local_speaking(&mut self, speaking: bool) {
        self.roster.set_local_speaking(speaking);
        if self.connected {
            self.send(ClientMessage::SpeakingUpdate {
                from_user_id: self.identity.user_id.clone(),
                is_speaking: speaking,
            });
        }
        self.events.publish(SessionEvent::SpeakingChanged {
            user_id: self.identity.user_id.to_string(),
            speaking,
        });
    }

    fn raise_hand(&mut self, raised: bool) {
        self.roster.set_local_hand(raised);
        self.send(ClientMessage::HandRaise {
            hand_raised: raised,
        });
        self.publish_participants();
    }

    fn send_chat(&self, text: &str) {
        let message = text.trim();
        if message.is_empty() {
            return;
        }
        self.send(ClientMessage::ChatMessage {
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticDevices;
    use crate::signaling::protocol::{AnswerData, OfferData};
    use crate::webrtc::testing::{MockFactory, RecordingSignals};
    use crate::webrtc::{RtcConnection, SessionDescription, SignalingState};

    struct Harness {
        coordinator: SessionCoordinator,
        factory: Arc<MockFactory>,
        devices: Arc<SyntheticDevices>,
        signals: Arc<RecordingSignals>,
        events: Arc<EventBus>,
        _channels: CoordinatorChannels,
    }

    async fn harness(user: &str) -> Harness {
        let local_id = format!("user_{}", user);
        let factory = Arc::new(MockFactory::new(&local_id));
        let devices = Arc::new(SyntheticDevices::new(local_id.clone()));
        let signals = Arc::new(RecordingSignals::new());
        let events = Arc::new(EventBus::new());

        let (mut coordinator, channels) = SessionCoordinator::new(
            LocalIdentity {
                user_id: UserId::new(user),
                user_name: format!("User {}", user),
            },
            &AppConfig::default(),
            factory.clone(),
            devices.clone(),
            signals.clone(),
            events.clone(),
        );
        coordinator.start_media().await;
        coordinator
            .dispatch(SessionInput::Transport(TransportEvent::Opened))
            .await;

        Harness {
            coordinator,
            factory,
            devices,
            signals,
            events,
            _channels: channels,
        }
    }

    fn participant(user: &str) -> RemoteParticipant {
        RemoteParticipant {
            id: format!("user_{}", user),
            user_id: UserId::new(user),
            name: format!("User {}", user),
            muted: true,
            camera_off: true,
            is_screen_sharing: false,
            hand_raised: false,
        }
    }

    fn roster(users: &[&str]) -> SessionInput {
        SessionInput::Transport(TransportEvent::Message(ServerMessage::ParticipantsUpdate {
            participants: users.iter().map(|u| participant(u)).collect(),
            room_info: None,
        }))
    }

    fn command(c: SessionCommand) -> SessionInput {
        SessionInput::Command(c)
    }

    #[tokio::test]
    async fn test_join_sent_on_open_with_muted_mic() {
        let h = harness("1").await;
        let join = h.signals.messages().into_iter().find_map(|m| match m {
            ClientMessage::JoinSession { user_id, muted, .. } => Some((user_id, muted)),
            _ => None,
        });
        assert_eq!(join, Some((UserId::new("1"), true)));
        assert!(h.coordinator.media().state().audio_track.is_some());
        assert!(h.coordinator.is_connected());
    }

    #[tokio::test]
    async fn test_roster_reconciliation_creates_and_removes_records() {
        let mut h = harness("1").await;

        h.coordinator.dispatch(roster(&["1", "2"])).await;
        assert_eq!(h.coordinator.peers().participant_ids(), vec!["user_2".to_string()]);
        assert_eq!(h.signals.offers_to("user_2").len(), 1);
        let conn = h.factory.latest("user_2").unwrap();
        assert!(conn.has_sender(TrackKind::Audio));

        h.coordinator.dispatch(roster(&["1"])).await;
        assert!(h.coordinator.peers().is_empty());
        assert!(conn.is_closed());
        assert_eq!(h.coordinator.participants().len(), 1);
    }

    #[tokio::test]
    async fn test_creation_failure_keeps_records_matching_roster() {
        let mut h = harness("1").await;
        h.factory.fail_creation(true);

        h.coordinator.dispatch(roster(&["1", "2"])).await;
        assert!(h.coordinator.peers().is_empty());
        assert_eq!(h.coordinator.participants().len(), 1);
        assert!(h.signals.offers_to("user_2").is_empty());

        // The next roster update tries again
        h.factory.fail_creation(false);
        h.coordinator.dispatch(roster(&["1", "2"])).await;
        assert_eq!(h.coordinator.peers().participant_ids(), vec!["user_2".to_string()]);
        assert_eq!(h.coordinator.participants().len(), 2);
        assert_eq!(h.signals.offers_to("user_2").len(), 1);
    }

    #[tokio::test]
    async fn test_sends_while_socket_closed_are_dropped() {
        let mut h = harness("1").await;
        h.signals.clear();
        h.signals.set_open(false);

        h.coordinator.dispatch(roster(&["1", "2"])).await;
        h.coordinator
            .dispatch(command(SessionCommand::SendChat("hello".to_string())))
            .await;
        h.coordinator.dispatch(command(SessionCommand::ToggleHand)).await;
        h.coordinator.dispatch(command(SessionCommand::SetMic(true))).await;

        assert!(h.signals.messages().is_empty());
        assert!(h.coordinator.peers().contains("user_2"));
        assert!(h.coordinator.participants()[0].hand_raised);
        assert!(!h.coordinator.media().status().muted);
    }

    #[tokio::test]
    async fn test_repeated_roster_does_not_reoffer() {
        let mut h = harness("1").await;
        h.coordinator.dispatch(roster(&["1", "2", "3"])).await;
        h.coordinator.dispatch(roster(&["1", "2", "3"])).await;

        assert_eq!(h.factory.created_count(), 2);
        assert_eq!(h.signals.offers_to("user_2").len(), 1);
        assert_eq!(h.signals.offers_to("user_3").len(), 1);
    }

    #[tokio::test]
    async fn test_unmute_twice_does_not_renegotiate() {
        let mut h = harness("1").await;
        h.coordinator.dispatch(roster(&["1", "2"])).await;
        let conn = h.factory.latest("user_2").unwrap();
        h.coordinator
            .dispatch(SessionInput::Transport(TransportEvent::Message(
                ServerMessage::WebrtcAnswer {
                    from_participant_id: "user_2".to_string(),
                    data: AnswerData {
                        answer: SessionDescription::answer("v=0 answer"),
                    },
                },
            )))
            .await;
        assert_eq!(conn.signaling_state(), SignalingState::Stable);
        h.signals.clear();

        h.coordinator.dispatch(command(SessionCommand::SetMic(true))).await;
        h.coordinator.dispatch(command(SessionCommand::SetMic(true))).await;

        assert!(h.signals.offers_to("user_2").is_empty());
        assert_eq!(h.signals.status_updates(), vec![(false, true, false)]);
    }

    #[tokio::test]
    async fn test_offer_from_unknown_participant_dropped() {
        let mut h = harness("1").await;
        h.coordinator
            .dispatch(SessionInput::Transport(TransportEvent::Message(
                ServerMessage::WebrtcOffer {
                    from_participant_id: "user_9".to_string(),
                    data: OfferData {
                        offer: SessionDescription::offer("v=0 offer"),
                    },
                },
            )))
            .await;

        assert!(h.coordinator.peers().is_empty());
        assert!(h.signals.answers_to("user_9").is_empty());
    }

    #[tokio::test]
    async fn test_screen_share_end_restores_camera() {
        let mut h = harness("1").await;
        h.coordinator.dispatch(command(SessionCommand::SetCamera(true))).await;
        h.coordinator.dispatch(roster(&["1", "2"])).await;
        h.coordinator
            .dispatch(command(SessionCommand::SetScreenShare(true)))
            .await;

        let conn = h.factory.latest("user_2").unwrap();
        let screen = h.coordinator.media().state().screen_track.clone().unwrap();
        assert_eq!(conn.sender_track_id(TrackKind::Video).as_deref(), Some(screen.id()));

        h.signals.clear();
        screen.end();
        h.coordinator
            .dispatch(SessionInput::Media(MediaEvent::ScreenShareEnded {
                track_id: screen.id().to_string(),
            }))
            .await;

        let camera = h.coordinator.media().state().camera_track.clone().unwrap();
        assert!(camera.is_live());
        assert_eq!(conn.sender_track_id(TrackKind::Video).as_deref(), Some(camera.id()));
        assert_eq!(h.signals.status_updates(), vec![(true, false, false)]);
    }

    #[tokio::test]
    async fn test_media_failure_leaves_state_and_peers_untouched() {
        let mut h = harness("1").await;
        h.coordinator.dispatch(roster(&["1", "2"])).await;
        let mut events = h.events.subscribe();
        h.signals.clear();
        h.devices.fail(
            TrackSource::Camera,
            MediaAcquisitionError::PermissionDenied("camera".to_string()),
        );

        h.coordinator.dispatch(command(SessionCommand::ToggleCamera)).await;

        assert!(h.coordinator.media().status().camera_off);
        assert!(h.signals.messages().is_empty());
        match events.try_recv().unwrap() {
            SessionEvent::MediaError { device, .. } => assert_eq!(device, "camera"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_updates_merge_into_roster() {
        let mut h = harness("1").await;
        h.coordinator.dispatch(roster(&["1", "2"])).await;

        let message = |m| SessionInput::Transport(TransportEvent::Message(m));
        h.coordinator
            .dispatch(message(ServerMessage::StatusUpdate {
                from_user_id: UserId::new("2"),
                muted: false,
                camera_off: false,
                is_screen_sharing: true,
            }))
            .await;
        h.coordinator
            .dispatch(message(ServerMessage::SpeakingUpdate {
                from_user_id: UserId::new("2"),
                is_speaking: true,
            }))
            .await;
        h.coordinator
            .dispatch(message(ServerMessage::HandRaiseUpdate {
                participant_name: "User 2".to_string(),
                user_id: None,
                hand_raised: true,
            }))
            .await;

        let two = h
            .coordinator
            .participants()
            .into_iter()
            .find(|p| p.id == "user_2")
            .unwrap();
        assert!(!two.muted && !two.camera_off && two.screen_sharing);
        assert!(two.speaking && two.hand_raised);
        assert_eq!(h.factory.created_count(), 1);
    }

    #[tokio::test]
    async fn test_chat_log_bounded_and_history_replaces() {
        let mut h = harness("1").await;
        h.coordinator.chat_limit = 2;

        for text in ["a", "b", "c"] {
            h.coordinator
                .dispatch(SessionInput::Transport(TransportEvent::Message(
                    ServerMessage::ChatMessage {
                        message: ChatMessage {
                            message: text.to_string(),
                            ..Default::default()
                        },
                    },
                )))
                .await;
        }
        let log: Vec<&str> = h.coordinator.chat_log().map(|m| m.message.as_str()).collect();
        assert_eq!(log, vec!["b", "c"]);

        h.coordinator
            .dispatch(SessionInput::Transport(TransportEvent::Message(
                ServerMessage::ChatHistory {
                    messages: vec![ChatMessage {
                        message: "old".to_string(),
                        ..Default::default()
                    }],
                },
            )))
            .await;
        let log: Vec<&str> = h.coordinator.chat_log().map(|m| m.message.as_str()).collect();
        assert_eq!(log, vec!["old"]);
    }

    #[tokio::test]
    async fn test_local_actions_send_messages() {
        let mut h = harness("1").await;
        h.signals.clear();

        h.coordinator
            .dispatch(command(SessionCommand::SendChat("  hello  ".to_string())))
            .await;
        h.coordinator
            .dispatch(command(SessionCommand::SendChat("   ".to_string())))
            .await;
        h.coordinator.dispatch(command(SessionCommand::ToggleHand)).await;
        h.coordinator.dispatch(SessionInput::Speaking(true)).await;

        assert_eq!(
            h.signals.messages(),
            vec![
                ClientMessage::ChatMessage {
                    message: "hello".to_string()
                },
                ClientMessage::HandRaise { hand_raised: true },
                ClientMessage::SpeakingUpdate {
                    from_user_id: UserId::new("1"),
                    is_speaking: true
                },
            ]
        );
        assert!(h.coordinator.participants()[0].hand_raised);
        assert_eq!(
            h.coordinator.dispatch(command(SessionCommand::Leave)).await,
            Flow::Stop
        );
    }

    #[tokio::test]
    async fn test_socket_close_tears_down_peers() {
        let mut h = harness("1").await;
        h.coordinator.dispatch(roster(&["1", "2", "3"])).await;

        h.coordinator
            .dispatch(SessionInput::Transport(TransportEvent::Closed { reason: None }))
            .await;

        assert!(h.coordinator.peers().is_empty());
        assert!(!h.coordinator.is_connected());
        assert!(h.factory.latest("user_3").unwrap().is_closed());

        h.coordinator.shutdown().await;
        assert!(h.devices.opened().iter().all(|t| t.is_stopped()));
    }
}
