//! Mesh of peer connections, one per remote participant
//!
//! The manager owns every [`PeerRecord`] and runs offer/answer exchanges,
//! buffers early ICE candidates and resolves simultaneous offers (glare)
//! with a polite/impolite split decided by comparing participant ids.
//! It is driven from a single task; methods take `&mut self` and re-check
//! record liveness and signaling state after every await.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use super::connection::{PeerEvent, RtcConnection, RtcConnectionFactory};
use super::ice_queue::PendingIceQueue;
use super::signaling::{
    ConnectionState, IceCandidate, SessionDescription, SignalingState, TrackKind,
};
use crate::error::{AppError, Result};
use crate::media::LocalTrack;
use crate::signaling::protocol::ClientMessage;
use crate::signaling::SignalSender;
use crate::utils::LogThrottler;

/// Connection state for one remote participant
pub struct PeerRecord {
    participant_id: String,
    generation: u64,
    connection: Arc<dyn RtcConnection>,
    pending_ice: PendingIceQueue,
    bound_streams: HashSet<String>,
}

impl PeerRecord {
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection(&self) -> Arc<dyn RtcConnection> {
        self.connection.clone()
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.connection.signaling_state()
    }

    pub fn pending_ice_len(&self) -> usize {
        self.pending_ice.len()
    }
}

/// Owner of all peer records
pub struct PeerConnectionManager {
    local_id: String,
    factory: Arc<dyn RtcConnectionFactory>,
    signals: Arc<dyn SignalSender>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    records: HashMap<String, PeerRecord>,
    audio_track: Option<Arc<LocalTrack>>,
    video_track: Option<Arc<LocalTrack>>,
    ice_capacity: usize,
    next_generation: u64,
    throttler: LogThrottler,
}

impl PeerConnectionManager {
    /// `local_id` is this client's participant id, used for glare politeness
    pub fn new(
        local_id: impl Into<String>,
        factory: Arc<dyn RtcConnectionFactory>,
        signals: Arc<dyn SignalSender>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
        ice_capacity: usize,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            factory,
            signals,
            events_tx,
            records: HashMap::new(),
            audio_track: None,
            video_track: None,
            ice_capacity,
            next_generation: 0,
            throttler: LogThrottler::with_secs(5),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The lower id yields during glare
    pub fn is_polite_to(&self, remote_id: &str) -> bool {
        self.local_id.as_str() < remote_id
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.records.contains_key(participant_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Ids of every participant with a record, sorted
    pub fn participant_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn record(&self, participant_id: &str) -> Option<&PeerRecord> {
        self.records.get(participant_id)
    }

    pub fn signaling_state(&self, participant_id: &str) -> Option<SignalingState> {
        self.records.get(participant_id).map(|r| r.signaling_state())
    }

    /// Whether `generation` is the live connection of `participant_id`
    pub fn is_current(&self, participant_id: &str, generation: u64) -> bool {
        self.records
            .get(participant_id)
            .is_some_and(|r| r.generation == generation)
    }

    pub fn local_track(&self, kind: TrackKind) -> Option<Arc<LocalTrack>> {
        match kind {
            TrackKind::Audio => self.audio_track.clone(),
            TrackKind::Video => self.video_track.clone(),
        }
    }

    async fn open_connection(&mut self, participant_id: &str) -> Result<(u64, Arc<dyn RtcConnection>)> {
        self.next_generation += 1;
        let generation = self.next_generation;

        let connection = self
            .factory
            .create(participant_id, generation, self.events_tx.clone())
            .await?;

        for kind in [TrackKind::Audio, TrackKind::Video] {
            if let Some(track) = self.local_track(kind) {
                if let Err(e) = connection.set_track(kind, Some(track)).await {
                    warn!("Failed to attach local {} to {}: {}", kind, participant_id, e);
                }
            }
        }

        Ok((generation, connection))
    }

    /// Create a record with every current local track attached; no-op if one exists
    pub async fn add_peer(&mut self, participant_id: &str) -> Result<()> {
        if self.records.contains_key(participant_id) {
            return Ok(());
        }

        let (generation, connection) = self.open_connection(participant_id).await?;
        self.records.insert(
            participant_id.to_string(),
            PeerRecord {
                participant_id: participant_id.to_string(),
                generation,
                connection,
                pending_ice: PendingIceQueue::new(self.ice_capacity),
                bound_streams: HashSet::new(),
            },
        );

        info!("Created peer connection for {} (#{})", participant_id, generation);
        Ok(())
    }

    /// Create a record and send it an offer
    pub async fn connect(&mut self, participant_id: &str) -> Result<()> {
        self.add_peer(participant_id).await?;
        self.send_offer(participant_id, false).await
    }

    /// Run an offer cycle with a stable peer
    pub async fn send_offer(&mut self, participant_id: &str, ice_restart: bool) -> Result<()> {
        let connection = self
            .records
            .get(participant_id)
            .map(|r| r.connection.clone())
            .ok_or_else(|| AppError::NotFound(format!("peer {}", participant_id)))?;

        negotiate(participant_id, connection, self.signals.as_ref(), ice_restart).await
    }

    /// Close the current connection and open a fresh one under the same record id
    ///
    /// With `keep_pending` the queued remote candidates move to the new
    /// connection; they belong to the remote offer, not to our discarded one.
    async fn recreate(&mut self, participant_id: &str, keep_pending: bool) -> Result<()> {
        let mut pending = Vec::new();
        if let Some(mut old) = self.records.remove(participant_id) {
            if keep_pending {
                pending = old.pending_ice.drain();
            }
            if let Err(e) = old.connection.close().await {
                debug!("Closing replaced connection for {}: {}", participant_id, e);
            }
        }
        info!("Recreating peer connection for {}", participant_id);
        self.add_peer(participant_id).await?;

        if let Some(record) = self.records.get_mut(participant_id) {
            for candidate in pending {
                record.pending_ice.push(candidate);
            }
        }
        Ok(())
    }

    fn current_connection(&self, participant_id: &str) -> Result<Arc<dyn RtcConnection>> {
        self.records
            .get(participant_id)
            .map(|r| r.connection.clone())
            .ok_or_else(|| AppError::NotFound(format!("peer {}", participant_id)))
    }

    /// Handle a remote offer
    ///
    /// The caller decides whether the sender may get a record; a missing
    /// record is created here.
    pub async fn handle_offer(&mut self, participant_id: &str, offer: SessionDescription) -> Result<()> {
        self.add_peer(participant_id).await?;

        if self.current_connection(participant_id)?.connection_state() == ConnectionState::Failed {
            self.recreate(participant_id, false).await?;
        }

        let connection = self.current_connection(participant_id)?;
        if connection.signaling_state() == SignalingState::HaveLocalOffer {
            if !self.is_polite_to(participant_id) {
                info!("Impolite peer ignoring offer from {} during glare", participant_id);
                return Ok(());
            }

            // webrtc-rs has no local rollback; a fresh connection drops our offer
            info!("Polite peer discarding local offer for {}", participant_id);
            self.recreate(participant_id, true).await?;
        }

        let connection = self.current_connection(participant_id)?;
        match self.accept_offer(participant_id, connection, offer).await {
            Ok(()) => {
                debug!("Processed offer from {}", participant_id);
                Ok(())
            }
            Err(e) => {
                error!("Error processing offer from {}: {}", participant_id, e);
                if self.records.contains_key(participant_id) {
                    self.recreate(participant_id, false).await?;
                }
                Err(e)
            }
        }
    }

    async fn accept_offer(
        &mut self,
        participant_id: &str,
        connection: Arc<dyn RtcConnection>,
        offer: SessionDescription,
    ) -> Result<()> {
        connection.set_remote_description(offer).await?;
        self.flush_pending_ice(participant_id, &connection).await;

        let answer = connection.create_answer().await?;
        if !self.is_current_connection(participant_id, &connection) {
            return Err(AppError::Negotiation(format!(
                "peer {} went away while answering",
                participant_id
            )));
        }
        connection.set_local_description(answer.clone()).await?;

        self.signals
            .send(ClientMessage::answer(participant_id, answer))?;
        Ok(())
    }

    fn is_current_connection(&self, participant_id: &str, connection: &Arc<dyn RtcConnection>) -> bool {
        self.records
            .get(participant_id)
            .is_some_and(|r| Arc::ptr_eq(&r.connection, connection))
    }

    /// Handle a remote answer; only valid while our offer is outstanding
    pub async fn handle_answer(&mut self, participant_id: &str, answer: SessionDescription) -> Result<()> {
        let Some(record) = self.records.get_mut(participant_id) else {
            debug!("Answer from {} without a peer record, ignoring", participant_id);
            return Ok(());
        };

        let connection = record.connection.clone();
        let state = connection.signaling_state();
        if state != SignalingState::HaveLocalOffer {
            record.pending_ice.clear();
            return Err(AppError::Negotiation(format!(
                "ignored answer from {}: signaling state {}",
                participant_id, state
            )));
        }

        connection.set_remote_description(answer).await?;
        self.flush_pending_ice(participant_id, &connection).await;
        debug!("Applied answer from {}", participant_id);
        Ok(())
    }

    /// Apply a remote candidate now, or queue it until a remote description exists
    pub async fn handle_ice_candidate(&mut self, participant_id: &str, candidate: IceCandidate) -> Result<()> {
        let Some(record) = self.records.get(participant_id) else {
            debug!("ICE candidate from {} without a peer record, ignoring", participant_id);
            return Ok(());
        };

        let connection = record.connection.clone();
        if connection.has_remote_description().await {
            trace!("Adding ICE candidate from {}", participant_id);
            return connection.add_ice_candidate(candidate).await;
        }

        let Some(record) = self.records.get_mut(participant_id) else {
            return Ok(());
        };
        if record.pending_ice.push(candidate) {
            trace!(
                "Queued ICE candidate for {} (total: {})",
                participant_id,
                record.pending_ice.len()
            );
        } else if let Some(suppressed) = self
            .throttler
            .check(&format!("ice_queue_full:{}", participant_id))
        {
            warn!(
                "ICE candidate queue full for {} ({} max), {} dropped so far ({} similar suppressed)",
                participant_id,
                record.pending_ice.capacity(),
                record.pending_ice.dropped(),
                suppressed
            );
        }
        Ok(())
    }

    /// Replay queued candidates in arrival order, exactly once
    async fn flush_pending_ice(&mut self, participant_id: &str, connection: &Arc<dyn RtcConnection>) {
        let queued = match self.records.get_mut(participant_id) {
            Some(record) => record.pending_ice.drain(),
            None => return,
        };
        if queued.is_empty() {
            return;
        }

        debug!("Applying {} queued ICE candidates for {}", queued.len(), participant_id);
        for candidate in queued {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                warn!("Failed to add queued ICE candidate for {}: {}", participant_id, e);
            }
        }
    }

    /// Send a locally gathered candidate to its participant
    pub fn forward_local_candidate(
        &self,
        participant_id: &str,
        generation: u64,
        candidate: IceCandidate,
    ) -> Result<()> {
        if !self.is_current(participant_id, generation) {
            trace!("Dropping candidate from stale connection to {}", participant_id);
            return Ok(());
        }
        self.signals
            .send(ClientMessage::ice_candidate(participant_id, candidate))
    }

    /// Record a remote stream; returns `true` the first time a stream is seen
    pub fn bind_remote_stream(&mut self, participant_id: &str, generation: u64, stream_id: &str) -> bool {
        match self.records.get_mut(participant_id) {
            Some(record) if record.generation == generation => {
                record.bound_streams.insert(stream_id.to_string())
            }
            _ => false,
        }
    }

    /// React to a transport state change; a failed stable connection restarts ICE
    pub async fn handle_connection_state(
        &mut self,
        participant_id: &str,
        generation: u64,
        state: ConnectionState,
    ) -> Result<()> {
        if !self.is_current(participant_id, generation) || state != ConnectionState::Failed {
            return Ok(());
        }

        match self.signaling_state(participant_id) {
            Some(SignalingState::Stable) => {
                info!("Attempting to restart ICE for {}", participant_id);
                self.send_offer(participant_id, true).await
            }
            Some(other) => {
                debug!(
                    "Connection to {} failed mid-negotiation ({}), waiting",
                    participant_id, other
                );
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Swap the local track of `kind` on every peer and renegotiate stable ones
    ///
    /// Peers are processed concurrently; a failure is logged and never blocks the others.
    pub async fn set_local_track(&mut self, kind: TrackKind, track: Option<Arc<LocalTrack>>) {
        match kind {
            TrackKind::Audio => self.audio_track = track.clone(),
            TrackKind::Video => self.video_track = track.clone(),
        }

        let signals = self.signals.clone();
        let tasks = self.records.values().map(|record| {
            let participant_id = record.participant_id.clone();
            let connection = record.connection.clone();
            let track = track.clone();
            let signals = signals.clone();

            async move {
                if let Err(e) = connection.set_track(kind, track).await {
                    warn!("Failed to update {} sender for {}: {}", kind, participant_id, e);
                    return;
                }

                let state = connection.signaling_state();
                if state != SignalingState::Stable {
                    debug!(
                        "Skipping renegotiation with {} in state {}",
                        participant_id, state
                    );
                    return;
                }

                if let Err(e) = negotiate(&participant_id, connection, signals.as_ref(), false).await {
                    warn!("Renegotiation with {} failed: {}", participant_id, e);
                }
            }
        });

        join_all(tasks).await;
    }

    /// Close and discard a record; returns `false` if there was none
    pub async fn remove(&mut self, participant_id: &str) -> bool {
        let Some(record) = self.records.remove(participant_id) else {
            return false;
        };

        if let Err(e) = record.connection.close().await {
            warn!("Failed to close connection to {}: {}", participant_id, e);
        }
        self.throttler
            .clear(&format!("ice_queue_full:{}", participant_id));
        info!(
            "Closed peer connection for {} ({} queued candidates discarded)",
            participant_id,
            record.pending_ice.len()
        );
        true
    }

    /// Close every record
    pub async fn close_all(&mut self) {
        let records: Vec<PeerRecord> = self.records.drain().map(|(_, r)| r).collect();
        if records.is_empty() {
            return;
        }

        let count = records.len();
        join_all(records.into_iter().map(|record| async move {
            if let Err(e) = record.connection.close().await {
                warn!("Failed to close connection to {}: {}", record.participant_id, e);
            }
        }))
        .await;
        info!("Closed {} peer connections", count);
    }
}

/// Create and apply an offer, then send it
async fn negotiate(
    participant_id: &str,
    connection: Arc<dyn RtcConnection>,
    signals: &dyn SignalSender,
    ice_restart: bool,
) -> Result<()> {
    let state = connection.signaling_state();
    if state != SignalingState::Stable {
        return Err(AppError::Negotiation(format!(
            "cannot offer to {} in state {}",
            participant_id, state
        )));
    }

    let offer = connection.create_offer(ice_restart).await?;

    let state = connection.signaling_state();
    if state != SignalingState::Stable {
        return Err(AppError::Negotiation(format!(
            "state of {} changed to {} while creating offer",
            participant_id, state
        )));
    }
    connection.set_local_description(offer.clone()).await?;

    signals.send(ClientMessage::offer(participant_id, offer))?;
    debug!("Sent offer to {} (ice restart: {})", participant_id, ice_restart);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use crate::webrtc::testing::{MockFactory, RecordingSignals};

    struct Harness {
        manager: PeerConnectionManager,
        factory: Arc<MockFactory>,
        signals: Arc<RecordingSignals>,
        _events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn harness(local_id: &str) -> Harness {
        let factory = Arc::new(MockFactory::new(local_id));
        let signals = Arc::new(RecordingSignals::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = PeerConnectionManager::new(local_id, factory.clone(), signals.clone(), tx, 50);
        Harness {
            manager,
            factory,
            signals,
            _events: rx,
        }
    }

    fn candidate(n: usize) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 2122260223 192.168.1.{} 5000 typ host", n, n))
            .with_mid("0", 0)
    }

    #[tokio::test]
    async fn test_connect_sends_offer() {
        let mut h = harness("user_1");
        h.manager.connect("user_2").await.unwrap();

        assert_eq!(h.manager.participant_ids(), vec!["user_2".to_string()]);
        assert_eq!(
            h.manager.signaling_state("user_2"),
            Some(SignalingState::HaveLocalOffer)
        );
        assert_eq!(h.signals.offers_to("user_2").len(), 1);
    }

    #[tokio::test]
    async fn test_early_candidates_replayed_in_order_once() {
        let mut h = harness("user_1");
        h.manager.add_peer("user_2").await.unwrap();

        for n in 0..3 {
            h.manager.handle_ice_candidate("user_2", candidate(n)).await.unwrap();
        }
        assert_eq!(h.manager.record("user_2").unwrap().pending_ice_len(), 3);
        let conn = h.factory.latest("user_2").unwrap();
        assert!(conn.applied_candidates().is_empty());

        h.manager
            .handle_offer("user_2", SessionDescription::offer("offer-from-2"))
            .await
            .unwrap();

        assert_eq!(
            conn.applied_candidates(),
            vec![candidate(0), candidate(1), candidate(2)]
        );
        assert_eq!(h.manager.record("user_2").unwrap().pending_ice_len(), 0);
        assert_eq!(h.signals.answers_to("user_2").len(), 1);

        // Once the remote description exists candidates go straight through
        h.manager.handle_ice_candidate("user_2", candidate(3)).await.unwrap();
        assert_eq!(conn.applied_candidates().len(), 4);
        assert_eq!(conn.applied_candidates()[3], candidate(3));
    }

    #[tokio::test]
    async fn test_candidate_queue_capped_at_fifty() {
        let mut h = harness("user_1");
        h.manager.connect("user_2").await.unwrap();

        for n in 0..55 {
            h.manager.handle_ice_candidate("user_2", candidate(n)).await.unwrap();
        }
        assert_eq!(h.manager.record("user_2").unwrap().pending_ice_len(), 50);

        h.manager
            .handle_answer("user_2", SessionDescription::answer("answer-from-2"))
            .await
            .unwrap();

        let applied = h.factory.latest("user_2").unwrap().applied_candidates();
        assert_eq!(applied.len(), 50);
        assert_eq!(applied[0], candidate(0));
        assert_eq!(applied[49], candidate(49));
        assert_eq!(h.manager.signaling_state("user_2"), Some(SignalingState::Stable));
    }

    #[tokio::test]
    async fn test_stale_answer_discarded() {
        let mut h = harness("user_1");
        h.manager.add_peer("user_2").await.unwrap();
        h.manager.handle_ice_candidate("user_2", candidate(0)).await.unwrap();

        let result = h
            .manager
            .handle_answer("user_2", SessionDescription::answer("late"))
            .await;
        assert!(matches!(result, Err(AppError::Negotiation(_))));
        assert_eq!(h.manager.record("user_2").unwrap().pending_ice_len(), 0);
        assert_eq!(h.manager.signaling_state("user_2"), Some(SignalingState::Stable));
    }

    #[tokio::test]
    async fn test_glare_converges() {
        let mut a = harness("1");
        let mut b = harness("2");

        a.manager.connect("2").await.unwrap();
        b.manager.connect("1").await.unwrap();
        let offer_a = a.signals.offers_to("2").remove(0);
        let offer_b = b.signals.offers_to("1").remove(0);

        assert!(a.manager.is_polite_to("2"));
        assert!(!b.manager.is_polite_to("1"));

        // Impolite side keeps its own offer
        b.manager.handle_offer("1", offer_a).await.unwrap();
        assert_eq!(b.manager.signaling_state("1"), Some(SignalingState::HaveLocalOffer));
        assert!(b.signals.answers_to("1").is_empty());

        // B's candidate reaches A before B's offer does
        a.manager.handle_ice_candidate("2", candidate(7)).await.unwrap();

        // Polite side drops its connection and answers on a fresh one
        a.manager.handle_offer("2", offer_b.clone()).await.unwrap();
        assert_eq!(a.manager.signaling_state("2"), Some(SignalingState::Stable));
        let answer_a = a.signals.answers_to("2").remove(0);

        b.manager.handle_answer("1", answer_a.clone()).await.unwrap();
        assert_eq!(b.manager.signaling_state("1"), Some(SignalingState::Stable));

        let replaced = a.factory.connections_for("2");
        assert_eq!(replaced.len(), 2);
        assert!(replaced[0].is_closed());
        assert_eq!(b.factory.connections_for("1").len(), 1);

        // One SDP pair: B's offer and A's answer
        let conn_a = a.factory.latest("2").unwrap();
        let conn_b = b.factory.latest("1").unwrap();
        assert_eq!(conn_a.applied_candidates(), vec![candidate(7)]);
        assert_eq!(conn_a.remote_description(), Some(offer_b.clone()));
        assert_eq!(conn_a.local_description(), Some(answer_a.clone()));
        assert_eq!(conn_b.local_description(), Some(offer_b));
        assert_eq!(conn_b.remote_description(), Some(answer_a));
    }

    #[tokio::test]
    async fn test_glare_converges_on_webrtc_connections() {
        use crate::webrtc::{PeerConnectionFactory, WebRtcConfig};

        fn real_harness(
            local_id: &str,
        ) -> (
            PeerConnectionManager,
            Arc<RecordingSignals>,
            mpsc::UnboundedReceiver<PeerEvent>,
        ) {
            let config = WebRtcConfig {
                stun_servers: vec![],
                ..Default::default()
            };
            let factory = Arc::new(PeerConnectionFactory::new(&config).unwrap());
            let signals = Arc::new(RecordingSignals::new());
            let (tx, rx) = mpsc::unbounded_channel();
            let manager = PeerConnectionManager::new(local_id, factory, signals.clone(), tx, 50);
            (manager, signals, rx)
        }

        let (mut a, signals_a, _events_a) = real_harness("user_1");
        let (mut b, signals_b, _events_b) = real_harness("user_2");
        for manager in [&mut a, &mut b] {
            let mic = Arc::new(LocalTrack::new(TrackSource::Microphone, "mic", manager.local_id()));
            manager.set_local_track(TrackKind::Audio, Some(mic)).await;
        }

        a.connect("user_2").await.unwrap();
        b.connect("user_1").await.unwrap();
        let offer_a = signals_a.offers_to("user_2").remove(0);
        let offer_b = signals_b.offers_to("user_1").remove(0);
        let first_generation = a.record("user_2").unwrap().generation();

        b.handle_offer("user_1", offer_a).await.unwrap();
        assert_eq!(b.signaling_state("user_1"), Some(SignalingState::HaveLocalOffer));

        a.handle_offer("user_2", offer_b).await.unwrap();
        assert_eq!(a.signaling_state("user_2"), Some(SignalingState::Stable));
        assert_ne!(a.record("user_2").unwrap().generation(), first_generation);

        let answer = signals_a.answers_to("user_2").remove(0);
        b.handle_answer("user_1", answer).await.unwrap();
        assert_eq!(b.signaling_state("user_1"), Some(SignalingState::Stable));
        assert!(signals_b.answers_to("user_1").is_empty());

        a.close_all().await;
        b.close_all().await;
    }

    #[tokio::test]
    async fn test_failed_connection_recreated_before_offer() {
        let mut h = harness("user_1");
        h.manager.add_peer("user_2").await.unwrap();
        let first = h.manager.record("user_2").unwrap().generation();
        h.factory
            .latest("user_2")
            .unwrap()
            .set_connection_state(ConnectionState::Failed);

        h.manager
            .handle_offer("user_2", SessionDescription::offer("offer-after-failure"))
            .await
            .unwrap();

        let connections = h.factory.connections_for("user_2");
        assert_eq!(connections.len(), 2);
        assert!(connections[0].is_closed());
        assert!(connections[0].remote_description().is_none());
        assert_eq!(
            connections[1].remote_description(),
            Some(SessionDescription::offer("offer-after-failure"))
        );
        assert_ne!(h.manager.record("user_2").unwrap().generation(), first);
        assert_eq!(h.signals.answers_to("user_2").len(), 1);
    }

    #[tokio::test]
    async fn test_creation_failure_leaves_no_record() {
        let mut h = harness("user_1");
        h.factory.fail_creation(true);

        assert!(h.manager.connect("user_2").await.is_err());
        assert!(h.manager.is_empty());
        assert!(h.signals.messages().is_empty());
    }

    #[tokio::test]
    async fn test_offer_while_socket_closed_keeps_record() {
        let mut h = harness("user_1");
        h.signals.set_open(false);

        let result = h.manager.connect("user_2").await;
        assert!(matches!(result, Err(AppError::Signaling(_))));
        assert!(h.manager.contains("user_2"));
        assert!(h.signals.messages().is_empty());

        // Local candidates are not sent either, and nothing panics
        let generation = h.manager.record("user_2").unwrap().generation();
        assert!(h
            .manager
            .forward_local_candidate("user_2", generation, candidate(1))
            .is_err());
    }

    #[tokio::test]
    async fn test_renegotiation_skips_busy_and_isolates_failures() {
        let mut h = harness("user_1");
        h.manager.add_peer("user_2").await.unwrap();
        h.manager.add_peer("user_3").await.unwrap();
        h.manager.connect("user_4").await.unwrap();
        h.factory.latest("user_3").unwrap().fail_offers(true);
        h.signals.clear();

        let mic = Arc::new(LocalTrack::new(TrackSource::Microphone, "mic", "local"));
        h.manager.set_local_track(TrackKind::Audio, Some(mic.clone())).await;

        // Every sender carries the track
        for id in ["user_2", "user_3", "user_4"] {
            let conn = h.factory.latest(id).unwrap();
            assert_eq!(conn.sender_track_id(TrackKind::Audio).as_deref(), Some(mic.id()));
        }
        // Only the healthy stable peer got a new offer
        assert_eq!(h.signals.offers_to("user_2").len(), 1);
        assert!(h.signals.offers_to("user_3").is_empty());
        assert!(h.signals.offers_to("user_4").is_empty());

        // New peers get the current track at creation
        h.manager.add_peer("user_5").await.unwrap();
        let conn = h.factory.latest("user_5").unwrap();
        assert_eq!(conn.sender_track_id(TrackKind::Audio).as_deref(), Some(mic.id()));
    }

    #[tokio::test]
    async fn test_failed_offer_recreates_connection() {
        let mut h = harness("user_1");
        h.manager.add_peer("user_2").await.unwrap();
        let first = h.manager.record("user_2").unwrap().generation();
        h.factory.latest("user_2").unwrap().fail_remote_descriptions(true);

        let result = h
            .manager
            .handle_offer("user_2", SessionDescription::offer("broken"))
            .await;
        assert!(result.is_err());

        let second = h.manager.record("user_2").unwrap().generation();
        assert_ne!(first, second);
        assert!(!h.manager.is_current("user_2", first));
        assert!(h.factory.connections_for("user_2")[0].is_closed());

        // Candidates from the replaced connection are not forwarded
        h.manager
            .forward_local_candidate("user_2", first, candidate(1))
            .unwrap();
        assert!(h.signals.messages().is_empty());
    }

    #[tokio::test]
    async fn test_failed_connection_restarts_ice() {
        let mut h = harness("user_1");
        h.manager.connect("user_2").await.unwrap();
        h.manager
            .handle_answer("user_2", SessionDescription::answer("answer"))
            .await
            .unwrap();
        h.signals.clear();

        let generation = h.manager.record("user_2").unwrap().generation();
        h.manager
            .handle_connection_state("user_2", generation, ConnectionState::Failed)
            .await
            .unwrap();

        assert_eq!(h.signals.offers_to("user_2").len(), 1);
        assert_eq!(h.factory.latest("user_2").unwrap().ice_restarts(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let mut h = harness("user_1");
        h.manager.connect("user_2").await.unwrap();
        h.manager.handle_ice_candidate("user_2", candidate(0)).await.unwrap();

        assert!(h.manager.remove("user_2").await);
        assert!(!h.manager.remove("user_2").await);
        assert!(h.manager.is_empty());
        assert!(h.factory.latest("user_2").unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_remote_stream_bound_once() {
        let mut h = harness("user_1");
        h.manager.add_peer("user_2").await.unwrap();
        let generation = h.manager.record("user_2").unwrap().generation();

        assert!(h.manager.bind_remote_stream("user_2", generation, "stream-a"));
        assert!(!h.manager.bind_remote_stream("user_2", generation, "stream-a"));
        assert!(!h.manager.bind_remote_stream("user_2", generation + 1, "stream-b"));
        assert!(!h.manager.bind_remote_stream("user_9", generation, "stream-a"));
    }
}
