//! Capability interface over a single peer connection
//!
//! The manager only talks to connections through [`RtcConnection`], so the
//! negotiation logic runs the same against the real WebRTC stack and against
//! scripted connections in tests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::signaling::{ConnectionState, IceCandidate, SessionDescription, SignalingState, TrackKind};
use crate::error::Result;
use crate::media::LocalTrack;

/// Callback output of a connection, delivered to the coordinator task
///
/// `generation` identifies the connection instance so late events from a
/// closed or replaced connection can be discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Local ICE candidate gathered, to be sent to the participant
    IceCandidate {
        participant_id: String,
        generation: u64,
        candidate: IceCandidate,
    },
    /// Remote media arrived
    RemoteTrack {
        participant_id: String,
        generation: u64,
        stream_id: String,
        kind: TrackKind,
    },
    /// Transport-level state changed
    StateChanged {
        participant_id: String,
        generation: u64,
        state: ConnectionState,
    },
}

impl PeerEvent {
    pub fn participant_id(&self) -> &str {
        match self {
            PeerEvent::IceCandidate { participant_id, .. }
            | PeerEvent::RemoteTrack { participant_id, .. }
            | PeerEvent::StateChanged { participant_id, .. } => participant_id,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            PeerEvent::IceCandidate { generation, .. }
            | PeerEvent::RemoteTrack { generation, .. }
            | PeerEvent::StateChanged { generation, .. } => *generation,
        }
    }
}

/// One peer connection
#[async_trait]
pub trait RtcConnection: Send + Sync {
    /// Create an offer; `ice_restart` requests fresh ICE credentials
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    /// Put `track` on the sender of `kind`, replacing whatever it carried;
    /// adds a sender when none exists yet. `None` detaches the track but
    /// keeps the sender.
    async fn set_track(&self, kind: TrackKind, track: Option<Arc<LocalTrack>>) -> Result<()>;

    /// Id of the track currently on the sender of `kind`
    fn sender_track_id(&self, kind: TrackKind) -> Option<String>;

    async fn close(&self) -> Result<()>;
}

/// Creates connections for participants
#[async_trait]
pub trait RtcConnectionFactory: Send + Sync {
    async fn create(
        &self,
        participant_id: &str,
        generation: u64,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcConnection>>;
}
