//! Session event types
//!
//! Everything a renderer needs to draw the room is published as one of these.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::session::roster::Participant;
use crate::signaling::protocol::ChatMessage;
use crate::webrtc::signaling::TrackKind;

/// Events broadcast through the event bus
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// Signaling socket state changed ("connecting", "connected", "disconnected", "error")
    #[serde(rename = "connection.status")]
    ConnectionStatus {
        status: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Roster changed (always includes the local participant first)
    #[serde(rename = "participants.changed")]
    ParticipantsChanged { participants: Vec<Participant> },

    /// First media of a remote stream is available for rendering
    #[serde(rename = "remote_track.bound")]
    RemoteTrackBound {
        participant_id: String,
        stream_id: String,
        kind: TrackKind,
    },

    /// A participant started or stopped speaking
    #[serde(rename = "speaking.changed")]
    SpeakingChanged { user_id: String, speaking: bool },

    /// A participant raised or lowered their hand
    #[serde(rename = "hand.changed")]
    HandRaised {
        participant_name: String,
        hand_raised: bool,
    },

    /// Chat line received
    #[serde(rename = "chat.message")]
    ChatMessage { message: ChatMessage },

    /// Chat history replaced
    #[serde(rename = "chat.history")]
    ChatHistory { messages: Vec<ChatMessage> },

    /// A capture device could not be opened (inline banner)
    #[serde(rename = "media.error")]
    MediaError { device: String, message: String },

    /// Error message pushed by the server
    #[serde(rename = "server.error")]
    ServerError { message: String },

    /// Session finished
    #[serde(rename = "session.ended")]
    SessionEnded { at: DateTime<Utc> },
}
