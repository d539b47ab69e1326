//! JSON envelopes exchanged with the study-group signaling socket
//!
//! Every frame is an object tagged by `type`. Messages the client sends and
//! messages the server pushes are modelled as two enums since the same `type`
//! carries different fields in each direction (`target_participant_id` vs
//! `from_participant_id`).

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::webrtc::signaling::{IceCandidate, SessionDescription};

/// User identifier as sent by the backend (string or integer on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Participant id the server assigns to this user
    pub fn participant_id(&self) -> String {
        format!("user_{}", self.0)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Str(String),
            Int(i64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Str(s) => UserId(s),
            Raw::Int(n) => UserId(n.to_string()),
        })
    }
}

/// Participant entry of a `participants_update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteParticipant {
    pub id: String,
    pub user_id: UserId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub camera_off: bool,
    #[serde(default)]
    pub is_screen_sharing: bool,
    #[serde(default)]
    pub hand_raised: bool,
}

/// Chat line as relayed by the server
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferData {
    pub offer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerData {
    pub answer: SessionDescription,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateData {
    pub candidate: IceCandidate,
}

/// Messages sent by this client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinSession {
        user_id: UserId,
        user_name: String,
        muted: bool,
        camera_off: bool,
        is_screen_sharing: bool,
        hand_raised: bool,
    },
    ChatMessage {
        message: String,
    },
    HandRaise {
        hand_raised: bool,
    },
    StatusUpdate {
        from_user_id: UserId,
        muted: bool,
        camera_off: bool,
        is_screen_sharing: bool,
    },
    SpeakingUpdate {
        from_user_id: UserId,
        is_speaking: bool,
    },
    WebrtcOffer {
        target_participant_id: String,
        data: OfferData,
    },
    WebrtcAnswer {
        target_participant_id: String,
        data: AnswerData,
    },
    WebrtcIceCandidate {
        target_participant_id: String,
        data: CandidateData,
    },
}

impl ClientMessage {
    pub fn offer(target: impl Into<String>, offer: SessionDescription) -> Self {
        ClientMessage::WebrtcOffer {
            target_participant_id: target.into(),
            data: OfferData { offer },
        }
    }

    pub fn answer(target: impl Into<String>, answer: SessionDescription) -> Self {
        ClientMessage::WebrtcAnswer {
            target_participant_id: target.into(),
            data: AnswerData { answer },
        }
    }

    pub fn ice_candidate(target: impl Into<String>, candidate: IceCandidate) -> Self {
        ClientMessage::WebrtcIceCandidate {
            target_participant_id: target.into(),
            data: CandidateData { candidate },
        }
    }

    /// Wire `type` tag, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::JoinSession { .. } => "join_session",
            ClientMessage::ChatMessage { .. } => "chat_message",
            ClientMessage::HandRaise { .. } => "hand_raise",
            ClientMessage::StatusUpdate { .. } => "status_update",
            ClientMessage::SpeakingUpdate { .. } => "speaking_update",
            ClientMessage::WebrtcOffer { .. } => "webrtc_offer",
            ClientMessage::WebrtcAnswer { .. } => "webrtc_answer",
            ClientMessage::WebrtcIceCandidate { .. } => "webrtc_ice_candidate",
        }
    }
}

/// Messages pushed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        #[serde(default)]
        room_info: Option<serde_json::Value>,
    },
    ParticipantsUpdate {
        #[serde(default)]
        participants: Vec<RemoteParticipant>,
        #[serde(default)]
        room_info: Option<serde_json::Value>,
    },
    ChatMessage {
        message: ChatMessage,
    },
    ChatHistory {
        #[serde(default)]
        messages: Vec<ChatMessage>,
    },
    HandRaiseUpdate {
        #[serde(default)]
        participant_name: String,
        #[serde(default)]
        user_id: Option<UserId>,
        hand_raised: bool,
    },
    StatusUpdate {
        from_user_id: UserId,
        #[serde(default)]
        muted: bool,
        #[serde(default)]
        camera_off: bool,
        #[serde(default)]
        is_screen_sharing: bool,
    },
    SpeakingUpdate {
        from_user_id: UserId,
        is_speaking: bool,
    },
    WebrtcOffer {
        from_participant_id: String,
        data: OfferData,
    },
    WebrtcAnswer {
        from_participant_id: String,
        data: AnswerData,
    },
    WebrtcIceCandidate {
        from_participant_id: String,
        data: CandidateData,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    /// Any `type` this client does not understand
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse a text frame
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
