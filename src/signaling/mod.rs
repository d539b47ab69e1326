//! Signaling channel: wire protocol and WebSocket transport

pub mod protocol;
pub mod transport;

pub use protocol::{ChatMessage, ClientMessage, RemoteParticipant, ServerMessage, UserId};
pub use transport::{SignalSender, SignalingClient, TransportEvent, TransportState};
