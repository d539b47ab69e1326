//! Peer-to-peer media mesh
//!
//! Every remote participant gets one peer connection. The manager drives
//! offer/answer exchanges through the signaling channel:
//! ```text
//! SessionCoordinator
//!        |
//!        v
//! PeerConnectionManager ---- offers/answers/ICE ----> SignalSender
//!        |
//!        v
//! RtcConnection (webrtc-rs PeerConnection)
//!        |
//!        +------ PeerEvent (ICE, remote track, state) ----> coordinator task
//! ```

pub mod config;
pub mod connection;
pub mod ice_queue;
pub mod manager;
pub mod peer;
pub mod signaling;

#[cfg(test)]
pub(crate) mod testing;

pub use config::WebRtcConfig;
pub use connection::{PeerEvent, RtcConnection, RtcConnectionFactory};
pub use ice_queue::PendingIceQueue;
pub use manager::{PeerConnectionManager, PeerRecord};
pub use peer::{PeerConnection, PeerConnectionFactory};
pub use signaling::{ConnectionState, IceCandidate, SessionDescription, SignalingState, TrackKind};
