//! study-session - live multi-participant study rooms
//!
//! Signaling over WebSocket, a peer-to-peer WebRTC mesh with glare
//! resolution and early ICE buffering, local device state and speaking
//! detection, driven by a single session coordinator.

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod session;
pub mod signaling;
pub mod utils;
pub mod webrtc;

pub use error::{AppError, Result};
