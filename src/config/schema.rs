use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

// Re-export WebRtcConfig from webrtc module
pub use crate::webrtc::config::{TurnServer, WebRtcConfig};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Backend endpoints
    pub server: ServerConfig,
    /// ICE servers and peer limits
    pub webrtc: WebRtcConfig,
    /// Signaling socket behaviour
    pub signaling: SignalingConfig,
    /// Session keep-alive and chat settings
    pub session: SessionConfig,
    /// Speaking indicator tuning
    pub speaking: SpeakingConfig,
}

impl AppConfig {
    /// Reject values the session cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.webrtc.ice_queue_capacity == 0 {
            return Err(AppError::Config(
                "webrtc.ice_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.session.chat_history_limit == 0 {
            return Err(AppError::Config(
                "session.chat_history_limit must be at least 1".to_string(),
            ));
        }
        if self.signaling.connect_timeout_secs == 0 {
            return Err(AppError::Config(
                "signaling.connect_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Backend endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// REST API base URL (e.g. https://lms.example.com)
    pub api_base_url: String,
    /// Explicit signaling URL; resolved from session-info when empty
    pub signaling_url: Option<String>,
    /// REST request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            signaling_url: None,
            request_timeout_secs: 15,
        }
    }
}

/// Signaling socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Connection attempt timeout in seconds
    pub connect_timeout_secs: u64,
    /// Reconnect after the socket drops
    pub reconnect: bool,
    /// First reconnect delay in seconds (doubles per attempt)
    pub reconnect_delay_secs: u64,
    /// Upper bound for the reconnect delay
    pub max_reconnect_delay_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            reconnect: false,
            reconnect_delay_secs: 1,
            max_reconnect_delay_secs: 30,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Activity heartbeat period in seconds
    pub heartbeat_interval_secs: u64,
    /// Chat lines kept in memory
    pub chat_history_limit: usize,
    /// Join with the microphone captured but muted
    pub start_with_microphone: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 120,
            chat_history_limit: 200,
            start_with_microphone: true,
        }
    }
}

/// Speaking detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeakingConfig {
    /// Average byte level above which the user counts as speaking
    pub threshold: f32,
    /// Sampling period in milliseconds
    pub interval_ms: u64,
    /// Analyser FFT size (power of two)
    pub fft_size: usize,
    /// Spectrum smoothing time constant (0..1)
    pub smoothing: f32,
    /// Level mapped to byte 0
    pub min_decibels: f32,
    /// Level mapped to byte 255
    pub max_decibels: f32,
}

impl Default for SpeakingConfig {
    fn default() -> Self {
        Self {
            threshold: 10.0,
            interval_ms: 16,
            fft_size: 256,
            smoothing: 0.85,
            min_decibels: -90.0,
            max_decibels: -10.0,
        }
    }
}
