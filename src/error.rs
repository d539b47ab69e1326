use thiserror::Error;

/// Reasons a capture device could not be opened
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("Permission denied for {0}")]
    PermissionDenied(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Capture failed: {0}")]
    Other(String),
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaAcquisitionError),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("ICE error: {0}")]
    Ice(String),

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
