//! Capture capability interface

use std::sync::Arc;

use async_trait::async_trait;

use super::track::{LocalTrack, TrackSource};
use crate::error::MediaAcquisitionError;

/// Access to capture devices (microphone, camera, screen)
///
/// Each call opens the device and returns a fresh live track, or the reason
/// the device could not be opened.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, source: TrackSource) -> Result<Arc<LocalTrack>, MediaAcquisitionError>;
}
