//! Media controller for the local microphone, camera and screen share
//!
//! Owns [`LocalMediaState`] and turns axis toggles into device acquisitions
//! plus the sender changes peers have to apply.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::device::MediaDevices;
use super::track::{LocalTrack, TrackSource};
use crate::error::MediaAcquisitionError;
use crate::webrtc::signaling::TrackKind;

/// Notifications from device tracks, fed back into the session loop
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// The OS or the user ended display capture outside the app
    ScreenShareEnded { track_id: String },
}

/// A sender change every peer has to apply
#[derive(Debug, Clone)]
pub struct TrackUpdate {
    pub kind: TrackKind,
    /// New track for the sender, `None` detaches it
    pub track: Option<Arc<LocalTrack>>,
}

/// Outcome of an operation that changed local media state
///
/// Every change is broadcast as a status update. `track` is set when peers
/// also have to swap a sender and renegotiate.
#[derive(Debug, Clone, Default)]
pub struct MediaChange {
    pub track: Option<TrackUpdate>,
    /// Non-fatal problem hit while reverting (camera could not be reopened)
    pub warning: Option<MediaAcquisitionError>,
}

impl MediaChange {
    fn state_only() -> Self {
        Self::default()
    }

    fn with_track(kind: TrackKind, track: Option<Arc<LocalTrack>>) -> Self {
        Self {
            track: Some(TrackUpdate { kind, track }),
            warning: None,
        }
    }
}

/// Local device state
#[derive(Debug, Default)]
pub struct LocalMediaState {
    pub audio_track: Option<Arc<LocalTrack>>,
    pub camera_track: Option<Arc<LocalTrack>>,
    pub screen_track: Option<Arc<LocalTrack>>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub is_screen_sharing: bool,
}

impl LocalMediaState {
    /// Track currently feeding the video sender
    pub fn video_track(&self) -> Option<Arc<LocalTrack>> {
        if self.is_screen_sharing {
            self.screen_track.clone()
        } else if self.video_enabled {
            self.camera_track.clone()
        } else {
            None
        }
    }

    /// Tracks every new peer connection starts with
    pub fn outgoing_tracks(&self) -> Vec<(TrackKind, Arc<LocalTrack>)> {
        let mut tracks = Vec::with_capacity(2);
        if let Some(ref audio) = self.audio_track {
            tracks.push((TrackKind::Audio, audio.clone()));
        }
        if let Some(video) = self.video_track() {
            tracks.push((TrackKind::Video, video));
        }
        tracks
    }

    pub fn muted(&self) -> bool {
        !self.audio_enabled
    }

    pub fn camera_off(&self) -> bool {
        !self.video_enabled
    }
}

/// Snapshot of the three axes, as broadcast in status updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaStatus {
    pub muted: bool,
    pub camera_off: bool,
    pub is_screen_sharing: bool,
}

type MediaResult = std::result::Result<Option<MediaChange>, MediaAcquisitionError>;

pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    state: LocalMediaState,
    events: mpsc::UnboundedSender<MediaEvent>,
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>, events: mpsc::UnboundedSender<MediaEvent>) -> Self {
        Self {
            devices,
            state: LocalMediaState::default(),
            events,
        }
    }

    pub fn state(&self) -> &LocalMediaState {
        &self.state
    }

    pub fn status(&self) -> MediaStatus {
        MediaStatus {
            muted: self.state.muted(),
            camera_off: self.state.camera_off(),
            is_screen_sharing: self.state.is_screen_sharing,
        }
    }

    /// Open the microphone in the muted state
    pub async fn start_muted_microphone(&mut self) -> MediaResult {
        if self.state.audio_track.as_ref().is_some_and(|t| t.is_live()) {
            return Ok(None);
        }

        let track = self.devices.acquire(TrackSource::Microphone).await?;
        track.set_enabled(false);
        info!("Microphone opened muted ({})", track.id());

        self.state.audio_track = Some(track.clone());
        self.state.audio_enabled = false;
        Ok(Some(MediaChange::with_track(TrackKind::Audio, Some(track))))
    }

    pub async fn toggle_mic(&mut self) -> MediaResult {
        let on = !self.state.audio_enabled;
        self.set_mic(on).await
    }

    pub async fn set_mic(&mut self, on: bool) -> MediaResult {
        if on == self.state.audio_enabled {
            return Ok(None);
        }

        if !on {
            if let Some(ref track) = self.state.audio_track {
                track.set_enabled(false);
            }
            self.state.audio_enabled = false;
            info!("Microphone muted");
            return Ok(Some(MediaChange::state_only()));
        }

        if let Some(track) = self.state.audio_track.as_ref().filter(|t| t.is_live()) {
            track.set_enabled(true);
            self.state.audio_enabled = true;
            info!("Microphone unmuted");
            return Ok(Some(MediaChange::state_only()));
        }

        let track = self.devices.acquire(TrackSource::Microphone).await?;
        info!("Microphone opened ({})", track.id());
        self.state.audio_track = Some(track.clone());
        self.state.audio_enabled = true;
        Ok(Some(MediaChange::with_track(TrackKind::Audio, Some(track))))
    }

    pub async fn toggle_camera(&mut self) -> MediaResult {
        let on = !self.state.video_enabled;
        self.set_camera(on).await
    }

    pub async fn set_camera(&mut self, on: bool) -> MediaResult {
        if on == self.state.video_enabled {
            return Ok(None);
        }

        if on {
            let track = self.devices.acquire(TrackSource::Camera).await?;
            info!("Camera opened ({})", track.id());
            self.state.camera_track = Some(track.clone());
            self.state.video_enabled = true;

            if self.state.is_screen_sharing {
                return Ok(Some(MediaChange::state_only()));
            }
            return Ok(Some(MediaChange::with_track(TrackKind::Video, Some(track))));
        }

        if let Some(track) = self.state.camera_track.take() {
            track.stop();
        }
        self.state.video_enabled = false;
        info!("Camera stopped");

        if self.state.is_screen_sharing {
            Ok(Some(MediaChange::state_only()))
        } else {
            Ok(Some(MediaChange::with_track(TrackKind::Video, None)))
        }
    }

    pub async fn toggle_screen_share(&mut self) -> MediaResult {
        let on = !self.state.is_screen_sharing;
        self.set_screen_share(on).await
    }

    pub async fn set_screen_share(&mut self, on: bool) -> MediaResult {
        if on == self.state.is_screen_sharing {
            return Ok(None);
        }

        if !on {
            return Ok(Some(self.revert_from_screen().await));
        }

        let track = self.devices.acquire(TrackSource::Screen).await?;
        info!("Screen share started ({})", track.id());
        self.watch_ended(&track);
        self.state.screen_track = Some(track.clone());
        self.state.is_screen_sharing = true;
        Ok(Some(MediaChange::with_track(TrackKind::Video, Some(track))))
    }

    /// Display capture ended on its own
    ///
    /// Ignored unless `track_id` is the share currently in use.
    pub async fn screen_share_ended(&mut self, track_id: &str) -> Option<MediaChange> {
        let current = self
            .state
            .screen_track
            .as_ref()
            .is_some_and(|t| t.id() == track_id);
        if !current || !self.state.is_screen_sharing {
            debug!("Ignoring end of stale screen share {}", track_id);
            return None;
        }

        info!("Screen share ended by the system");
        Some(self.revert_from_screen().await)
    }

    /// Stop every device (session leave)
    pub fn stop_all(&mut self) {
        for track in [
            self.state.audio_track.take(),
            self.state.camera_track.take(),
            self.state.screen_track.take(),
        ]
        .into_iter()
        .flatten()
        {
            track.stop();
        }
        self.state = LocalMediaState::default();
        info!("All local media stopped");
    }

    async fn revert_from_screen(&mut self) -> MediaChange {
        if let Some(track) = self.state.screen_track.take() {
            track.stop();
        }
        self.state.is_screen_sharing = false;

        if !self.state.video_enabled {
            return MediaChange::with_track(TrackKind::Video, None);
        }

        if let Some(camera) = self.state.camera_track.as_ref().filter(|t| t.is_live()) {
            return MediaChange::with_track(TrackKind::Video, Some(camera.clone()));
        }

        match self.devices.acquire(TrackSource::Camera).await {
            Ok(camera) => {
                info!("Camera reopened after screen share ({})", camera.id());
                self.state.camera_track = Some(camera.clone());
                MediaChange::with_track(TrackKind::Video, Some(camera))
            }
            Err(e) => {
                warn!("Could not reopen camera after screen share: {}", e);
                self.state.camera_track = None;
                self.state.video_enabled = false;
                MediaChange {
                    track: Some(TrackUpdate {
                        kind: TrackKind::Video,
                        track: None,
                    }),
                    warning: Some(e),
                }
            }
        }
    }

    fn watch_ended(&self, track: &Arc<LocalTrack>) {
        let mut ended = track.ended();
        let ended_flag = track.ended();
        let stop = track.stop_token();
        let track_id = track.id().to_string();
        let events = self.events.clone();

        tokio::spawn(async move {
            let fired = tokio::select! {
                biased;
                res = ended.wait_for(|e| *e) => res.is_ok(),
                _ = stop.cancelled() => *ended_flag.borrow(),
            };
            if fired {
                let _ = events.send(MediaEvent::ScreenShareEnded { track_id });
            }
        });
    }
}
