//! Local capture tracks shared between the media controller and every peer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{AppError, Result};
use crate::webrtc::signaling::TrackKind;

/// PCM frame (mono, f32, 48 kHz) published by an audio source
pub type AudioFrame = Arc<[f32]>;

/// Sample rate of the PCM tap
pub const PCM_SAMPLE_RATE: u32 = 48_000;

const PCM_CHANNEL_CAPACITY: usize = 64;

/// Where a local track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

impl std::fmt::Display for TrackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackSource::Microphone => write!(f, "microphone"),
            TrackSource::Camera => write!(f, "camera"),
            TrackSource::Screen => write!(f, "screen"),
        }
    }
}

/// A captured local track
///
/// One instance is shared (`Arc`) by the media controller and the sender of
/// every peer connection. Disabling keeps the track attached but muted;
/// stopping releases the device for good.
pub struct LocalTrack {
    id: String,
    label: String,
    source: TrackSource,
    enabled: AtomicBool,
    stop_token: CancellationToken,
    ended_tx: watch::Sender<bool>,
    rtp: Arc<TrackLocalStaticSample>,
    pcm_tx: Option<broadcast::Sender<AudioFrame>>,
}

impl LocalTrack {
    /// Create a track for a capture source
    pub fn new(source: TrackSource, label: impl Into<String>, stream_id: &str) -> Self {
        let id = format!("{}-{}", source, uuid::Uuid::new_v4());
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec_for(source),
            id.clone(),
            stream_id.to_string(),
        ));
        let pcm_tx = match source {
            TrackSource::Microphone => Some(broadcast::channel(PCM_CHANNEL_CAPACITY).0),
            _ => None,
        };
        let (ended_tx, _) = watch::channel(false);

        Self {
            id,
            label: label.into(),
            source,
            enabled: AtomicBool::new(true),
            stop_token: CancellationToken::new(),
            ended_tx,
            rtp,
            pcm_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track and release its device. Does not signal `ended`.
    pub fn stop(&self) {
        self.stop_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Live means not stopped; a disabled track is still live
    pub fn is_live(&self) -> bool {
        !self.is_stopped()
    }

    /// The source went away on its own (device unplugged, share stopped by the OS)
    pub fn end(&self) {
        let _ = self.ended_tx.send(true);
        self.stop_token.cancel();
    }

    /// Watch for the source ending on its own
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.ended_tx.subscribe()
    }

    /// Token cancelled when the track stops, for producer tasks
    pub fn stop_token(&self) -> CancellationToken {
        self.stop_token.clone()
    }

    /// Get track as TrackLocal
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtp.clone()
    }

    /// Subscribe to raw PCM from an audio source
    pub fn subscribe_pcm(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        self.pcm_tx.as_ref().map(|tx| tx.subscribe())
    }

    /// Publish a PCM frame to analysers
    pub fn push_pcm(&self, frame: AudioFrame) {
        if let Some(ref tx) = self.pcm_tx {
            let _ = tx.send(frame);
        }
    }

    /// Write an encoded media sample to every attached sender
    pub async fn write_sample(&self, data: &[u8], duration: Duration) -> Result<()> {
        if data.is_empty() || !self.is_enabled() || self.is_stopped() {
            return Ok(());
        }

        let sample = Sample {
            data: Bytes::copy_from_slice(data),
            duration,
            ..Default::default()
        };

        self.rtp
            .write_sample(&sample)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to write sample: {}", e)))
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

fn codec_for(source: TrackSource) -> RTCRtpCodecCapability {
    match source {
        TrackSource::Microphone => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        TrackSource::Camera | TrackSource::Screen => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_not_ended() {
        let track = LocalTrack::new(TrackSource::Camera, "cam", "local");
        let ended = track.ended();
        track.stop();
        assert!(track.is_stopped());
        assert!(!*ended.borrow());
    }

    #[test]
    fn test_ended_pending_until_end() {
        let track = LocalTrack::new(TrackSource::Screen, "screen", "local");
        let mut ended = track.ended();
        let mut wait = tokio_test::task::spawn(async move { ended.changed().await });

        tokio_test::assert_pending!(wait.poll());
        track.set_enabled(false);
        tokio_test::assert_pending!(wait.poll());

        track.end();
        assert!(wait.is_woken());
        tokio_test::assert_ready_ok!(wait.poll());
    }

    #[tokio::test]
    async fn test_end_signals_watchers() {
        let track = LocalTrack::new(TrackSource::Screen, "screen", "local");
        let mut ended = track.ended();
        track.end();
        ended.wait_for(|e| *e).await.unwrap();
        assert!(!track.is_live());
    }

    #[test]
    fn test_pcm_tap_only_on_audio() {
        let mic = LocalTrack::new(TrackSource::Microphone, "mic", "local");
        let cam = LocalTrack::new(TrackSource::Camera, "cam", "local");
        assert!(mic.subscribe_pcm().is_some());
        assert!(cam.subscribe_pcm().is_none());
        assert_eq!(mic.kind(), TrackKind::Audio);
        assert_eq!(cam.kind(), TrackKind::Video);
    }
}
