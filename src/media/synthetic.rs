//! Synthetic capture devices for headless participants and tests
//!
//! The microphone publishes 20 ms PCM frames on its tap: silence, or
//! broadband noise that alternates between talking and quiet phases when a
//! speech pattern is configured. Camera and screen tracks carry no frames.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::device::MediaDevices;
use super::track::{AudioFrame, LocalTrack, TrackSource, PCM_SAMPLE_RATE};
use crate::error::MediaAcquisitionError;

const FRAME_MS: u64 = 20;
const FRAME_SAMPLES: usize = (PCM_SAMPLE_RATE as usize / 1000) * FRAME_MS as usize;

/// Talk/quiet cycle of the synthetic microphone
#[derive(Debug, Clone, Copy)]
pub struct SpeechPattern {
    pub talk: Duration,
    pub quiet: Duration,
    pub amplitude: f32,
}

impl Default for SpeechPattern {
    fn default() -> Self {
        Self {
            talk: Duration::from_secs(2),
            quiet: Duration::from_secs(3),
            amplitude: 0.3,
        }
    }
}

/// Device provider that fabricates tracks
pub struct SyntheticDevices {
    stream_id: String,
    speech: Option<SpeechPattern>,
    failures: Mutex<HashMap<TrackSource, MediaAcquisitionError>>,
    opened: Mutex<Vec<Arc<LocalTrack>>>,
}

impl SyntheticDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            speech: None,
            failures: Mutex::new(HashMap::new()),
            opened: Mutex::new(vec![]),
        }
    }

    /// Make the microphone produce a talk/quiet tone cycle
    pub fn with_speech(mut self, pattern: SpeechPattern) -> Self {
        self.speech = Some(pattern);
        self
    }

    /// Make every acquisition of `source` fail with `error` until cleared
    pub fn fail(&self, source: TrackSource, error: MediaAcquisitionError) {
        self.failures.lock().insert(source, error);
    }

    pub fn clear_failure(&self, source: TrackSource) {
        self.failures.lock().remove(&source);
    }

    /// Every track handed out so far
    pub fn opened(&self) -> Vec<Arc<LocalTrack>> {
        self.opened.lock().clone()
    }

    pub fn opened_count(&self, source: TrackSource) -> usize {
        self.opened
            .lock()
            .iter()
            .filter(|t| t.source() == source)
            .count()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(&self, source: TrackSource) -> Result<Arc<LocalTrack>, MediaAcquisitionError> {
        if let Some(err) = self.failures.lock().get(&source).cloned() {
            debug!("Synthetic {} acquisition refused: {}", source, err);
            return Err(err);
        }

        let track = Arc::new(LocalTrack::new(
            source,
            format!("synthetic {}", source),
            &self.stream_id,
        ));

        if source == TrackSource::Microphone {
            spawn_pcm_generator(track.clone(), self.speech);
        }

        info!("Opened synthetic {} ({})", source, track.id());
        self.opened.lock().push(track.clone());
        Ok(track)
    }
}

fn spawn_pcm_generator(track: Arc<LocalTrack>, speech: Option<SpeechPattern>) {
    let stop = track.stop_token();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
        let mut elapsed = Duration::ZERO;
        let mut noise = 0x9e37_79b9u32;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let talking = speech.is_some_and(|p| {
                let cycle = (p.talk + p.quiet).as_millis().max(1);
                elapsed.as_millis() % cycle < p.talk.as_millis()
            });

            let frame: AudioFrame = match speech {
                Some(p) if talking && track.is_enabled() => {
                    let samples: Vec<f32> = (0..FRAME_SAMPLES)
                        .map(|_| {
                            noise ^= noise << 13;
                            noise ^= noise >> 17;
                            noise ^= noise << 5;
                            p.amplitude * (noise as f32 / u32::MAX as f32 * 2.0 - 1.0)
                        })
                        .collect();
                    samples.into()
                }
                _ => vec![0.0f32; FRAME_SAMPLES].into(),
            };

            track.push_pcm(frame);
            elapsed += Duration::from_millis(FRAME_MS);
        }

        debug!("Synthetic PCM generator for {} stopped", track.id());
    });
}
