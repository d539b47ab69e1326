//! Local speaking detection
//!
//! Samples the microphone PCM tap on a fixed interval, runs it through the
//! spectrum analyser and reports speaking transitions. A disabled (muted)
//! track never counts as speaking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::analyser::SpectrumAnalyser;
use super::track::LocalTrack;
use crate::config::SpeakingConfig;
use crate::error::{AppError, Result};

pub struct SpeakingDetector {
    config: SpeakingConfig,
    cancel: Option<CancellationToken>,
    speaking: Arc<AtomicBool>,
    output: Option<mpsc::UnboundedSender<bool>>,
}

impl SpeakingDetector {
    pub fn new(config: SpeakingConfig) -> Self {
        Self {
            config,
            cancel: None,
            speaking: Arc::new(AtomicBool::new(false)),
            output: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.cancel.is_some()
    }

    /// Last reported state
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Start sampling `track`, replacing any previous run
    ///
    /// Each transition is sent on `output` (`true` = started speaking).
    pub fn start(&mut self, track: Arc<LocalTrack>, output: mpsc::UnboundedSender<bool>) -> Result<()> {
        self.stop();

        let mut pcm = track.subscribe_pcm().ok_or_else(|| {
            AppError::Internal(format!("track {} has no PCM tap", track.id()))
        })?;
        let mut analyser = SpectrumAnalyser::new(&self.config)?;
        let threshold = self.config.threshold;
        let period = Duration::from_millis(self.config.interval_ms.max(1));

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let speaking = self.speaking.clone();
        let tx = output.clone();

        info!("Speaking detection started on {}", track.id());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = pcm.recv() => match frame {
                        Ok(frame) => analyser.push_samples(&frame),
                        Err(RecvError::Lagged(n)) => debug!("Speaking detector skipped {} frames", n),
                        Err(RecvError::Closed) => break,
                    },
                    _ = ticker.tick() => {
                        let level = match analyser.average_level() {
                            Ok(level) => level,
                            Err(e) => {
                                warn!("Speaking analysis failed: {}", e);
                                break;
                            }
                        };
                        let now = level > threshold && track.is_enabled();
                        if speaking.swap(now, Ordering::SeqCst) != now {
                            debug!("Speaking: {} (level {:.1})", now, level);
                            if tx.send(now).is_err() {
                                break;
                            }
                        }
                    }
                }
            }

            debug!("Speaking detection loop for {} exited", track.id());
        });

        self.cancel = Some(cancel);
        self.output = Some(output);
        Ok(())
    }

    /// Stop sampling; a pending "speaking" state is reported as ended
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        let output = self.output.take();
        if self.speaking.swap(false, Ordering::SeqCst) {
            if let Some(tx) = output {
                let _ = tx.send(false);
            }
        }
    }
}

impl Drop for SpeakingDetector {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}
