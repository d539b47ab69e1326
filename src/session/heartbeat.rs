//! Periodic activity ping keeping the study group alive

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::api::ActivityPinger;
use crate::utils::LogThrottler;

/// Background task calling `update_activity` right away and then every `period`
pub struct Heartbeat {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Heartbeat {
    pub fn start(pinger: Arc<dyn ActivityPinger>, period: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let throttler = LogThrottler::with_secs(300);
            let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match pinger.update_activity().await {
                    Ok(()) => {
                        debug!("Activity updated");
                        throttler.clear("activity");
                    }
                    Err(e) => {
                        if throttler.should_log("activity") {
                            warn!("Failed to update activity: {}", e);
                        }
                    }
                }
            }
            debug!("Heartbeat stopped");
        });

        Self { cancel, task }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}
