//! Liveness watchdog for stalled exchanges
//!
//! A conversation stuck in PROCESSING with no traffic either way means the
//! upstream silently dropped the exchange. The watchdog only ever reports;
//! the controller decides what to do about it.

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfig;
use crate::session::{ActivityTracker, SessionState, WorkerEvent};

/// Periodically checks that a thinking model is still producing traffic
pub struct Watchdog {
    config: WatchdogConfig,
    activity: ActivityTracker,
    state: watch::Receiver<SessionState>,
}

impl Watchdog {
    /// Create a watchdog observing `activity` and `state`
    #[must_use]
    pub fn new(
        config: WatchdogConfig,
        activity: ActivityTracker,
        state: watch::Receiver<SessionState>,
    ) -> Self {
        Self {
            config,
            activity,
            state,
        }
    }

    /// Tick until cancelled or a timeout fires.
    ///
    /// Only PROCESSING is policed: silence while listening is normal and
    /// speaking produces its own traffic. One report is sent, then the
    /// watchdog exits; the replacement generation brings a fresh one.
    pub async fn run(self, cancel: CancellationToken, events: mpsc::Sender<WorkerEvent>) {
        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            if *self.state.borrow() != SessionState::Processing {
                continue;
            }

            let idle = self.activity.idle();
            if idle >= self.config.timeout() {
                tracing::warn!(
                    idle_secs = idle.as_secs(),
                    threshold_secs = self.config.timeout_secs,
                    "exchange stalled"
                );
                let _ = events.send(WorkerEvent::WatchdogTimeout { idle }).await;
                return;
            }
        }
    }
}
