//! Background task that closes sessions once their deadline passes.
//!
//! Runs independently of any camera loop so a stopped camera never leaves
//! a session open. Failed closes are logged and retried on the next tick.

use crate::manager::AttendanceSessionManager;
use chrono::{Local, NaiveDateTime};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

pub fn local_clock() -> Clock {
    Arc::new(|| Local::now().naive_local())
}

pub struct DeadlineScheduler {
    manager: Arc<AttendanceSessionManager>,
    interval: Duration,
    clock: Clock,
}

impl DeadlineScheduler {
    pub fn new(manager: Arc<AttendanceSessionManager>, interval: Duration) -> Self {
        Self {
            manager,
            interval,
            clock: local_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// One sweep. Returns how many sessions were closed.
    pub async fn tick(&self) -> usize {
        let manager = Arc::clone(&self.manager);
        let now = (self.clock)();
        let results = match tokio::task::spawn_blocking(move || manager.close_expired(now)).await {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(error = %e, "deadline sweep panicked");
                return 0;
            }
        };

        let mut closed = 0;
        for (session, result) in results {
            match result {
                Ok(summary) => {
                    closed += 1;
                    tracing::info!(
                        %session,
                        key = %summary.key,
                        present = summary.present,
                        late = summary.late,
                        absent = summary.absent,
                        rate = summary.attendance_rate,
                        "session closed at deadline"
                    );
                }
                Err(e) => {
                    tracing::error!(%session, error = %e, "closing expired session failed, will retry");
                }
            }
        }
        closed
    }

    /// Sweep every `interval` until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "deadline scheduler started");
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("deadline scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    let closed = self.tick().await;
                    if closed == 0 {
                        tracing::trace!("deadline sweep: nothing expired");
                    }
                }
            }
        }
    }
}
