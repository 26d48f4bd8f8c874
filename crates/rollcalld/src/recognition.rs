//! Sampled recognition loop: frame source → engine → session manager.

use crate::capture::{Frame, FrameSource};
use crate::engine::EngineHandle;
use chrono::NaiveDateTime;
use rollcall_attendance::{AttendanceSessionManager, ObserveOutcome, SessionError, SessionKey};
use rollcall_core::MatchResult;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What one sampled frame produced.
#[derive(Debug, Default, PartialEq)]
pub struct TickReport {
    pub faces: usize,
    pub recorded: usize,
    pub duplicates: usize,
    pub ignored: usize,
}

pub struct RecognitionLoop {
    source: Box<dyn FrameSource>,
    engine: EngineHandle,
    manager: Arc<AttendanceSessionManager>,
    class_id: String,
    interval: Duration,
}

impl RecognitionLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        engine: EngineHandle,
        manager: Arc<AttendanceSessionManager>,
        class_id: String,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            engine,
            manager,
            class_id,
            interval,
        }
    }

    /// Sample one frame and feed its matches to the class's current session.
    pub async fn tick(&mut self) -> TickReport {
        let frame = match self.source.latest() {
            Ok(Some(frame)) => frame,
            Ok(None) => return TickReport::default(),
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                return TickReport::default();
            }
        };
        if frame.is_dark() {
            tracing::debug!(sequence = frame.sequence, brightness = frame.avg_brightness(), "skipping dark frame");
            return TickReport::default();
        }
        self.process(frame).await
    }

    async fn process(&mut self, frame: Frame) -> TickReport {
        let Frame {
            image,
            captured_at,
            sequence,
            origin,
        } = frame;

        let results = match self.engine.recognize(image).await {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(sequence, error = %e, "recognition failed");
                return TickReport::default();
            }
        };
        let faces = results.len();
        if results.is_empty() {
            return TickReport::default();
        }

        // Session calls write to the ledger under a blocking mutex.
        let manager = Arc::clone(&self.manager);
        let class_id = self.class_id.clone();
        let snapshot = origin.map(|p| p.display().to_string());
        let recorded = tokio::task::spawn_blocking(move || {
            record_matches(&manager, &class_id, &results, captured_at, snapshot)
        })
        .await;

        match recorded {
            Ok(report) => {
                tracing::debug!(sequence, ?report, "frame processed");
                report
            }
            Err(e) => {
                tracing::error!(sequence, error = %e, "recording matches panicked");
                TickReport {
                    faces,
                    ..TickReport::default()
                }
            }
        }
    }

    /// Sample every `interval` until `cancel` fires.
    ///
    /// Stopping the loop leaves sessions to the deadline scheduler.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(
            class_id = %self.class_id,
            interval_ms = self.interval.as_millis() as u64,
            "recognition loop started"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("recognition loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

/// Feed one frame's matches to the class's session for the capture time.
fn record_matches(
    manager: &AttendanceSessionManager,
    class_id: &str,
    results: &[MatchResult],
    captured_at: NaiveDateTime,
    snapshot: Option<String>,
) -> TickReport {
    let mut report = TickReport {
        faces: results.len(),
        ..TickReport::default()
    };

    let slot = manager.config().slot_schedule.slot_at(captured_at.time());
    let key = SessionKey::new(class_id, captured_at.date(), slot);
    let session = match manager.ensure_open(key, None) {
        Ok(session) => session,
        Err(SessionError::SessionClosed(key)) => {
            tracing::debug!(%key, "session already closed, frame dropped");
            return report;
        }
        Err(e) => {
            tracing::error!(error = %e, "cannot open attendance session");
            return report;
        }
    };

    for result in results {
        match manager.observe(session.id, result, captured_at, snapshot.clone()) {
            Ok(ObserveOutcome::Recorded(_)) => report.recorded += 1,
            Ok(ObserveOutcome::Duplicate { .. }) => report.duplicates += 1,
            Ok(ObserveOutcome::Ignored(_)) | Ok(ObserveOutcome::SessionClosed) => report.ignored += 1,
            Err(e) => tracing::error!(session = %session.id, error = %e, "observe failed"),
        }
    }
    report
}
