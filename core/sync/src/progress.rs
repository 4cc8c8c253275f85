//! Progress reporting.

use tokio::sync::watch;

use crate::stats::SyncOutcome;

/// Receiver of `(fraction, status)` updates. Purely observational.
pub trait ProgressSink: Send + Sync {
    fn report(&self, fraction: f64, status: &str);
}

impl<F> ProgressSink for F
where
    F: Fn(f64, &str) + Send + Sync,
{
    fn report(&self, fraction: f64, status: &str) {
        self(fraction, status)
    }
}

/// Sink that drops every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _fraction: f64, _status: &str) {}
}

/// Engine state published to watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    Idle,
    Syncing { fraction: f64, status: String },
    Finished(SyncOutcome),
}

/// Monotonic progress for one pass, fanned out to the sink and the status
/// channel.
pub(crate) struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    status: &'a watch::Sender<EngineStatus>,
    last: f64,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(sink: &'a dyn ProgressSink, status: &'a watch::Sender<EngineStatus>) -> Self {
        Self {
            sink,
            status,
            last: 0.0,
        }
    }

    /// Report `fraction`; values below the last one are raised to it.
    pub(crate) fn report(&mut self, fraction: f64, status: &str) {
        let fraction = fraction.clamp(0.0, 1.0).max(self.last);
        self.last = fraction;
        self.sink.report(fraction, status);
        self.status.send_replace(EngineStatus::Syncing {
            fraction,
            status: status.to_string(),
        });
    }

    /// Report the point `step` of `steps` inside `[start, end]`.
    pub(crate) fn report_within(&mut self, start: f64, end: f64, step: u32, steps: u32, status: &str) {
        let local = if steps == 0 { 1.0 } else { step as f64 / steps as f64 };
        self.report(start + (end - start) * local, status);
    }

    pub(crate) fn last(&self) -> f64 {
        self.last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_tracker_is_monotonic() {
        let seen = Mutex::new(Vec::new());
        let sink = |fraction: f64, _status: &str| seen.lock().unwrap().push(fraction);
        let (tx, rx) = watch::channel(EngineStatus::Idle);

        let mut tracker = ProgressTracker::new(&sink, &tx);
        tracker.report(0.2, "a");
        tracker.report(0.1, "b");
        tracker.report_within(0.5, 1.0, 1, 2, "c");
        tracker.report(3.0, "d");

        assert_eq!(*seen.lock().unwrap(), vec![0.2, 0.2, 0.75, 1.0]);
        assert_eq!(tracker.last(), 1.0);
        assert_eq!(
            *rx.borrow(),
            EngineStatus::Syncing {
                fraction: 1.0,
                status: "d".to_string()
            }
        );
    }

    #[test]
    fn test_no_progress_accepts_updates() {
        NoProgress.report(0.5, "ignored");
    }
}
