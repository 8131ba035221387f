use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::events::ProgressSink;

/// When a progress event is due.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Throttle {
    /// After at least this many more bytes.
    Bytes(u64),
    /// After at least this many more percentage points.
    Percent(f32),
}

#[derive(Debug, Default)]
struct Reported {
    bytes: u64,
    percent: f32,
}

/// Byte counter shared by every worker of one download.
///
/// Emitted percentages never decrease, even when a retried range rewinds its
/// contribution.
#[derive(Debug)]
pub(crate) struct ProgressTracker {
    written: AtomicU64,
    expected: Option<u64>,
    throttle: Throttle,
    reported: Mutex<Reported>,
    sink: ProgressSink,
}

impl ProgressTracker {
    pub(crate) fn new(expected: Option<u64>, throttle: Throttle, sink: ProgressSink) -> Self {
        Self {
            written: AtomicU64::new(0),
            expected,
            throttle,
            reported: Mutex::new(Reported::default()),
            sink,
        }
    }

    pub(crate) fn written(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    fn percent_of(&self, bytes: u64) -> Option<f32> {
        match self.expected {
            Some(expected) if expected > 0 => {
                Some((bytes as f64 * 100.0 / expected as f64).min(100.0) as f32)
            }
            _ => None,
        }
    }

    pub(crate) fn start(&self) {
        self.sink.report(0.0);
    }

    pub(crate) fn advance(&self, bytes: u64) {
        let now = self.written.fetch_add(bytes, Ordering::AcqRel) + bytes;
        let Some(percent) = self.percent_of(now) else {
            return;
        };

        // Emitting under the lock keeps events ordered across workers.
        let mut reported = self.reported.lock();
        let due = match self.throttle {
            Throttle::Bytes(interval) => now >= reported.bytes.saturating_add(interval),
            Throttle::Percent(step) => percent >= reported.percent + step,
        };
        if !due || percent <= reported.percent {
            return;
        }
        reported.bytes = now;
        reported.percent = percent;
        self.sink.report(percent);
    }

    /// Undo the contribution of a failed attempt.
    pub(crate) fn rewind(&self, bytes: u64) {
        if bytes > 0 {
            self.written.fetch_sub(bytes, Ordering::AcqRel);
        }
    }

    /// Emit the final 100% unless it was already reported.
    pub(crate) fn finish(&self) {
        let mut reported = self.reported.lock();
        if reported.percent < 100.0 {
            reported.percent = 100.0;
            self.sink.report(100.0);
        }
    }
}
