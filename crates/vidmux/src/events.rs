use std::path::PathBuf;

use tokio::sync::mpsc;

/// Phase labels carried by [`ProgressEvent::Progress`].
pub const PHASE_DOWNLOADING: &str = "Downloading";
pub const PHASE_VIDEO: &str = "Downloading Video Track";
pub const PHASE_AUDIO: &str = "Downloading Audio Track";
pub const PHASE_MERGING: &str = "Merging";

/// Progress of one download task. Exactly one terminal event ends each stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Percent in `[0, 100]` and the current phase label.
    Progress { percent: f32, message: String },
    Success { path: PathBuf },
    Error { message: String },
}

impl ProgressEvent {
    pub fn progress(percent: f32, message: impl Into<String>) -> Self {
        Self::Progress {
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Error { .. })
    }
}

/// Maps a phase-local percentage onto a sub-range of the overall bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressScale {
    pub start: f32,
    pub end: f32,
}

impl ProgressScale {
    pub const FULL: Self = Self::new(0.0, 100.0);

    pub const fn new(start: f32, end: f32) -> Self {
        Self { start, end }
    }

    pub fn map(&self, percent: f32) -> f32 {
        let percent = percent.clamp(0.0, 100.0);
        self.start + (self.end - self.start) * percent / 100.0
    }
}

/// Sender half for progress of one phase.
///
/// Sending never blocks; events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    message: String,
    scale: ProgressScale,
}

impl ProgressSink {
    pub fn new(
        tx: mpsc::UnboundedSender<ProgressEvent>,
        message: impl Into<String>,
        scale: ProgressScale,
    ) -> Self {
        Self {
            tx,
            message: message.into(),
            scale,
        }
    }

    /// Report a phase-local percentage.
    pub fn report(&self, percent: f32) {
        let _ = self
            .tx
            .send(ProgressEvent::progress(self.scale.map(percent), &self.message));
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}
