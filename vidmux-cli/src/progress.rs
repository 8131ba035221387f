use futures::{Stream, StreamExt};
use indicatif::ProgressStyle;
use tracing::{Instrument, Span, error, info, info_span, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;
use vidmux_engine::ProgressEvent;

use crate::error::{AppError, Result};

/// Bar resolution, in steps per percent.
const STEPS_PER_PERCENT: f32 = 10.0;

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{span_child_prefix}{spinner:.green} [{bar:30.green/white}] {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn position(percent: f32) -> u64 {
    (percent.clamp(0.0, 100.0) * STEPS_PER_PERCENT).round() as u64
}

/// Drive a progress bar from `events` until the terminal event.
pub async fn follow<S>(label: &str, events: S) -> Result<std::path::PathBuf>
where
    S: Stream<Item = ProgressEvent> + Unpin,
{
    let span = info_span!("download", target = %label);
    span.pb_set_style(&bar_style());
    span.pb_set_length(position(100.0));
    render(events).instrument(span).await
}

async fn render<S>(mut events: S) -> Result<std::path::PathBuf>
where
    S: Stream<Item = ProgressEvent> + Unpin,
{
    let span = Span::current();
    let mut phase = String::new();
    while let Some(event) = events.next().await {
        match event {
            ProgressEvent::Progress { percent, message } => {
                if message != phase {
                    info!(phase = %message, "Phase started");
                    span.pb_set_message(&message);
                    phase = message;
                }
                span.pb_set_position(position(percent));
            }
            ProgressEvent::Success { path } => {
                span.pb_set_position(position(100.0));
                info!(path = %path.display(), "Saved");
                return Ok(path);
            }
            ProgressEvent::Error { message } => {
                error!(%message, "Download failed");
                return Err(AppError::Failed(message));
            }
        }
    }
    warn!("Progress stream ended without a result");
    Err(AppError::Failed("download ended unexpectedly".to_string()))
}
