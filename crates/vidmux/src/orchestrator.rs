//! # Download Orchestrator
//!
//! Drives one user request from stream resolution to a playable file: an existing
//! file short-circuits, combined and audio-only streams are fetched directly, and
//! video-only streams are fetched together with the best matching audio stream and
//! muxed. Progress of every phase is mapped onto one monotonic 0-100 bar.

use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::DownloadError;
use crate::catalog::{CatalogOptions, StreamDescriptor, build_catalog};
use crate::context::EngineContext;
use crate::download::DownloadTask;
use crate::error::MuxError;
use crate::events::{
    PHASE_AUDIO, PHASE_DOWNLOADING, PHASE_MERGING, PHASE_VIDEO, ProgressEvent, ProgressScale,
    ProgressSink,
};
use crate::mux::{MuxJob, mux};
use crate::naming;
use crate::source::StreamSource;

const VIDEO_SCALE: ProgressScale = ProgressScale::new(0.0, 70.0);
const AUDIO_SCALE: ProgressScale = ProgressScale::new(70.0, 95.0);
const MERGE_START: f32 = 95.0;

/// What the caller picked from a catalog.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Page the stream list was extracted from.
    pub page_url: String,
    pub title: String,
    pub stream: StreamDescriptor,
}

/// States of one request, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolving,
    DirectDownloading,
    VideoTrack,
    AudioTrack,
    Merging,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Resolving => "Resolving streams",
            Self::DirectDownloading => PHASE_DOWNLOADING,
            Self::VideoTrack => PHASE_VIDEO,
            Self::AudioTrack => PHASE_AUDIO,
            Self::Merging => PHASE_MERGING,
        })
    }
}

/// A failure tagged with the phase it happened in.
#[derive(Debug)]
struct Failure {
    phase: Phase,
    error: DownloadError,
}

impl Failure {
    fn at(phase: Phase) -> impl FnOnce(DownloadError) -> Self {
        move |error| Self { phase, error }
    }

    fn message(&self) -> String {
        match self.error {
            DownloadError::Cancelled => "Download cancelled".to_string(),
            _ => format!("{} failed: {}", self.phase, self.error),
        }
    }
}

/// Progress stream of a running request.
///
/// Dropping the handle cancels the request.
pub struct DownloadHandle {
    events: UnboundedReceiverStream<ProgressEvent>,
    token: CancellationToken,
    _guard: DropGuard,
}

impl DownloadHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Stream for DownloadHandle {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

/// Removes temporary track files when dropped.
struct TempFiles(Vec<PathBuf>);

impl TempFiles {
    fn track(&mut self, path: PathBuf) -> PathBuf {
        self.0.push(path.clone());
        path
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in &self.0 {
            match std::fs::remove_file(path) {
                Ok(()) => debug!(path = %path.display(), "Removed temporary file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
            }
        }
    }
}

#[derive(Clone)]
pub struct DownloadOrchestrator {
    ctx: Arc<EngineContext>,
    source: Arc<dyn StreamSource>,
}

impl DownloadOrchestrator {
    pub fn new(ctx: Arc<EngineContext>, source: Arc<dyn StreamSource>) -> Self {
        Self { ctx, source }
    }

    /// Final path of `request` inside the output directory.
    pub fn final_path(&self, request: &DownloadRequest) -> PathBuf {
        self.ctx
            .config()
            .output_dir
            .join(naming::final_file_name(&request.title, &request.stream))
    }

    /// Start `request` in a spawned task.
    pub fn acquire(&self, request: DownloadRequest) -> DownloadHandle {
        self.acquire_with_token(request, CancellationToken::new())
    }

    /// Start `request` under a child of `parent`.
    pub fn acquire_with_token(
        &self,
        request: DownloadRequest,
        parent: CancellationToken,
    ) -> DownloadHandle {
        let token = parent.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let span = info_span!("acquire", id = %request.stream.id, title = %request.title);

        let this = self.clone();
        let task_token = token.clone();
        tokio::spawn(
            async move {
                let event = match this.run(&request, &tx, &task_token).await {
                    Ok(path) => {
                        info!(path = %path.display(), "Request complete");
                        ProgressEvent::Success { path }
                    }
                    Err(failure) => {
                        error!(phase = %failure.phase, error = %failure.error, "Request failed");
                        ProgressEvent::Error {
                            message: failure.message(),
                        }
                    }
                };
                let _ = tx.send(event);
            }
            .instrument(span),
        );

        DownloadHandle {
            events: UnboundedReceiverStream::new(rx),
            _guard: token.clone().drop_guard(),
            token,
        }
    }

    async fn run(
        &self,
        request: &DownloadRequest,
        tx: &mpsc::UnboundedSender<ProgressEvent>,
        token: &CancellationToken,
    ) -> Result<PathBuf, Failure> {
        let final_path = self.final_path(request);

        if is_complete(&final_path).await {
            info!(path = %final_path.display(), "File already present, skipping download");
            let _ = tx.send(ProgressEvent::progress(100.0, PHASE_DOWNLOADING));
            return Ok(final_path);
        }

        let (stream, catalog) = self
            .resolve(request, token)
            .await
            .map_err(Failure::at(Phase::Resolving))?;

        if stream.combined || stream.is_audio_only() {
            let task = DownloadTask::new(&stream.url, &final_path)
                .with_known_length(stream.filesize)
                .with_status_prefix(PHASE_DOWNLOADING);
            let sink = ProgressSink::new(tx.clone(), PHASE_DOWNLOADING, ProgressScale::FULL);
            self.ctx
                .downloader()
                .fetch(&task, sink, token)
                .await
                .map_err(Failure::at(Phase::DirectDownloading))?;
            return Ok(final_path);
        }

        let family = stream.family.ok_or_else(|| Failure {
            phase: Phase::Resolving,
            error: DownloadError::configuration(format!(
                "container `{}` of format {} cannot be muxed",
                stream.container, stream.id
            )),
        })?;
        let audio = catalog
            .best_audio_for(family)
            .cloned()
            .ok_or_else(|| Failure {
                phase: Phase::Resolving,
                error: DownloadError::StreamNotFound {
                    id: format!("{family} audio for {}", stream.id),
                },
            })?;
        debug!(video = %stream.id, audio = %audio.id, "Selected split streams");

        let output_dir = &self.ctx.config().output_dir;
        let mut temps = TempFiles(Vec::new());
        let video_tmp = temps.track(output_dir.join(naming::temp_track_name(family, false)));
        let audio_tmp = temps.track(output_dir.join(naming::temp_track_name(family, true)));

        self.fetch_track(&stream, &video_tmp, PHASE_VIDEO, VIDEO_SCALE, tx, token)
            .await
            .map_err(Failure::at(Phase::VideoTrack))?;
        self.fetch_track(&audio, &audio_tmp, PHASE_AUDIO, AUDIO_SCALE, tx, token)
            .await
            .map_err(Failure::at(Phase::AudioTrack))?;

        let _ = tx.send(ProgressEvent::progress(MERGE_START, PHASE_MERGING));
        let job = MuxJob::new(&video_tmp, &audio_tmp, &final_path, family)
            .with_buffer_size(self.ctx.config().mux_buffer_size)
            .with_cancellation(token.clone());
        mux(job).await.map_err(|e| Failure {
            phase: Phase::Merging,
            error: match e {
                MuxError::Cancelled => DownloadError::Cancelled,
                other => DownloadError::from(other),
            },
        })?;
        let _ = tx.send(ProgressEvent::progress(100.0, PHASE_MERGING));

        drop(temps);
        Ok(final_path)
    }

    /// Re-fetch the listing and look the requested stream up again.
    async fn resolve(
        &self,
        request: &DownloadRequest,
        token: &CancellationToken,
    ) -> Result<(StreamDescriptor, crate::catalog::Catalog), DownloadError> {
        let listing = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            listing = self.source.fetch_streams(&request.page_url) => listing?,
        };
        let options = CatalogOptions {
            preferred_family: self.ctx.config().preferred_family,
        };
        let catalog = build_catalog(&listing.streams, listing.duration_secs, &options);
        let stream = catalog
            .find(&request.stream.id)
            .cloned()
            .ok_or_else(|| DownloadError::StreamNotFound {
                id: request.stream.id.clone(),
            })?;
        Ok((stream, catalog))
    }

    async fn fetch_track(
        &self,
        stream: &StreamDescriptor,
        path: &Path,
        label: &str,
        scale: ProgressScale,
        tx: &mpsc::UnboundedSender<ProgressEvent>,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let task = DownloadTask::new(&stream.url, path)
            .with_known_length(stream.filesize)
            .with_status_prefix(label);
        let sink = ProgressSink::new(tx.clone(), label, scale);
        self.ctx.downloader().fetch(&task, sink, token).await
    }
}

async fn is_complete(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}
