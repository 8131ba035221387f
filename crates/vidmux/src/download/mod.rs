//! # Chunked Downloader
//!
//! Fetches one remote resource into a local file. The total length is probed first;
//! large files are split into byte ranges fetched concurrently, each written at its
//! own offset, while small or unsized resources are streamed in a single request.
//! Every request is retried independently under the configured [`RetryPolicy`].

pub mod plan;
pub(crate) mod progress;
pub mod retry;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::DownloadError;
use crate::config::EngineConfig;
use crate::events::{PHASE_DOWNLOADING, ProgressEvent, ProgressScale, ProgressSink};

use plan::{ByteRange, ChunkPlan, parse_content_range_total};
use progress::{ProgressTracker, Throttle};
use retry::{RetryAction, RetryPolicy, retry_with_backoff};

/// One resource to fetch into one file.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub destination: PathBuf,
    /// Skips the length probe when set.
    pub known_length: Option<u64>,
    /// Phase label attached to progress events.
    pub status_prefix: String,
}

impl DownloadTask {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            known_length: None,
            status_prefix: PHASE_DOWNLOADING.to_string(),
        }
    }

    pub fn with_known_length(mut self, length: Option<u64>) -> Self {
        self.known_length = length;
        self
    }

    pub fn with_status_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.status_prefix = prefix.into();
        self
    }
}

/// Tuning shared by every download of an engine.
#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub worker_count: usize,
    pub small_file_threshold: u64,
    pub retry: RetryPolicy,
    pub progress_step: f32,
    pub progress_interval: u64,
}

impl From<&EngineConfig> for DownloadSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            small_file_threshold: config.small_file_threshold,
            retry: config.retry.clone(),
            progress_step: config.progress_step,
            progress_interval: config.progress_interval,
        }
    }
}

/// Range-parallel HTTP downloader.
#[derive(Debug, Clone)]
pub struct ChunkedDownloader {
    client: Client,
    settings: DownloadSettings,
}

impl ChunkedDownloader {
    pub fn new(client: Client, config: &EngineConfig) -> Self {
        Self::with_settings(client, DownloadSettings::from(config))
    }

    pub fn with_settings(client: Client, settings: DownloadSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    /// Run `task` in a spawned task and stream its progress.
    ///
    /// The stream ends after exactly one [`ProgressEvent::Success`] or
    /// [`ProgressEvent::Error`].
    pub fn download(
        &self,
        task: DownloadTask,
        token: CancellationToken,
    ) -> UnboundedReceiverStream<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let downloader = self.clone();
        tokio::spawn(async move {
            let sink = ProgressSink::new(tx.clone(), &task.status_prefix, ProgressScale::FULL);
            let event = match downloader.fetch(&task, sink, &token).await {
                Ok(_) => ProgressEvent::Success {
                    path: task.destination.clone(),
                },
                Err(DownloadError::Cancelled) => ProgressEvent::Error {
                    message: "Download cancelled".to_string(),
                },
                Err(e) => ProgressEvent::Error {
                    message: format!("{} failed: {e}", task.status_prefix),
                },
            };
            let _ = tx.send(event);
        });
        UnboundedReceiverStream::new(rx)
    }

    /// Fetch `task` to its destination, returning the number of bytes written.
    ///
    /// On any failure, cancellation included, the destination file is removed.
    #[instrument(
        skip(self, task, sink, token),
        fields(url = %task.url, dest = %task.destination.display())
    )]
    pub async fn fetch(
        &self,
        task: &DownloadTask,
        sink: ProgressSink,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            result = self.fetch_inner(task, sink, token) => result,
        };

        if let Err(e) = &result {
            warn!(error = %e, "Download failed, removing destination");
            remove_partial(&task.destination).await;
        }
        result
    }

    async fn fetch_inner(
        &self,
        task: &DownloadTask,
        sink: ProgressSink,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        url::Url::parse(&task.url).map_err(|e| {
            DownloadError::configuration(format!("invalid URL `{}`: {e}", task.url))
        })?;

        let total = match task.known_length {
            Some(length) => Some(length),
            None => self.probe_length(&task.url, token).await?,
        };

        match total {
            Some(total) if total > 0 && total >= self.settings.small_file_threshold => {
                info!(
                    total,
                    workers = self.settings.worker_count,
                    "Starting parallel download"
                );
                self.fetch_parallel(task, total, sink, token).await
            }
            _ => {
                info!(total = ?total, "Starting single-pass download");
                self.fetch_single(task, total, sink, token).await
            }
        }
    }

    /// Resolve the total length, `None` when the server does not tell.
    async fn probe_length(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<Option<u64>, DownloadError> {
        let result = retry_with_backoff(&self.settings.retry, token, |_| async move {
            RetryAction::from_result(self.probe_once(url).await)
        })
        .await;

        match result {
            Ok(length) => {
                debug!(length = ?length, "Probed content length");
                Ok(length)
            }
            Err(DownloadError::Cancelled) => Err(DownloadError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Length probe failed, continuing with unknown length");
                Ok(None)
            }
        }
    }

    async fn probe_once(&self, url: &str) -> Result<Option<u64>, DownloadError> {
        let response = self.client.head(url).send().await?;
        if response.status().is_success()
            && let Some(length) = header_u64(&response, CONTENT_LENGTH)
            && length > 0
        {
            return Ok(Some(length));
        }
        debug!(status = %response.status(), "HEAD gave no length, trying a one-byte range");

        let response = self.client.get(url).header(RANGE, "bytes=0-0").send().await?;
        let status = response.status();
        if status == StatusCode::PARTIAL_CONTENT {
            return Ok(response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total));
        }
        if status.is_success() {
            // Range ignored: the full representation is on its way, keep only its length.
            return Ok(header_u64(&response, CONTENT_LENGTH).filter(|length| *length > 0));
        }
        Err(DownloadError::http_status(status, url, "length probe"))
    }

    async fn fetch_single(
        &self,
        task: &DownloadTask,
        total: Option<u64>,
        sink: ProgressSink,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let tracker = ProgressTracker::new(
            total,
            Throttle::Percent(self.settings.progress_step),
            sink,
        );
        tracker.start();

        let written = retry_with_backoff(&self.settings.retry, token, |attempt| {
            let tracker = &tracker;
            async move {
                let mut written = 0u64;
                let result = self.stream_whole(task, total, tracker, &mut written).await;
                if let Err(e) = &result {
                    debug!(attempt, error = %e, "Single-pass attempt failed");
                    tracker.rewind(written);
                }
                RetryAction::from_result(result)
            }
        })
        .await?;

        tracker.finish();
        info!(bytes = written, "Download complete");
        Ok(written)
    }

    async fn stream_whole(
        &self,
        task: &DownloadTask,
        total: Option<u64>,
        tracker: &ProgressTracker,
        written: &mut u64,
    ) -> Result<u64, DownloadError> {
        let response = self.client.get(&task.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(status, &task.url, "download"));
        }

        let mut file = File::create(&task.destination).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            *written += chunk.len() as u64;
            tracker.advance(chunk.len() as u64);
        }
        file.flush().await?;

        if *written == 0 {
            return Err(DownloadError::EmptyBody {
                url: task.url.clone(),
            });
        }
        if let Some(expected) = total
            && *written != expected
        {
            return Err(DownloadError::LengthMismatch {
                expected,
                actual: *written,
            });
        }
        Ok(*written)
    }

    async fn fetch_parallel(
        &self,
        task: &DownloadTask,
        total: u64,
        sink: ProgressSink,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let file = File::create(&task.destination).await?;
        file.set_len(total).await?;
        drop(file);

        let plan = ChunkPlan::new(total, self.settings.worker_count);
        let tracker = Arc::new(ProgressTracker::new(
            Some(total),
            Throttle::Bytes(self.settings.progress_interval),
            sink,
        ));
        tracker.start();

        let mut workers = JoinSet::new();
        for range in plan.ranges().iter().copied() {
            let job = RangeJob {
                client: self.client.clone(),
                url: task.url.clone(),
                path: task.destination.clone(),
                range,
                tracker: Arc::clone(&tracker),
            };
            let policy = self.settings.retry.clone();
            let token = token.child_token();
            workers.spawn(async move { job.run(&policy, &token).await });
        }

        while let Some(joined) = workers.join_next().await {
            let outcome =
                joined.map_err(|e| DownloadError::internal(format!("range worker: {e}")));
            if let Err(e) = outcome.and_then(|r| r) {
                workers.abort_all();
                return Err(e);
            }
        }

        let written = tracker.written();
        if written != total {
            return Err(DownloadError::LengthMismatch {
                expected: total,
                actual: written,
            });
        }
        let on_disk = tokio::fs::metadata(&task.destination).await?.len();
        if on_disk != total {
            return Err(DownloadError::LengthMismatch {
                expected: total,
                actual: on_disk,
            });
        }

        tracker.finish();
        info!(bytes = written, ranges = plan.len(), "Download complete");
        Ok(written)
    }
}

/// One range of a parallel download.
struct RangeJob {
    client: Client,
    url: String,
    path: PathBuf,
    range: ByteRange,
    tracker: Arc<ProgressTracker>,
}

impl RangeJob {
    async fn run(
        &self,
        policy: &RetryPolicy,
        token: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        retry_with_backoff(policy, token, |attempt| async move {
            let mut written = 0u64;
            let result = self.fetch(&mut written).await;
            if let Err(e) = &result {
                warn!(
                    range = %self.range,
                    attempt = attempt + 1,
                    bytes = written,
                    error = %e,
                    "Range fetch failed"
                );
                self.tracker.rewind(written);
            }
            RetryAction::from_result(result)
        })
        .await
    }

    async fn fetch(&self, written: &mut u64) -> Result<u64, DownloadError> {
        let expected = self.range.len();
        let response = self
            .client
            .get(&self.url)
            .header(RANGE, self.range.header_value())
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            // A full body is only usable when this range starts it.
            StatusCode::OK if self.range.start == 0 => {}
            StatusCode::OK => {
                return Err(DownloadError::RangeNotHonoured {
                    url: self.url.clone(),
                    offset: self.range.start,
                });
            }
            status => return Err(DownloadError::http_status(status, &self.url, "range fetch")),
        }

        let mut file = OpenOptions::new().write(true).open(&self.path).await?;
        file.seek(SeekFrom::Start(self.range.start)).await?;

        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            let take = (chunk.len() as u64).min(expected - *written) as usize;
            file.write_all(&chunk[..take]).await?;
            *written += take as u64;
            self.tracker.advance(take as u64);
            if *written == expected {
                break;
            }
        }
        file.flush().await?;

        if *written == 0 {
            return Err(DownloadError::EmptyBody {
                url: self.url.clone(),
            });
        }
        if *written != expected {
            return Err(DownloadError::LengthMismatch {
                expected,
                actual: *written,
            });
        }
        debug!(range = %self.range, bytes = *written, "Range complete");
        Ok(*written)
    }
}

fn header_u64(response: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial file"),
    }
}
