#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use vidmux_engine::{
    DownloadError, EngineConfig, ProgressEvent, RawStream, RetryPolicy, StreamListing,
    StreamSource,
};
use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Engine config for tests: fast retries, small parallel threshold.
pub fn test_config(dir: &std::path::Path) -> EngineConfig {
    EngineConfig::new(dir)
        .with_worker_count(4)
        .with_small_file_threshold(1024)
        .with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
}

/// Serves a fixed body honouring `Range: bytes=a-b` like a CDN would.
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    ignore_range: bool,
    hide_total: bool,
    fail_at: Option<u64>,
    failures: AtomicUsize,
    delay: Option<Duration>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            ignore_range: false,
            hide_total: false,
            fail_at: None,
            failures: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Answer every request with the full body and status 200.
    pub fn ignoring_ranges(mut self) -> Self {
        self.ignore_range = true;
        self
    }

    /// Report `*` as the total of every `Content-Range`.
    pub fn hiding_total(mut self) -> Self {
        self.hide_total = true;
        self
    }

    /// Fail the first `count` requests for the range starting at `offset` with a 503.
    /// `None` fails any request.
    pub fn failing(mut self, offset: Option<u64>, count: usize) -> Self {
        self.fail_at = offset;
        self.failures = AtomicUsize::new(count);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn requested_range(request: &Request) -> Option<(u64, Option<u64>)> {
        let value = request.headers.get("range")?.to_str().ok()?;
        let spec = value.strip_prefix("bytes=")?;
        let (start, end) = spec.split_once('-')?;
        Some((start.parse().ok()?, end.parse().ok()))
    }

    fn should_fail(&self, start: u64) -> bool {
        if self.fail_at.is_some_and(|offset| offset != start) {
            return false;
        }
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let len = self.body.len() as u64;
        let range = Self::requested_range(request);

        let template = if self.should_fail(range.map(|(start, _)| start).unwrap_or(0)) {
            ResponseTemplate::new(503)
        } else {
            match range {
                Some((start, end)) if !self.ignore_range && start < len => {
                    let end = end.unwrap_or(len - 1).min(len - 1);
                    let total = if self.hide_total {
                        "*".to_string()
                    } else {
                        len.to_string()
                    };
                    ResponseTemplate::new(206)
                        .insert_header("content-range", format!("bytes {start}-{end}/{total}"))
                        .set_body_bytes(self.body[start as usize..=end as usize].to_vec())
                }
                Some(_) if !self.ignore_range => ResponseTemplate::new(416),
                _ => ResponseTemplate::new(200).set_body_bytes(self.body.as_slice().to_vec()),
            }
        };

        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

/// Range headers of the GET requests a server received, `None` for plain GETs.
pub async fn get_ranges(server: &wiremock::MockServer) -> Vec<Option<String>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "GET")
        .map(|r| {
            r.headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .collect()
}

/// Drain a progress stream, returning the progress percentages and the terminal event.
pub async fn drain<S>(mut events: S) -> (Vec<f32>, Vec<String>, Option<ProgressEvent>)
where
    S: futures::Stream<Item = ProgressEvent> + Unpin,
{
    let mut percents = Vec::new();
    let mut messages = Vec::new();
    let mut terminal = None;
    while let Some(event) = events.next().await {
        match event {
            ProgressEvent::Progress { percent, message } => {
                assert!(terminal.is_none(), "progress after terminal event");
                percents.push(percent);
                messages.push(message);
            }
            other => {
                assert!(terminal.is_none(), "more than one terminal event");
                terminal = Some(other);
            }
        }
    }
    (percents, messages, terminal)
}

pub fn assert_monotonic(percents: &[f32]) {
    for pair in percents.windows(2) {
        assert!(pair[0] <= pair[1], "progress went backwards: {percents:?}");
    }
}

/// A source returning a fixed listing and counting its calls.
pub struct StaticSource {
    listing: StreamListing,
    calls: AtomicUsize,
}

impl StaticSource {
    pub fn new(listing: StreamListing) -> Arc<Self> {
        Arc::new(Self {
            listing,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSource for StaticSource {
    async fn fetch_streams(&self, _url: &str) -> Result<StreamListing, DownloadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.listing.clone())
    }
}

/// A source whose metadata fetch never completes.
pub struct PendingSource;

#[async_trait]
impl StreamSource for PendingSource {
    async fn fetch_streams(&self, _url: &str) -> Result<StreamListing, DownloadError> {
        futures::future::pending().await
    }
}

pub fn raw_video(id: &str, container: &str, height: u32, url: String) -> RawStream {
    RawStream {
        id: id.into(),
        container: container.into(),
        height: Some(height),
        fps: Some(30.0),
        bitrate_kbps: Some(2500.0),
        filesize: None,
        has_video: true,
        has_audio: false,
        url,
    }
}

pub fn raw_audio(id: &str, container: &str, kbps: f64, url: String) -> RawStream {
    RawStream {
        id: id.into(),
        container: container.into(),
        height: None,
        fps: None,
        bitrate_kbps: Some(kbps),
        filesize: None,
        has_video: false,
        has_audio: true,
        url,
    }
}
