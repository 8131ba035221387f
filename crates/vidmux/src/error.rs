use std::io::ErrorKind;
use std::path::PathBuf;

use media_types::{ContainerFamily, MediaKind};
use reqwest::StatusCode;

use crate::download::retry::is_retryable_reqwest_error;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("server ignored the range request at offset {offset} for {url}")]
    RangeNotHonoured { url: String, offset: u64 },

    #[error("server returned an empty body for {url}")]
    EmptyBody { url: String },

    #[error("expected {expected} bytes, received {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("format `{id}` is no longer offered; the format list may have expired")]
    StreamNotFound { id: String },

    #[error("stream metadata unavailable: {reason}")]
    Source { reason: String },

    #[error("muxing failed: {source}")]
    Mux {
        #[from]
        source: MuxError,
    },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl DownloadError {
    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn source_failure(reason: impl Into<String>) -> Self {
        Self::Source {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::EmptyBody { .. }
            | Self::StreamNotFound { .. }
            | Self::Source { .. }
            | Self::Mux { .. }
            | Self::ProxyConfiguration { .. }
            | Self::Configuration { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::Network { source } => is_retryable_reqwest_error(source),
            // Disk and permission errors are final.
            Self::Io { source } => matches!(
                source.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::TimedOut
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
            ),
            Self::RangeNotHonoured { .. } | Self::LengthMismatch { .. } | Self::Internal { .. } => {
                true
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("no {kind} track in {}", path.display())]
    TrackNotFound { kind: MediaKind, path: PathBuf },

    #[error(
        "container mismatch: video is {video}, audio is {audio}, output requested as {output}"
    )]
    ContainerMismatch {
        video: ContainerFamily,
        audio: ContainerFamily,
        output: ContainerFamily,
    },

    #[error("unsupported container for {}: {reason}", path.display())]
    UnsupportedContainer { path: PathBuf, reason: String },

    #[error("MP4 error: {0}")]
    Mp4(#[from] mp4::Mp4Error),

    #[error("WebM error: {0}")]
    WebM(#[from] webm::WebmError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("muxing cancelled")]
    Cancelled,
}

impl MuxError {
    pub fn unsupported(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::UnsupportedContainer {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
