use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};
use vidmux_engine::{DownloadError, StreamListing, StreamSource};

/// Lists formats by running `yt-dlp -J <url>`.
#[derive(Debug, Clone)]
pub struct YtDlpSource {
    program: PathBuf,
}

impl YtDlpSource {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl StreamSource for YtDlpSource {
    #[instrument(skip(self), fields(program = %self.program.display()))]
    async fn fetch_streams(&self, url: &str) -> Result<StreamListing, DownloadError> {
        let output = Command::new(&self.program)
            .args(["-J", "--no-warnings", "--no-playlist", url])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                DownloadError::source_failure(format!(
                    "failed to run {}: {e}",
                    self.program.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DownloadError::source_failure(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }

        debug!(bytes = output.stdout.len(), "Received metadata");
        let json = String::from_utf8_lossy(&output.stdout);
        StreamListing::from_ytdlp_json(&json)
    }
}

/// Lists formats from a saved `yt-dlp -J` document. Re-read on every call.
#[derive(Debug, Clone)]
pub struct MetadataFileSource {
    path: PathBuf,
}

impl MetadataFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StreamSource for MetadataFileSource {
    async fn fetch_streams(&self, _url: &str) -> Result<StreamListing, DownloadError> {
        let json = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            DownloadError::source_failure(format!("cannot read {}: {e}", self.path.display()))
        })?;
        StreamListing::from_ytdlp_json(&json)
    }
}
