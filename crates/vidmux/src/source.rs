//! Stream metadata collaborators.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::DownloadError;
use crate::catalog::RawStream;

/// Everything a metadata fetch reports about one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamListing {
    pub title: String,
    pub duration_secs: Option<f64>,
    pub streams: Vec<RawStream>,
}

/// Resolves a page URL to its current stream listing.
///
/// Stream URLs typically expire, so the orchestrator calls this again right before
/// each download.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn fetch_streams(&self, url: &str) -> Result<StreamListing, DownloadError>;
}

/// The subset of a yt-dlp `--dump-single-json` document the engine consumes.
#[derive(Debug, Deserialize)]
struct InfoJson {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<FormatJson>,
}

#[derive(Debug, Deserialize)]
struct FormatJson {
    format_id: String,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    fps: Option<f64>,
    #[serde(default)]
    tbr: Option<f64>,
    #[serde(default)]
    abr: Option<f64>,
    #[serde(default)]
    vbr: Option<f64>,
    #[serde(default)]
    filesize: Option<u64>,
    #[serde(default)]
    vcodec: Option<String>,
    #[serde(default)]
    acodec: Option<String>,
}

impl FormatJson {
    /// Only plain HTTP(S) resources can be fetched with byte ranges.
    fn is_direct(&self) -> bool {
        matches!(self.protocol.as_deref(), None | Some("http") | Some("https"))
    }

    fn into_raw(self) -> Option<RawStream> {
        if !self.is_direct() {
            return None;
        }
        let url = self.url?;
        let ext = self.ext?;
        let has_video = match self.vcodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            None => self.height.is_some(),
        };
        let has_audio = match self.acodec.as_deref() {
            Some("none") => false,
            Some(_) => true,
            None => self.vcodec.is_none(),
        };
        let bitrate_kbps = if has_video {
            self.tbr.or(self.vbr)
        } else {
            self.abr.or(self.tbr)
        };
        Some(RawStream {
            id: self.format_id,
            container: ext,
            height: self.height,
            fps: self.fps,
            bitrate_kbps,
            filesize: self.filesize,
            has_video,
            has_audio,
            url,
        })
    }
}

impl StreamListing {
    /// Parse the JSON document printed by `yt-dlp -J <url>`.
    pub fn from_ytdlp_json(json: &str) -> Result<Self, DownloadError> {
        let info: InfoJson = serde_json::from_str(json)
            .map_err(|e| DownloadError::source_failure(format!("invalid metadata JSON: {e}")))?;
        let total = info.formats.len();
        let streams: Vec<RawStream> = info
            .formats
            .into_iter()
            .filter_map(FormatJson::into_raw)
            .collect();
        debug!(
            formats = total,
            direct = streams.len(),
            "Parsed stream listing"
        );
        Ok(Self {
            title: info.title.unwrap_or_default(),
            duration_secs: info.duration,
            streams,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "title": "Sample Clip",
        "duration": 120.0,
        "formats": [
            {"format_id": "sb0", "ext": "mhtml", "protocol": "mhtml", "url": "https://i/sb", "vcodec": "none", "acodec": "none"},
            {"format_id": "140", "ext": "m4a", "protocol": "https", "url": "https://cdn/140",
             "vcodec": "none", "acodec": "mp4a.40.2", "abr": 129.5, "tbr": 130.1, "filesize": 1940000},
            {"format_id": "137", "ext": "mp4", "protocol": "https", "url": "https://cdn/137",
             "vcodec": "avc1.640028", "acodec": "none", "height": 1080, "fps": 30, "tbr": 4400.0},
            {"format_id": "18", "ext": "mp4", "protocol": "https", "url": "https://cdn/18",
             "vcodec": "avc1.42001E", "acodec": "mp4a.40.2", "height": 360, "fps": 25},
            {"format_id": "hls-1080", "ext": "mp4", "protocol": "m3u8_native", "url": "https://cdn/m3u8",
             "vcodec": "avc1", "acodec": "mp4a", "height": 1080}
        ]
    }"#;

    #[test]
    fn test_parse_ytdlp_listing() {
        let listing = StreamListing::from_ytdlp_json(SAMPLE).unwrap();
        assert_eq!(listing.title, "Sample Clip");
        assert_eq!(listing.duration_secs, Some(120.0));

        let ids: Vec<&str> = listing.streams.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["140", "137", "18"]);

        let audio = &listing.streams[0];
        assert!(!audio.has_video && audio.has_audio);
        assert_eq!(audio.bitrate_kbps, Some(129.5));
        assert_eq!(audio.filesize, Some(1_940_000));

        let video = &listing.streams[1];
        assert!(video.has_video && !video.has_audio);
        assert_eq!(video.height, Some(1080));
        assert_eq!(video.bitrate_kbps, Some(4400.0));

        assert!(listing.streams[2].has_video && listing.streams[2].has_audio);
    }

    #[test]
    fn test_invalid_json_is_a_source_error() {
        assert!(matches!(
            StreamListing::from_ytdlp_json("{not json"),
            Err(DownloadError::Source { .. })
        ));
    }
}
