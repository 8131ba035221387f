//! Stream selection: turns the raw format list of a page into sorted, labelled
//! video and audio choices.

use std::cmp::Ordering;

use humansize::{DECIMAL, format_size};
use media_types::{ContainerFamily, MediaKind};
use serde::{Deserialize, Serialize};

/// One format as reported by the metadata source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawStream {
    pub id: String,
    /// Container name or extension (`mp4`, `m4a`, `webm`, ...).
    pub container: String,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
    /// Exact size in bytes, when the source knows it.
    pub filesize: Option<u64>,
    pub has_video: bool,
    pub has_audio: bool,
    pub url: String,
}

/// A selectable stream. Only valid for the metadata fetch that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDescriptor {
    pub id: String,
    pub container: String,
    pub family: Option<ContainerFamily>,
    pub media_kind: MediaKind,
    /// `1080p`, `720p60`, `128kbps`
    pub label: String,
    /// Exact size reported by the source.
    pub filesize: Option<u64>,
    /// Exact size, or an estimate from bitrate and duration.
    pub approximate_size: Option<u64>,
    /// Human readable size, `Unknown` when neither is available.
    pub size_label: String,
    pub url: String,
    /// Video and audio in one stream.
    pub combined: bool,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub bitrate_kbps: Option<f64>,
}

impl StreamDescriptor {
    fn from_raw(raw: &RawStream, duration_secs: Option<f64>) -> Self {
        let media_kind = if raw.has_video {
            MediaKind::Video
        } else {
            MediaKind::Audio
        };
        let approximate_size = approximate_size(raw, duration_secs);
        Self {
            id: raw.id.clone(),
            container: raw.container.clone(),
            family: ContainerFamily::from_extension(&raw.container),
            media_kind,
            label: quality_label(raw, media_kind),
            filesize: raw.filesize.filter(|size| *size > 0),
            approximate_size,
            size_label: approximate_size
                .map(|size| format_size(size, DECIMAL))
                .unwrap_or_else(|| "Unknown".to_string()),
            url: raw.url.clone(),
            combined: raw.has_video && raw.has_audio,
            height: raw.height,
            fps: raw.fps,
            bitrate_kbps: raw.bitrate_kbps,
        }
    }

    pub fn is_audio_only(&self) -> bool {
        self.media_kind == MediaKind::Audio
    }
}

fn quality_label(raw: &RawStream, kind: MediaKind) -> String {
    match kind {
        MediaKind::Video => match raw.height {
            Some(height) => match raw.fps {
                Some(fps) if fps > 30.0 => format!("{height}p{}", fps.round() as u32),
                _ => format!("{height}p"),
            },
            None => raw.id.clone(),
        },
        MediaKind::Audio => match raw.bitrate_kbps {
            Some(kbps) if kbps > 0.0 => format!("{}kbps", kbps.round() as u64),
            _ => raw.id.clone(),
        },
    }
}

/// Authoritative size, else `kbps * 1000 * seconds / 8`.
fn approximate_size(raw: &RawStream, duration_secs: Option<f64>) -> Option<u64> {
    if let Some(size) = raw.filesize.filter(|size| *size > 0) {
        return Some(size);
    }
    match (raw.bitrate_kbps, duration_secs) {
        (Some(kbps), Some(duration)) if kbps > 0.0 && duration > 0.0 => {
            Some((kbps * 1000.0 * duration / 8.0) as u64)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogOptions {
    /// Family kept in the video and audio lists.
    pub preferred_family: ContainerFamily,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            preferred_family: ContainerFamily::Mp4,
        }
    }
}

/// Video and audio choices for one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    /// Streams carrying video in the preferred family, best first.
    pub video: Vec<StreamDescriptor>,
    /// Audio-only streams in the preferred family, best first.
    pub audio: Vec<StreamDescriptor>,
    all: Vec<StreamDescriptor>,
}

impl Catalog {
    /// Look up any stream of the listing by id, whatever its family.
    pub fn find(&self, id: &str) -> Option<&StreamDescriptor> {
        self.all.iter().find(|stream| stream.id == id)
    }

    /// Highest bitrate audio-only stream of `family`, across the whole listing.
    pub fn best_audio_for(&self, family: ContainerFamily) -> Option<&StreamDescriptor> {
        self.all
            .iter()
            .filter(|s| s.is_audio_only() && s.family == Some(family))
            .max_by(|a, b| cmp_option_f64(a.bitrate_kbps, b.bitrate_kbps))
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }
}

fn cmp_option_f64(a: Option<f64>, b: Option<f64>) -> Ordering {
    a.unwrap_or(0.0).total_cmp(&b.unwrap_or(0.0))
}

/// Build the catalog of a listing. Pure; absent data yields empty lists.
pub fn build_catalog(
    raw: &[RawStream],
    duration_secs: Option<f64>,
    options: &CatalogOptions,
) -> Catalog {
    let all: Vec<StreamDescriptor> = raw
        .iter()
        .filter(|r| r.has_video || r.has_audio)
        .map(|r| StreamDescriptor::from_raw(r, duration_secs))
        .collect();

    let preferred = |s: &&StreamDescriptor| s.family == Some(options.preferred_family);

    let mut video: Vec<StreamDescriptor> = all
        .iter()
        .filter(preferred)
        .filter(|s| s.media_kind == MediaKind::Video)
        .cloned()
        .collect();
    video.sort_by(|a, b| {
        b.height
            .unwrap_or(0)
            .cmp(&a.height.unwrap_or(0))
            .then_with(|| cmp_option_f64(b.fps, a.fps))
    });

    let mut audio: Vec<StreamDescriptor> = all
        .iter()
        .filter(preferred)
        .filter(|s| s.is_audio_only())
        .cloned()
        .collect();
    audio.sort_by(|a, b| cmp_option_f64(b.bitrate_kbps, a.bitrate_kbps));

    Catalog { video, audio, all }
}
