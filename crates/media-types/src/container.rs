/// Elementary stream family carried by a stream or a container track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// MIME prefix shared by every track of this kind.
    pub fn mime_prefix(&self) -> &'static str {
        match self {
            Self::Video => "video/",
            Self::Audio => "audio/",
        }
    }

    /// Whether a track MIME type (e.g. `video/avc`) belongs to this kind.
    pub fn matches_mime(&self, mime: &str) -> bool {
        mime.starts_with(self.mime_prefix())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container family. Samples can only be remuxed between files of the same family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ContainerFamily {
    /// ISO base media file format (`mp4`, `m4a`, `m4v`, `mov`).
    Mp4,
    /// Matroska WebM profile (`webm`, `weba`, `mkv`).
    WebM,
}

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Top-level ISOBMFF boxes that may open a file.
const ISOBMFF_LEADING_BOXES: &[[u8; 4]] = &[
    *b"ftyp", *b"styp", *b"moov", *b"mdat", *b"free", *b"skip", *b"sidx", *b"wide",
];

impl ContainerFamily {
    /// Resolve a family from a file extension or an extractor container name.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" | "m4a" | "m4v" | "mov" | "3gp" | "mp4a" => Some(Self::Mp4),
            "webm" | "weba" | "mkv" | "mka" => Some(Self::WebM),
            _ => None,
        }
    }

    /// Resolve a family from the extension of a path.
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    /// Identify a family from the first bytes of a file.
    pub fn sniff(header: &[u8]) -> Option<Self> {
        if header.len() >= 4 && header[..4] == EBML_MAGIC {
            return Some(Self::WebM);
        }
        if header.len() >= 8 {
            let fourcc: [u8; 4] = [header[4], header[5], header[6], header[7]];
            if ISOBMFF_LEADING_BOXES.contains(&fourcc) {
                return Some(Self::Mp4);
            }
        }
        None
    }

    /// Extension used for files holding video (or combined) streams.
    pub fn video_extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::WebM => "webm",
        }
    }

    /// Extension used for audio-only files.
    pub fn audio_extension(&self) -> &'static str {
        match self {
            Self::Mp4 => "m4a",
            Self::WebM => "webm",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::WebM => "webm",
        }
    }
}

impl std::fmt::Display for ContainerFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
