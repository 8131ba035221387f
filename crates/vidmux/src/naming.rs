use std::path::Path;

use media_types::ContainerFamily;
use uuid::Uuid;

use crate::catalog::StreamDescriptor;

const TEMP_PREFIX: &str = "temp_";
const MAX_TITLE_CHARS: usize = 150;

/// Make a page title usable as a file name on every major platform.
pub fn sanitize_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .take(MAX_TITLE_CHARS)
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.').trim();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Extension of the file a stream is saved to.
pub fn extension_for(stream: &StreamDescriptor) -> String {
    match stream.family {
        Some(family) if stream.is_audio_only() => family.audio_extension().to_string(),
        Some(family) => family.video_extension().to_string(),
        None => stream.container.to_ascii_lowercase(),
    }
}

/// `{title}_{quality}.{ext}` for video, `{title}.{ext}` for audio.
pub fn final_file_name(title: &str, stream: &StreamDescriptor) -> String {
    let title = sanitize_title(title);
    let ext = extension_for(stream);
    if stream.is_audio_only() {
        format!("{title}.{ext}")
    } else {
        format!("{title}_{}.{ext}", stream.label)
    }
}

/// `temp_{uuid}.{ext}`. Never collides with a final name.
pub fn temp_file_name(ext: &str) -> String {
    format!("{TEMP_PREFIX}{}.{ext}", Uuid::new_v4())
}

/// Temporary file name for one track of `family`.
pub fn temp_track_name(family: ContainerFamily, audio: bool) -> String {
    if audio {
        temp_file_name(family.audio_extension())
    } else {
        temp_file_name(family.video_extension())
    }
}

/// Whether `path` names an engine temporary file, so listings can skip it.
pub fn is_temp_file(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.strip_prefix(TEMP_PREFIX))
        .is_some_and(|id| Uuid::parse_str(id).is_ok())
}
