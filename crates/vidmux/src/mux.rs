//! # Muxer
//!
//! Combines the first video track of one file with the first audio track of another
//! into a single container of the same family. Samples are copied byte for byte with
//! their timing; codec configuration travels with the track description.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use media_types::{ContainerFamily, MediaKind, SampleMeta, SampleSink, SampleSource};
use mp4::{Mp4Reader, Mp4Writer, TrackConfig};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use webm::{WebmReader, WebmTrackConfig, WebmWriter};

use crate::error::MuxError;

const DEFAULT_BUFFER_SIZE: usize = 256 * 1024;

/// Inputs and output of one mux run.
#[derive(Debug, Clone)]
pub struct MuxJob {
    pub video_path: PathBuf,
    pub audio_path: PathBuf,
    pub output_path: PathBuf,
    pub output_family: ContainerFamily,
    /// Initial capacity of the reusable sample buffer.
    pub buffer_size: usize,
    pub cancel: CancellationToken,
}

impl MuxJob {
    pub fn new(
        video_path: impl Into<PathBuf>,
        audio_path: impl Into<PathBuf>,
        output_path: impl Into<PathBuf>,
        output_family: ContainerFamily,
    ) -> Self {
        Self {
            video_path: video_path.into(),
            audio_path: audio_path.into(),
            output_path: output_path.into(),
            output_family,
            buffer_size: DEFAULT_BUFFER_SIZE,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Samples copied per track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub video_samples: u64,
    pub audio_samples: u64,
}

/// Run `job` on the blocking pool.
#[instrument(skip(job), fields(output = %job.output_path.display()))]
pub async fn mux(job: MuxJob) -> Result<MuxStats, MuxError> {
    tokio::task::spawn_blocking(move || mux_blocking(&job))
        .await
        .map_err(|e| MuxError::Io(std::io::Error::other(format!("mux task failed: {e}"))))?
}

/// Synchronous mux. The output is removed when anything fails.
pub fn mux_blocking(job: &MuxJob) -> Result<MuxStats, MuxError> {
    let video_family = detect_family(&job.video_path)?;
    let audio_family = detect_family(&job.audio_path)?;
    if audio_family != video_family || job.output_family != video_family {
        return Err(MuxError::ContainerMismatch {
            video: video_family,
            audio: audio_family,
            output: job.output_family,
        });
    }

    let result = match video_family {
        ContainerFamily::Mp4 => mux_mp4(job),
        ContainerFamily::WebM => mux_webm(job),
    };

    match &result {
        Ok(stats) => info!(
            video_samples = stats.video_samples,
            audio_samples = stats.audio_samples,
            family = %video_family,
            "Mux complete"
        ),
        Err(e) => {
            warn!(error = %e, "Mux failed, removing output");
            if let Err(remove) = std::fs::remove_file(&job.output_path)
                && remove.kind() != std::io::ErrorKind::NotFound
            {
                warn!(error = %remove, "Failed to remove partial output");
            }
        }
    }
    result
}

/// Family from the extension, confirmed by the leading bytes.
pub fn detect_family(path: &Path) -> Result<ContainerFamily, MuxError> {
    let mut header = [0u8; 12];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < header.len() {
        let n = file.read(&mut header[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let sniffed = ContainerFamily::sniff(&header[..filled])
        .ok_or_else(|| MuxError::unsupported(path, "unrecognized file signature"))?;
    match ContainerFamily::from_path(path) {
        Some(named) if named != sniffed => Err(MuxError::unsupported(
            path,
            format!("extension says {named} but content is {sniffed}"),
        )),
        _ => Ok(sniffed),
    }
}

fn create_output(path: &Path) -> Result<BufWriter<File>, MuxError> {
    Ok(BufWriter::new(File::create(path)?))
}

fn mux_mp4(job: &MuxJob) -> Result<MuxStats, MuxError> {
    let mut video = Mp4Reader::open_path(&job.video_path)?;
    let video_index = video
        .find_track(MediaKind::Video)
        .ok_or_else(|| track_not_found(MediaKind::Video, &job.video_path))?;
    video.select_track(video_index)?;

    let mut audio = Mp4Reader::open_path(&job.audio_path)?;
    let audio_index = audio
        .find_track(MediaKind::Audio)
        .ok_or_else(|| track_not_found(MediaKind::Audio, &job.audio_path))?;
    audio.select_track(audio_index)?;

    let mut writer = Mp4Writer::new(create_output(&job.output_path)?);
    let (video_config, audio_config) = match (video.selected_track(), audio.selected_track()) {
        (Some(v), Some(a)) => (TrackConfig::from_track(v), TrackConfig::from_track(a)),
        _ => return Err(mp4::Mp4Error::InvalidState("no track selected").into()),
    };
    let video_out = writer.add_track(video_config)?;
    let audio_out = writer.add_track(audio_config)?;
    debug!(
        video_samples = video.selected_track().map(|t| t.sample_count()),
        audio_samples = audio.selected_track().map(|t| t.sample_count()),
        "Copying MP4 tracks"
    );

    // Sample tables are per track, so track order in the file is irrelevant.
    let mut buf = Vec::with_capacity(job.buffer_size);
    let video_samples = copy_track(&mut video, &mut writer, video_out, &mut buf, &job.cancel)?;
    let audio_samples = copy_track(&mut audio, &mut writer, audio_out, &mut buf, &job.cancel)?;

    let mut out = writer.finish()?;
    out.flush()?;
    Ok(MuxStats {
        video_samples,
        audio_samples,
    })
}

fn mux_webm(job: &MuxJob) -> Result<MuxStats, MuxError> {
    let mut video = WebmReader::open_path(&job.video_path)?;
    let video_index = video
        .find_track(MediaKind::Video)
        .ok_or_else(|| track_not_found(MediaKind::Video, &job.video_path))?;
    video.select_track(video_index)?;

    let mut audio = WebmReader::open_path(&job.audio_path)?;
    let audio_index = audio
        .find_track(MediaKind::Audio)
        .ok_or_else(|| track_not_found(MediaKind::Audio, &job.audio_path))?;
    audio.select_track(audio_index)?;

    let mut writer = WebmWriter::new(create_output(&job.output_path)?);
    let video_out = writer.add_track(WebmTrackConfig::new(
        video.tracks()[video_index].clone(),
        video.timescale(),
    ))?;
    let audio_out = writer.add_track(WebmTrackConfig::new(
        audio.tracks()[audio_index].clone(),
        audio.timescale(),
    ))?;

    let stats = interleave(
        (&mut video, video_out),
        (&mut audio, audio_out),
        &mut writer,
        job.buffer_size,
        &job.cancel,
    )?;

    let mut out = writer.finish()?;
    out.flush()?;
    Ok(stats)
}

fn track_not_found(kind: MediaKind, path: &Path) -> MuxError {
    MuxError::TrackNotFound {
        kind,
        path: path.to_path_buf(),
    }
}

/// Copy every remaining sample of `source` into `track` of `sink`.
fn copy_track<S, K>(
    source: &mut S,
    sink: &mut K,
    track: usize,
    buf: &mut Vec<u8>,
    cancel: &CancellationToken,
) -> Result<u64, MuxError>
where
    S: SampleSource,
    K: SampleSink,
    MuxError: From<S::Error> + From<K::Error>,
{
    let mut copied = 0u64;
    while let Some(meta) = source.read_sample(buf)? {
        if cancel.is_cancelled() {
            return Err(MuxError::Cancelled);
        }
        sink.write_sample(track, buf, &meta)?;
        copied += 1;
    }
    Ok(copied)
}

/// One pending sample of an interleaved source.
struct Pending {
    buf: Vec<u8>,
    meta: Option<SampleMeta>,
}

impl Pending {
    fn fill<S: SampleSource>(&mut self, source: &mut S) -> Result<(), S::Error> {
        self.meta = source.read_sample(&mut self.buf)?;
        Ok(())
    }
}

/// Compare presentation times expressed in different timescales.
fn cmp_presentation(a: &SampleMeta, a_scale: u32, b: &SampleMeta, b_scale: u32) -> Ordering {
    let a = i128::from(a.presentation_time()) * i128::from(b_scale);
    let b = i128::from(b.presentation_time()) * i128::from(a_scale);
    a.cmp(&b)
}

/// Copy both tracks in presentation order; ties go to the video track.
fn interleave<S, K>(
    (video, video_out): (&mut S, usize),
    (audio, audio_out): (&mut S, usize),
    sink: &mut K,
    buffer_size: usize,
    cancel: &CancellationToken,
) -> Result<MuxStats, MuxError>
where
    S: SampleSource,
    K: SampleSink,
    MuxError: From<S::Error> + From<K::Error>,
{
    let (video_scale, audio_scale) = (video.timescale(), audio.timescale());
    let mut next_video = Pending {
        buf: Vec::with_capacity(buffer_size),
        meta: None,
    };
    let mut next_audio = Pending {
        buf: Vec::with_capacity(buffer_size / 4),
        meta: None,
    };
    next_video.fill(video)?;
    next_audio.fill(audio)?;

    let mut stats = MuxStats::default();
    loop {
        if cancel.is_cancelled() {
            return Err(MuxError::Cancelled);
        }
        let take_video = match (&next_video.meta, &next_audio.meta) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(v), Some(a)) => {
                cmp_presentation(v, video_scale, a, audio_scale) != Ordering::Greater
            }
        };

        if take_video {
            if let Some(meta) = next_video.meta {
                sink.write_sample(video_out, &next_video.buf, &meta)?;
                stats.video_samples += 1;
            }
            next_video.fill(video)?;
        } else {
            if let Some(meta) = next_audio.meta {
                sink.write_sample(audio_out, &next_audio.buf, &meta)?;
                stats.audio_samples += 1;
            }
            next_audio.fill(audio)?;
        }
    }
    Ok(stats)
}
