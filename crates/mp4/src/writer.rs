use std::io::{Seek, SeekFrom, Write};

use bytes::Bytes;
use media_types::{SampleMeta, SampleSink, rescale};
use tracing::{debug, warn};

use crate::box_utils::{write_box, write_full_box};
use crate::error::Mp4Error;
use crate::isobmff::Mp4Track;

/// A new chunk is started once the current one reaches this many bytes.
const MAX_CHUNK_BYTES: u64 = 1024 * 1024;

const UNITY_MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// Description of an output track, usually taken from an input track.
#[derive(Debug, Clone)]
pub struct TrackConfig {
    pub handler: [u8; 4],
    pub timescale: u32,
    pub language: u16,
    pub width: u32,
    pub height: u32,
    pub volume: u16,
    /// Complete sample entry box (`avc1`, `mp4a`, ...), copied verbatim into `stsd`.
    pub sample_entry: Bytes,
}

impl TrackConfig {
    pub fn from_track(track: &Mp4Track) -> Self {
        Self {
            handler: track.handler,
            timescale: track.timescale,
            language: track.language,
            width: track.width,
            height: track.height,
            volume: track.volume,
            sample_entry: track.sample_entry.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct WrittenSample {
    offset: u64,
    size: u32,
    decode_time: i64,
    composition_offset: i32,
    duration: u32,
    is_sync: bool,
}

struct WriterTrack {
    config: TrackConfig,
    samples: Vec<WrittenSample>,
}

/// Progressive MP4 writer: `ftyp`, one `mdat`, and `moov` at the end.
///
/// Tracks are registered with [`Mp4Writer::add_track`] before the first sample; samples
/// may then arrive in any track order and are laid out in arrival order.
pub struct Mp4Writer<W: Write + Seek> {
    inner: W,
    tracks: Vec<WriterTrack>,
    mdat_start: Option<u64>,
    position: u64,
}

impl<W: Write + Seek> Mp4Writer<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            tracks: Vec::new(),
            mdat_start: None,
            position: 0,
        }
    }

    /// Register an output track and return its index.
    pub fn add_track(&mut self, config: TrackConfig) -> Result<usize, Mp4Error> {
        if self.mdat_start.is_some() {
            return Err(Mp4Error::InvalidState("tracks must be added before samples"));
        }
        if config.timescale == 0 {
            return Err(Mp4Error::InvalidState("track timescale must be non-zero"));
        }
        if config.sample_entry.len() < 8 {
            return Err(Mp4Error::InvalidState("sample entry is not a box"));
        }
        self.tracks.push(WriterTrack {
            config,
            samples: Vec::new(),
        });
        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> Result<(), Mp4Error> {
        if self.tracks.is_empty() {
            return Err(Mp4Error::InvalidState("no tracks registered"));
        }

        let mut head = Vec::with_capacity(48);
        write_box(&mut head, b"ftyp", |out| {
            out.extend_from_slice(b"isom");
            out.extend_from_slice(&0x200u32.to_be_bytes());
            for brand in [b"isom", b"iso2", b"avc1", b"mp41"] {
                out.extend_from_slice(brand);
            }
        });
        let mdat_start = head.len() as u64;
        // 64-bit size; patched by `finish`.
        head.extend_from_slice(&1u32.to_be_bytes());
        head.extend_from_slice(b"mdat");
        head.extend_from_slice(&0u64.to_be_bytes());

        self.inner.write_all(&head)?;
        self.position = head.len() as u64;
        self.mdat_start = Some(mdat_start);
        Ok(())
    }

    /// Write the `moov` box and return the underlying writer.
    pub fn finish(mut self) -> Result<W, Mp4Error> {
        if self.mdat_start.is_none() {
            self.start()?;
        }
        let mdat_start = self.mdat_start.unwrap_or_default();

        let mdat_size = self.position - mdat_start;
        self.inner.seek(SeekFrom::Start(mdat_start + 8))?;
        self.inner.write_all(&mdat_size.to_be_bytes())?;
        self.inner.seek(SeekFrom::Start(self.position))?;

        let moov = self.build_moov();
        self.inner.write_all(&moov)?;
        self.inner.flush()?;

        debug!(
            tracks = self.tracks.len(),
            mdat_size,
            moov_size = moov.len(),
            "mp4 finished"
        );
        Ok(self.inner)
    }

    fn movie_timescale(&self) -> u32 {
        self.tracks
            .first()
            .map(|t| t.config.timescale)
            .unwrap_or(1000)
    }

    fn build_moov(&self) -> Vec<u8> {
        let movie_timescale = self.movie_timescale();
        let layouts: Vec<TrackLayout> = self
            .tracks
            .iter()
            .map(|track| TrackLayout::new(track, movie_timescale))
            .collect();
        let movie_duration = layouts
            .iter()
            .map(|l| l.presentation_duration)
            .max()
            .unwrap_or(0);

        let mut out = Vec::new();
        write_box(&mut out, b"moov", |out| {
            write_mvhd(out, movie_timescale, movie_duration, self.tracks.len() as u32 + 1);
            for (index, (track, layout)) in self.tracks.iter().zip(&layouts).enumerate() {
                write_trak(out, index as u32 + 1, track, layout);
            }
        });
        out
    }
}

impl<W: Write + Seek> SampleSink for Mp4Writer<W> {
    type Error = Mp4Error;

    fn write_sample(
        &mut self,
        track: usize,
        data: &[u8],
        meta: &SampleMeta,
    ) -> Result<(), Mp4Error> {
        if track >= self.tracks.len() {
            return Err(Mp4Error::NoSuchTrack(track));
        }
        if self.mdat_start.is_none() {
            self.start()?;
        }

        self.inner.write_all(data)?;
        self.tracks[track].samples.push(WrittenSample {
            offset: self.position,
            size: data.len() as u32,
            decode_time: meta.decode_time,
            composition_offset: meta.composition_offset,
            duration: meta.duration,
            is_sync: meta.is_sync,
        });
        self.position += data.len() as u64;
        Ok(())
    }
}

/// Derived tables for one track, computed once at finish time.
struct TrackLayout {
    deltas: Vec<u32>,
    media_duration: u64,
    /// Empty edit length in movie timescale.
    leading_gap: u64,
    /// `media_time` of the media edit.
    media_start: i64,
    presentation_duration: u64,
}

impl TrackLayout {
    fn new(track: &WriterTrack, movie_timescale: u32) -> Self {
        let samples = &track.samples;
        let timescale = track.config.timescale;

        // Deltas come from decode time differences so decode times survive exactly.
        let mut deltas = Vec::with_capacity(samples.len());
        for pair in samples.windows(2) {
            let delta = pair[1].decode_time - pair[0].decode_time;
            if delta < 0 {
                warn!(
                    decode_time = pair[1].decode_time,
                    previous = pair[0].decode_time,
                    "decode time went backwards, clamping"
                );
            }
            deltas.push(delta.clamp(0, i64::from(u32::MAX)) as u32);
        }
        if let Some(last) = samples.last() {
            let fallback = deltas.last().copied().unwrap_or(0);
            deltas.push(if last.duration > 0 {
                last.duration
            } else {
                fallback
            });
        }

        let media_duration: u64 = deltas.iter().map(|d| u64::from(*d)).sum();
        let first_decode_time = samples.first().map(|s| s.decode_time).unwrap_or(0);
        let (leading_gap, media_start) = if first_decode_time > 0 {
            (rescale(first_decode_time, timescale, movie_timescale) as u64, 0)
        } else {
            (0, -first_decode_time)
        };
        // The media edit skips `media_start` ticks of media.
        let presented = (media_duration as i64).saturating_sub(media_start).max(0);
        let presentation_duration =
            leading_gap + rescale(presented, timescale, movie_timescale) as u64;

        Self {
            deltas,
            media_duration,
            leading_gap,
            media_start,
            presentation_duration,
        }
    }
}

fn push_u32s(out: &mut Vec<u8>, values: &[u32]) {
    for value in values {
        out.extend_from_slice(&value.to_be_bytes());
    }
}

fn write_mvhd(out: &mut Vec<u8>, timescale: u32, duration: u64, next_track_id: u32) {
    let long = duration > u64::from(u32::MAX);
    write_full_box(out, b"mvhd", u8::from(long), 0, |out| {
        if long {
            out.extend_from_slice(&[0u8; 16]);
            out.extend_from_slice(&timescale.to_be_bytes());
            out.extend_from_slice(&duration.to_be_bytes());
        } else {
            out.extend_from_slice(&[0u8; 8]);
            out.extend_from_slice(&timescale.to_be_bytes());
            out.extend_from_slice(&(duration as u32).to_be_bytes());
        }
        out.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate
        out.extend_from_slice(&0x0100u16.to_be_bytes()); // volume
        out.extend_from_slice(&[0u8; 10]);
        push_u32s(out, &UNITY_MATRIX);
        out.extend_from_slice(&[0u8; 24]);
        out.extend_from_slice(&next_track_id.to_be_bytes());
    });
}

fn write_trak(out: &mut Vec<u8>, track_id: u32, track: &WriterTrack, layout: &TrackLayout) {
    let config = &track.config;
    write_box(out, b"trak", |out| {
        let duration = layout.presentation_duration;
        let long = duration > u64::from(u32::MAX);
        // enabled | in_movie
        write_full_box(out, b"tkhd", u8::from(long), 0x000003, |out| {
            if long {
                out.extend_from_slice(&[0u8; 16]);
                out.extend_from_slice(&track_id.to_be_bytes());
                out.extend_from_slice(&[0u8; 4]);
                out.extend_from_slice(&duration.to_be_bytes());
            } else {
                out.extend_from_slice(&[0u8; 8]);
                out.extend_from_slice(&track_id.to_be_bytes());
                out.extend_from_slice(&[0u8; 4]);
                out.extend_from_slice(&(duration as u32).to_be_bytes());
            }
            out.extend_from_slice(&[0u8; 8]);
            out.extend_from_slice(&0u16.to_be_bytes()); // layer
            out.extend_from_slice(&0u16.to_be_bytes()); // alternate group
            out.extend_from_slice(&config.volume.to_be_bytes());
            out.extend_from_slice(&[0u8; 2]);
            push_u32s(out, &UNITY_MATRIX);
            out.extend_from_slice(&config.width.to_be_bytes());
            out.extend_from_slice(&config.height.to_be_bytes());
        });

        if layout.leading_gap > 0 || layout.media_start > 0 {
            write_edts(out, layout);
        }

        write_box(out, b"mdia", |out| {
            write_mdhd(out, config, layout.media_duration);
            write_hdlr(out, &config.handler);
            write_box(out, b"minf", |out| {
                write_media_header(out, &config.handler);
                write_box(out, b"dinf", |out| {
                    write_full_box(out, b"dref", 0, 0, |out| {
                        out.extend_from_slice(&1u32.to_be_bytes());
                        // self-contained
                        write_full_box(out, b"url ", 0, 0x000001, |_| {});
                    });
                });
                write_stbl(out, track, layout);
            });
        });
    });
}

fn write_edts(out: &mut Vec<u8>, layout: &TrackLayout) {
    let media_segment = layout.presentation_duration - layout.leading_gap;
    write_box(out, b"edts", |out| {
        write_full_box(out, b"elst", 1, 0, |out| {
            let entries: u32 = if layout.leading_gap > 0 { 2 } else { 1 };
            out.extend_from_slice(&entries.to_be_bytes());
            if layout.leading_gap > 0 {
                out.extend_from_slice(&layout.leading_gap.to_be_bytes());
                out.extend_from_slice(&(-1i64).to_be_bytes());
                out.extend_from_slice(&0x0001_0000u32.to_be_bytes());
            }
            out.extend_from_slice(&media_segment.to_be_bytes());
            out.extend_from_slice(&layout.media_start.to_be_bytes());
            out.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        });
    });
}

fn write_mdhd(out: &mut Vec<u8>, config: &TrackConfig, duration: u64) {
    let long = duration > u64::from(u32::MAX);
    write_full_box(out, b"mdhd", u8::from(long), 0, |out| {
        if long {
            out.extend_from_slice(&[0u8; 16]);
            out.extend_from_slice(&config.timescale.to_be_bytes());
            out.extend_from_slice(&duration.to_be_bytes());
        } else {
            out.extend_from_slice(&[0u8; 8]);
            out.extend_from_slice(&config.timescale.to_be_bytes());
            out.extend_from_slice(&(duration as u32).to_be_bytes());
        }
        out.extend_from_slice(&config.language.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
    });
}

fn write_hdlr(out: &mut Vec<u8>, handler: &[u8; 4]) {
    let name: &[u8] = match handler {
        b"vide" => b"VideoHandler\0",
        b"soun" => b"SoundHandler\0",
        _ => b"\0",
    };
    write_full_box(out, b"hdlr", 0, 0, |out| {
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(handler);
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(name);
    });
}

fn write_media_header(out: &mut Vec<u8>, handler: &[u8; 4]) {
    match handler {
        b"vide" => write_full_box(out, b"vmhd", 0, 0x000001, |out| {
            out.extend_from_slice(&[0u8; 8]);
        }),
        b"soun" => write_full_box(out, b"smhd", 0, 0, |out| {
            out.extend_from_slice(&[0u8; 4]);
        }),
        _ => write_full_box(out, b"nmhd", 0, 0, |_| {}),
    }
}

fn write_stbl(out: &mut Vec<u8>, track: &WriterTrack, layout: &TrackLayout) {
    let samples = &track.samples;
    write_box(out, b"stbl", |out| {
        write_full_box(out, b"stsd", 0, 0, |out| {
            out.extend_from_slice(&1u32.to_be_bytes());
            out.extend_from_slice(&track.config.sample_entry);
        });

        let stts = run_lengths(layout.deltas.iter().copied());
        write_full_box(out, b"stts", 0, 0, |out| {
            out.extend_from_slice(&(stts.len() as u32).to_be_bytes());
            for (count, delta) in &stts {
                push_u32s(out, &[*count, *delta]);
            }
        });

        if samples.iter().any(|s| s.composition_offset != 0) {
            let negative = samples.iter().any(|s| s.composition_offset < 0);
            let ctts = run_lengths(samples.iter().map(|s| s.composition_offset));
            write_full_box(out, b"ctts", u8::from(negative), 0, |out| {
                out.extend_from_slice(&(ctts.len() as u32).to_be_bytes());
                for (count, offset) in &ctts {
                    push_u32s(out, &[*count, *offset as u32]);
                }
            });
        }

        if !samples.iter().all(|s| s.is_sync) {
            let sync: Vec<u32> = samples
                .iter()
                .enumerate()
                .filter(|(_, s)| s.is_sync)
                .map(|(i, _)| i as u32 + 1)
                .collect();
            write_full_box(out, b"stss", 0, 0, |out| {
                out.extend_from_slice(&(sync.len() as u32).to_be_bytes());
                push_u32s(out, &sync);
            });
        }

        write_full_box(out, b"stsz", 0, 0, |out| {
            let uniform = samples
                .first()
                .filter(|first| samples.iter().all(|s| s.size == first.size))
                .map(|first| first.size);
            match uniform {
                Some(size) => {
                    push_u32s(out, &[size, samples.len() as u32]);
                }
                None => {
                    push_u32s(out, &[0, samples.len() as u32]);
                    for sample in samples {
                        out.extend_from_slice(&sample.size.to_be_bytes());
                    }
                }
            }
        });

        let chunks = chunk_layout(samples);
        let stsc = run_lengths_indexed(chunks.iter().map(|(_, count)| *count));
        write_full_box(out, b"stsc", 0, 0, |out| {
            out.extend_from_slice(&(stsc.len() as u32).to_be_bytes());
            for (first_chunk, per_chunk) in &stsc {
                push_u32s(out, &[*first_chunk, *per_chunk, 1]);
            }
        });

        if chunks.iter().all(|(offset, _)| *offset <= u64::from(u32::MAX)) {
            write_full_box(out, b"stco", 0, 0, |out| {
                out.extend_from_slice(&(chunks.len() as u32).to_be_bytes());
                for (offset, _) in &chunks {
                    out.extend_from_slice(&(*offset as u32).to_be_bytes());
                }
            });
        } else {
            write_full_box(out, b"co64", 0, 0, |out| {
                out.extend_from_slice(&(chunks.len() as u32).to_be_bytes());
                for (offset, _) in &chunks {
                    out.extend_from_slice(&offset.to_be_bytes());
                }
            });
        }
    });
}

/// Group samples into chunks of contiguous bytes: `(chunk_offset, sample_count)`.
fn chunk_layout(samples: &[WrittenSample]) -> Vec<(u64, u32)> {
    let mut chunks: Vec<(u64, u32)> = Vec::new();
    let mut chunk_end = 0u64;
    let mut chunk_bytes = 0u64;
    for sample in samples {
        let size = u64::from(sample.size);
        match chunks.last_mut() {
            Some((_, count))
                if sample.offset == chunk_end && chunk_bytes + size <= MAX_CHUNK_BYTES =>
            {
                *count += 1;
                chunk_bytes += size;
            }
            _ => {
                chunks.push((sample.offset, 1));
                chunk_bytes = size;
            }
        }
        chunk_end = sample.offset + size;
    }
    chunks
}

fn run_lengths<T: PartialEq + Copy>(values: impl Iterator<Item = T>) -> Vec<(u32, T)> {
    let mut runs: Vec<(u32, T)> = Vec::new();
    for value in values {
        match runs.last_mut() {
            Some((count, last)) if *last == value => *count += 1,
            _ => runs.push((1, value)),
        }
    }
    runs
}

/// `stsc` style runs: `(first_index, value)` with 1-based indices, emitted on change.
fn run_lengths_indexed(values: impl Iterator<Item = u32>) -> Vec<(u32, u32)> {
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for (index, value) in values.enumerate() {
        if runs.last().is_none_or(|(_, last)| *last != value) {
            runs.push((index as u32 + 1, value));
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::reader::Mp4Reader;
    use crate::test_support::{make_audio_sample_entry, make_visual_sample_entry};
    use media_types::{MediaKind, SampleSource};

    fn video_config() -> TrackConfig {
        TrackConfig {
            handler: *b"vide",
            timescale: 90_000,
            language: 0x55C4,
            width: 320 << 16,
            height: 240 << 16,
            volume: 0,
            sample_entry: Bytes::from(make_visual_sample_entry(b"avc1", &[])),
        }
    }

    fn audio_config() -> TrackConfig {
        TrackConfig {
            handler: *b"soun",
            timescale: 48_000,
            language: 0x55C4,
            width: 0,
            height: 0,
            volume: 0x0100,
            sample_entry: Bytes::from(make_audio_sample_entry(b"mp4a", &[])),
        }
    }

    fn meta(decode_time: i64, duration: u32, is_sync: bool) -> SampleMeta {
        SampleMeta {
            decode_time,
            composition_offset: 0,
            duration,
            is_sync,
        }
    }

    fn read_all<R: std::io::Read + std::io::Seek>(
        reader: &mut Mp4Reader<R>,
        index: usize,
    ) -> Vec<(Vec<u8>, SampleMeta)> {
        reader.select_track(index).unwrap();
        let mut out = Vec::new();
        let mut buf = Vec::new();
        while let Some(meta) = reader.read_sample(&mut buf).unwrap() {
            out.push((buf.clone(), meta));
        }
        out
    }

    #[test]
    fn test_round_trip_two_tracks() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()));
        let video = writer.add_track(video_config()).unwrap();
        let audio = writer.add_track(audio_config()).unwrap();

        let video_samples = [
            (vec![1u8; 10], SampleMeta { composition_offset: 3000, ..meta(0, 3000, true) }),
            (vec![2u8; 20], SampleMeta { composition_offset: -3000, ..meta(3000, 3000, false) }),
            (vec![3u8; 30], meta(6000, 3000, true)),
        ];
        for (data, m) in &video_samples {
            writer.write_sample(video, data, m).unwrap();
        }
        for i in 0..4 {
            writer
                .write_sample(audio, &[9u8; 5], &meta(i * 1024, 1024, true))
                .unwrap();
        }

        let file = writer.finish().unwrap().into_inner();
        let mut reader = Mp4Reader::open(Cursor::new(file)).unwrap();
        assert_eq!(reader.tracks().len(), 2);
        assert_eq!(reader.find_track(MediaKind::Video), Some(0));
        assert_eq!(reader.find_track(MediaKind::Audio), Some(1));

        let read_video = read_all(&mut reader, 0);
        assert_eq!(reader.timescale(), 90_000);
        assert_eq!(read_video.len(), 3);
        for ((data, m), (expected_data, expected)) in read_video.iter().zip(&video_samples) {
            assert_eq!(data, expected_data);
            assert_eq!(m, expected);
        }

        let read_audio = read_all(&mut reader, 1);
        assert_eq!(reader.timescale(), 48_000);
        assert_eq!(read_audio.len(), 4);
        assert_eq!(read_audio[3].1.decode_time, 3 * 1024);
        assert!(read_audio.iter().all(|(data, m)| data == &[9u8; 5] && m.is_sync));
    }

    #[test]
    fn test_leading_gap_is_preserved() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()));
        let video = writer.add_track(video_config()).unwrap();
        let audio = writer.add_track(audio_config()).unwrap();
        writer.write_sample(video, &[0], &meta(0, 3000, true)).unwrap();
        writer.write_sample(audio, &[0], &meta(1024, 1024, true)).unwrap();
        writer.write_sample(audio, &[0], &meta(2048, 1024, true)).unwrap();

        let file = writer.finish().unwrap().into_inner();
        let mut reader = Mp4Reader::open(Cursor::new(file)).unwrap();
        let read_audio = read_all(&mut reader, 1);
        assert_eq!(read_audio[0].1.decode_time, 1024);
        assert_eq!(read_audio[1].1.decode_time, 2048);
    }

    #[test]
    fn test_negative_start_survives_through_media_edit() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()));
        let video = writer.add_track(video_config()).unwrap();
        let written: Vec<SampleMeta> = (0..6)
            .map(|i| SampleMeta {
                composition_offset: if i % 2 == 0 { 6000 } else { 0 },
                ..meta(i * 3000 - 6000, 3000, i == 0)
            })
            .collect();
        for m in &written {
            writer.write_sample(video, &[1, 2, 3], m).unwrap();
        }

        let file = writer.finish().unwrap().into_inner();
        let mut reader = Mp4Reader::open(Cursor::new(file)).unwrap();
        let read: Vec<SampleMeta> = read_all(&mut reader, 0).into_iter().map(|(_, m)| m).collect();
        assert_eq!(read, written);
        assert_eq!(read[0].decode_time, -6000);
        assert_eq!(read[0].presentation_time(), 0);
    }

    #[test]
    fn test_add_track_after_samples_is_rejected() {
        let mut writer = Mp4Writer::new(Cursor::new(Vec::new()));
        let video = writer.add_track(video_config()).unwrap();
        writer.write_sample(video, &[0], &meta(0, 1, true)).unwrap();
        assert!(matches!(
            writer.add_track(audio_config()),
            Err(Mp4Error::InvalidState(_))
        ));
        assert!(matches!(
            writer.write_sample(5, &[0], &meta(0, 1, true)),
            Err(Mp4Error::NoSuchTrack(5))
        ));
    }

    #[test]
    fn test_chunk_layout_splits_on_gaps() {
        let sample = |offset, size| WrittenSample {
            offset,
            size,
            decode_time: 0,
            composition_offset: 0,
            duration: 0,
            is_sync: true,
        };
        let chunks = chunk_layout(&[sample(100, 10), sample(110, 10), sample(500, 5), sample(505, 5)]);
        assert_eq!(chunks, vec![(100, 2), (500, 2)]);
        assert_eq!(run_lengths_indexed([2u32, 2, 3, 3, 1].into_iter()), vec![(1, 2), (3, 3), (5, 1)]);
    }
}
