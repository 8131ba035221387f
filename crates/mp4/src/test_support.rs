//! Shared MP4 test builders.
//!
//! This module is available for local mp4 tests and optionally for downstream
//! crate tests when the `test-utils` feature is enabled.

use std::io::Cursor;

use bytes::Bytes;
use media_types::{SampleMeta, SampleSink};

use crate::writer::{Mp4Writer, TrackConfig};

/// Bytes to skip in a visual sample entry body before child boxes begin.
const VISUAL_SAMPLE_ENTRY_HEADER: usize = 70;

/// Bytes to skip in an audio sample entry body before child boxes begin.
const AUDIO_SAMPLE_ENTRY_HEADER: usize = 20;

pub fn make_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
    let size = (8 + body.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(fourcc);
    out.extend_from_slice(body);
    out
}

pub fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(payload);
    make_box(fourcc, &body)
}

pub fn make_visual_sample_entry(fourcc: &[u8; 4], children: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; VISUAL_SAMPLE_ENTRY_HEADER];
    body.extend_from_slice(children);
    make_box(fourcc, &body)
}

pub fn make_audio_sample_entry(fourcc: &[u8; 4], children: &[u8]) -> Vec<u8> {
    let mut body = vec![0u8; AUDIO_SAMPLE_ENTRY_HEADER];
    body.extend_from_slice(children);
    make_box(fourcc, &body)
}

/// A synthetic elementary stream: `count` samples of `size` bytes, one every `duration` ticks.
#[derive(Debug, Clone, Copy)]
pub struct SyntheticTrack {
    pub codec: [u8; 4],
    pub timescale: u32,
    pub count: usize,
    pub size: usize,
    pub duration: u32,
    /// Every `sync_every`-th sample is a sync sample, starting with the first.
    pub sync_every: usize,
    /// Payload byte used to fill every sample.
    pub fill: u8,
    /// Decode time of the first sample.
    pub start: i64,
    /// Decode order `I P B P B ...`, each `P` shown after the `B` that follows it.
    pub reordered: bool,
}

impl SyntheticTrack {
    pub fn video(count: usize) -> Self {
        Self {
            codec: *b"avc1",
            timescale: 90_000,
            count,
            size: 64,
            duration: 3000,
            sync_every: 5,
            fill: 0xAA,
            start: 0,
            reordered: false,
        }
    }

    pub fn audio(count: usize) -> Self {
        Self {
            codec: *b"mp4a",
            timescale: 48_000,
            count,
            size: 16,
            duration: 1024,
            sync_every: 1,
            fill: 0x55,
            start: 0,
            reordered: false,
        }
    }

    pub fn starting_at(mut self, start: i64) -> Self {
        self.start = start;
        self
    }

    /// Reorder frames the way an encoder with B-frames does. Combined with
    /// `starting_at(-duration)` the first frame is presented at zero.
    pub fn with_b_frames(mut self) -> Self {
        self.reordered = true;
        self
    }

    fn composition_offset(&self, index: usize) -> i32 {
        if !self.reordered {
            return 0;
        }
        let duration = self.duration as i32;
        match index {
            0 => duration,
            i if i % 2 == 1 => 2 * duration,
            _ => 0,
        }
    }

    fn is_video(&self) -> bool {
        !matches!(&self.codec, b"mp4a" | b"Opus" | b"ac-3" | b"ec-3" | b"fLaC")
    }

    pub fn config(&self) -> TrackConfig {
        if self.is_video() {
            TrackConfig {
                handler: *b"vide",
                timescale: self.timescale,
                language: 0x55C4,
                width: 320 << 16,
                height: 240 << 16,
                volume: 0,
                sample_entry: Bytes::from(make_visual_sample_entry(&self.codec, &[])),
            }
        } else {
            TrackConfig {
                handler: *b"soun",
                timescale: self.timescale,
                language: 0x55C4,
                width: 0,
                height: 0,
                volume: 0x0100,
                sample_entry: Bytes::from(make_audio_sample_entry(&self.codec, &[])),
            }
        }
    }

    pub fn sample(&self, index: usize) -> (Vec<u8>, SampleMeta) {
        let mut data = vec![self.fill; self.size];
        data[0] = index as u8;
        let meta = SampleMeta {
            decode_time: self.start + index as i64 * i64::from(self.duration),
            composition_offset: self.composition_offset(index),
            duration: self.duration,
            is_sync: index % self.sync_every.max(1) == 0,
        };
        (data, meta)
    }
}

/// Build a progressive MP4 file holding the given tracks, each written track after track.
pub fn build_progressive_mp4(tracks: &[SyntheticTrack]) -> Vec<u8> {
    let mut writer = Mp4Writer::new(Cursor::new(Vec::new()));
    let indices: Vec<usize> = tracks
        .iter()
        .map(|t| writer.add_track(t.config()).expect("add track"))
        .collect();
    for (track, index) in tracks.iter().zip(indices) {
        for i in 0..track.count {
            let (data, meta) = track.sample(i);
            writer.write_sample(index, &data, &meta).expect("write sample");
        }
    }
    writer.finish().expect("finish").into_inner()
}

/// Build a fragmented MP4 file with one track and one fragment per entry of `fragments`,
/// where each fragment lists the number of samples it carries.
pub fn build_fragmented_mp4(track: &SyntheticTrack, fragments: &[usize]) -> Vec<u8> {
    let track_id = 1u32;
    let config = track.config();

    let mut out = make_box(b"ftyp", b"iso6\0\0\0\0iso6mp41");

    let mut mvhd = vec![0u8; 96];
    mvhd[8..12].copy_from_slice(&1000u32.to_be_bytes());
    let mut moov = make_full_box(b"mvhd", 0, 0, &mvhd);

    let mut tkhd = vec![0u8; 80];
    tkhd[8..12].copy_from_slice(&track_id.to_be_bytes());
    tkhd[72..76].copy_from_slice(&config.width.to_be_bytes());
    tkhd[76..80].copy_from_slice(&config.height.to_be_bytes());
    let mut mdhd = vec![0u8; 20];
    mdhd[8..12].copy_from_slice(&track.timescale.to_be_bytes());
    let mut hdlr = vec![0u8; 21];
    hdlr[4..8].copy_from_slice(&config.handler);

    let mut stsd = 1u32.to_be_bytes().to_vec();
    stsd.extend_from_slice(&config.sample_entry);
    let mut stbl = make_full_box(b"stsd", 0, 0, &stsd);
    stbl.extend(make_full_box(b"stts", 0, 0, &[0; 4]));
    stbl.extend(make_full_box(b"stsc", 0, 0, &[0; 4]));
    stbl.extend(make_full_box(b"stsz", 0, 0, &[0; 8]));
    stbl.extend(make_full_box(b"stco", 0, 0, &[0; 4]));

    let mut mdia = make_full_box(b"mdhd", 0, 0, &mdhd);
    mdia.extend(make_full_box(b"hdlr", 0, 0, &hdlr));
    mdia.extend(make_box(b"minf", &make_box(b"stbl", &stbl)));
    let mut trak = make_full_box(b"tkhd", 0, 3, &tkhd);
    if let Some(edts) = edit_list(track.start, track.timescale, 1000) {
        trak.extend(edts);
    }
    trak.extend(make_box(b"mdia", &mdia));
    moov.extend(make_box(b"trak", &trak));

    let mut trex = track_id.to_be_bytes().to_vec();
    trex.extend_from_slice(&1u32.to_be_bytes());
    trex.extend_from_slice(&track.duration.to_be_bytes());
    trex.extend_from_slice(&(track.size as u32).to_be_bytes());
    trex.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    moov.extend(make_box(b"mvex", &make_full_box(b"trex", 0, 0, &trex)));
    out.extend(make_box(b"moov", &moov));

    let mut next = 0usize;
    for &count in fragments {
        let samples: Vec<(Vec<u8>, SampleMeta)> =
            (next..next + count).map(|i| track.sample(i)).collect();
        // Media time restarts at zero; the edit list carries `start`.
        let base_decode_time = samples
            .first()
            .map(|(_, m)| m.decode_time - track.start)
            .unwrap_or(0) as u64;
        next += count;
        let reordered = samples.iter().any(|(_, m)| m.composition_offset != 0);

        // default-base-is-moof
        let tfhd = make_full_box(b"tfhd", 0, 0x020000, &track_id.to_be_bytes());
        let tfdt = make_full_box(b"tfdt", 1, 0, &base_decode_time.to_be_bytes());
        let mut trun = (samples.len() as u32).to_be_bytes().to_vec();
        trun.extend_from_slice(&0i32.to_be_bytes());
        for (data, meta) in &samples {
            trun.extend_from_slice(&(data.len() as u32).to_be_bytes());
            let flags: u32 = if meta.is_sync { 0 } else { 0x0001_0000 };
            trun.extend_from_slice(&flags.to_be_bytes());
            if reordered {
                trun.extend_from_slice(&meta.composition_offset.to_be_bytes());
            }
        }
        // data_offset | sample_size | sample_flags, plus composition offsets when reordered
        let trun_flags = 0x000001 | 0x000200 | 0x000400 | (if reordered { 0x000800 } else { 0 });
        let mut trun = make_full_box(b"trun", u8::from(reordered), trun_flags, &trun);

        let mfhd = make_full_box(b"mfhd", 0, 0, &1u32.to_be_bytes());
        let moof_len = 8 + mfhd.len() + 8 + tfhd.len() + tfdt.len() + trun.len();
        let data_offset = (moof_len + 8) as i32;
        trun[16..20].copy_from_slice(&data_offset.to_be_bytes());

        let mut traf = tfhd;
        traf.extend(tfdt);
        traf.extend(trun);
        let mut moof = mfhd;
        moof.extend(make_box(b"traf", &traf));
        out.extend(make_box(b"moof", &moof));

        let payload: Vec<u8> = samples.iter().flat_map(|(d, _)| d.clone()).collect();
        out.extend(make_box(b"mdat", &payload));
    }

    out
}

/// `edts` for a track whose first decode time is `start`: an empty edit for a
/// positive start, a media edit skipping `-start` ticks for a negative one.
fn edit_list(start: i64, timescale: u32, movie_timescale: u32) -> Option<Vec<u8>> {
    let (gap, media_time) = match start {
        0 => return None,
        s if s > 0 => (media_types::rescale(s, timescale, movie_timescale), 0),
        s => (0, -s),
    };
    let mut entries = Vec::new();
    let mut push = |duration: i64, media_time: i64| {
        entries.extend_from_slice(&(duration as u64).to_be_bytes());
        entries.extend_from_slice(&media_time.to_be_bytes());
        entries.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    };
    if gap > 0 {
        push(gap, -1);
    }
    push(0, media_time);
    let count: u32 = if gap > 0 { 2 } else { 1 };
    let mut elst = count.to_be_bytes().to_vec();
    elst.extend(entries);
    Some(make_box(b"edts", &make_full_box(b"elst", 1, 0, &elst)))
}
