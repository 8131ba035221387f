//! Shared WebM test builders.
//!
//! Available for local webm tests and for downstream crate tests when the
//! `test-utils` feature is enabled.

use std::io::Cursor;

use bytes::Bytes;
use media_types::{SampleMeta, SampleSink};

use crate::track::{AudioSettings, TRACK_TYPE_AUDIO, TRACK_TYPE_VIDEO, VideoSettings, WebmTrack};
use crate::writer::{WebmTrackConfig, WebmWriter};

/// A synthetic elementary stream with millisecond timestamps.
#[derive(Debug, Clone)]
pub struct SyntheticStream {
    pub track: WebmTrack,
    pub count: usize,
    pub interval_ms: i64,
    pub size: usize,
    /// Every `sync_every`-th sample is a key frame, starting with the first.
    pub sync_every: usize,
    pub fill: u8,
    /// Timestamp of the first block.
    pub start_ms: i64,
}

impl SyntheticStream {
    pub fn vp9(count: usize) -> Self {
        Self {
            track: WebmTrack {
                track_type: TRACK_TYPE_VIDEO,
                codec_id: "V_VP9".into(),
                video: Some(VideoSettings {
                    pixel_width: 320,
                    pixel_height: 240,
                }),
                ..Default::default()
            },
            count,
            interval_ms: 40,
            size: 48,
            sync_every: 5,
            fill: 0xBB,
            start_ms: 0,
        }
    }

    pub fn opus(count: usize) -> Self {
        Self {
            track: WebmTrack {
                track_type: TRACK_TYPE_AUDIO,
                codec_id: "A_OPUS".into(),
                codec_private: Some(Bytes::from_static(b"OpusHead\x01\x02")),
                codec_delay: Some(6_500_000),
                seek_pre_roll: Some(80_000_000),
                audio: Some(AudioSettings {
                    sampling_frequency: 48_000.0,
                    channels: 2,
                    bit_depth: None,
                }),
                ..Default::default()
            },
            count,
            interval_ms: 20,
            size: 12,
            sync_every: 1,
            fill: 0x33,
            start_ms: 0,
        }
    }

    pub fn starting_at(mut self, start_ms: i64) -> Self {
        self.start_ms = start_ms;
        self
    }

    pub fn sample(&self, index: usize) -> (Vec<u8>, SampleMeta) {
        let mut data = vec![self.fill; self.size];
        data[0] = index as u8;
        let meta = SampleMeta {
            decode_time: self.start_ms + index as i64 * self.interval_ms,
            composition_offset: 0,
            duration: self.interval_ms as u32,
            is_sync: index % self.sync_every.max(1) == 0,
        };
        (data, meta)
    }
}

/// Build a WebM file holding the given streams, interleaved by timestamp.
pub fn build_webm(streams: &[SyntheticStream]) -> Vec<u8> {
    let mut writer = WebmWriter::new(Cursor::new(Vec::new()));
    let indices: Vec<usize> = streams
        .iter()
        .map(|s| {
            writer
                .add_track(WebmTrackConfig::new(s.track.clone(), 1000))
                .expect("add track")
        })
        .collect();

    let mut samples: Vec<(usize, Vec<u8>, SampleMeta)> = streams
        .iter()
        .zip(&indices)
        .flat_map(|(stream, index)| {
            (0..stream.count).map(move |i| {
                let (data, meta) = stream.sample(i);
                (*index, data, meta)
            })
        })
        .collect();
    samples.sort_by_key(|(index, _, meta)| (meta.decode_time, *index));

    for (index, data, meta) in &samples {
        writer.write_sample(*index, data, meta).expect("write sample");
    }
    writer.finish().expect("finish").into_inner()
}
