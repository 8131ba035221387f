use bytes::Bytes;
use media_types::MediaKind;
use tracing::trace;

use crate::ebml::{
    children, ids, parse_float, parse_string, parse_uint, write_binary, write_float, write_master,
    write_string, write_uint,
};
use crate::error::WebmError;

pub const TRACK_TYPE_VIDEO: u64 = 1;
pub const TRACK_TYPE_AUDIO: u64 = 2;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoSettings {
    pub pixel_width: u64,
    pub pixel_height: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioSettings {
    pub sampling_frequency: f64,
    pub channels: u64,
    pub bit_depth: Option<u64>,
}

/// A `TrackEntry`, restricted to the fields carried over when remuxing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebmTrack {
    pub number: u64,
    pub uid: u64,
    pub track_type: u64,
    pub codec_id: String,
    pub codec_private: Option<Bytes>,
    pub language: Option<String>,
    /// Nanoseconds per frame.
    pub default_duration: Option<u64>,
    pub codec_delay: Option<u64>,
    pub seek_pre_roll: Option<u64>,
    pub video: Option<VideoSettings>,
    pub audio: Option<AudioSettings>,
}

impl WebmTrack {
    pub fn mime(&self) -> String {
        let mime = match self.codec_id.as_str() {
            "V_VP8" => "video/x-vnd.on2.vp8",
            "V_VP9" => "video/x-vnd.on2.vp9",
            "V_AV1" => "video/av01",
            "V_MPEG4/ISO/AVC" => "video/avc",
            "V_MPEGH/ISO/HEVC" => "video/hevc",
            "A_OPUS" => "audio/opus",
            "A_VORBIS" => "audio/vorbis",
            "A_AAC" => "audio/mp4a-latm",
            "A_FLAC" => "audio/flac",
            _ => match self.track_type {
                TRACK_TYPE_VIDEO => "video/unknown",
                TRACK_TYPE_AUDIO => "audio/unknown",
                _ => "application/octet-stream",
            },
        };
        mime.to_string()
    }

    pub fn kind(&self) -> Option<MediaKind> {
        match self.track_type {
            TRACK_TYPE_VIDEO => Some(MediaKind::Video),
            TRACK_TYPE_AUDIO => Some(MediaKind::Audio),
            _ => None,
        }
    }

    pub(crate) fn parse(body: &[u8]) -> Result<Self, WebmError> {
        let mut track = WebmTrack::default();
        for child in children(body) {
            let (id, data) = child?;
            match id {
                ids::TRACK_NUMBER => track.number = parse_uint(data),
                ids::TRACK_UID => track.uid = parse_uint(data),
                ids::TRACK_TYPE => track.track_type = parse_uint(data),
                ids::CODEC_ID => track.codec_id = parse_string(data),
                ids::CODEC_PRIVATE => track.codec_private = Some(Bytes::copy_from_slice(data)),
                ids::LANGUAGE => track.language = Some(parse_string(data)),
                ids::DEFAULT_DURATION => track.default_duration = Some(parse_uint(data)),
                ids::CODEC_DELAY => track.codec_delay = Some(parse_uint(data)),
                ids::SEEK_PRE_ROLL => track.seek_pre_roll = Some(parse_uint(data)),
                ids::VIDEO => {
                    let mut video = VideoSettings::default();
                    for child in children(data) {
                        match child? {
                            (ids::PIXEL_WIDTH, v) => video.pixel_width = parse_uint(v),
                            (ids::PIXEL_HEIGHT, v) => video.pixel_height = parse_uint(v),
                            _ => {}
                        }
                    }
                    track.video = Some(video);
                }
                ids::AUDIO => {
                    let mut audio = AudioSettings {
                        sampling_frequency: 8000.0,
                        channels: 1,
                        bit_depth: None,
                    };
                    for child in children(data) {
                        match child? {
                            (ids::SAMPLING_FREQUENCY, v) => {
                                audio.sampling_frequency = parse_float(ids::SAMPLING_FREQUENCY, v)?
                            }
                            (ids::CHANNELS, v) => audio.channels = parse_uint(v),
                            (ids::BIT_DEPTH, v) => audio.bit_depth = Some(parse_uint(v)),
                            _ => {}
                        }
                    }
                    track.audio = Some(audio);
                }
                other => trace!(id = other, "skipping track element"),
            }
        }

        if track.number == 0 {
            return Err(WebmError::MissingElement("TrackNumber"));
        }
        if track.codec_id.is_empty() {
            return Err(WebmError::MissingElement("CodecID"));
        }
        Ok(track)
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        write_master(out, ids::TRACK_ENTRY, |out| {
            write_uint(out, ids::TRACK_NUMBER, self.number);
            write_uint(out, ids::TRACK_UID, self.uid.max(1));
            write_uint(out, ids::TRACK_TYPE, self.track_type);
            write_uint(out, ids::FLAG_LACING, 0);
            if let Some(language) = &self.language {
                write_string(out, ids::LANGUAGE, language);
            }
            write_string(out, ids::CODEC_ID, &self.codec_id);
            if let Some(private) = &self.codec_private {
                write_binary(out, ids::CODEC_PRIVATE, private);
            }
            if let Some(duration) = self.default_duration {
                write_uint(out, ids::DEFAULT_DURATION, duration);
            }
            if let Some(delay) = self.codec_delay {
                write_uint(out, ids::CODEC_DELAY, delay);
            }
            if let Some(pre_roll) = self.seek_pre_roll {
                write_uint(out, ids::SEEK_PRE_ROLL, pre_roll);
            }
            if let Some(video) = &self.video {
                write_master(out, ids::VIDEO, |out| {
                    write_uint(out, ids::PIXEL_WIDTH, video.pixel_width);
                    write_uint(out, ids::PIXEL_HEIGHT, video.pixel_height);
                });
            }
            if let Some(audio) = &self.audio {
                write_master(out, ids::AUDIO, |out| {
                    write_float(out, ids::SAMPLING_FREQUENCY, audio.sampling_frequency);
                    write_uint(out, ids::CHANNELS, audio.channels);
                    if let Some(depth) = audio.bit_depth {
                        write_uint(out, ids::BIT_DEPTH, depth);
                    }
                });
            }
        });
    }
}
