use std::io::{Seek, SeekFrom, Write};

use media_types::{SampleMeta, SampleSink, rescale};
use tracing::debug;

use crate::ebml::{
    ids, size_field_8, write_binary, write_float, write_id, write_master, write_size, write_string,
    write_uint, write_uint_fixed, write_void,
};
use crate::error::WebmError;
use crate::track::{TRACK_TYPE_VIDEO, WebmTrack};

/// Output timecode scale: one tick per millisecond.
const TIMECODE_SCALE: u64 = 1_000_000;
const TICKS_PER_SECOND: u32 = 1_000;

/// Bytes reserved after the segment header for the `SeekHead` written by `finish`.
const SEEK_HEAD_RESERVED: usize = 96;

const MUXING_APP: &str = "vidmux";

/// Description of an output track.
#[derive(Debug, Clone)]
pub struct WebmTrackConfig {
    pub track: WebmTrack,
    /// Ticks per second of the timestamps passed to [`SampleSink::write_sample`].
    pub timescale: u32,
}

impl WebmTrackConfig {
    pub fn new(track: WebmTrack, timescale: u32) -> Self {
        Self { track, timescale }
    }
}

/// Absolute positions of the elements patched by `finish`.
struct Layout {
    segment_size_at: u64,
    segment_data_start: u64,
    info_at: u64,
    tracks_at: u64,
    duration_at: u64,
}

struct OpenCluster {
    start: u64,
    timecode: i64,
    blocks: usize,
}

struct CuePoint {
    time: i64,
    track: u64,
    cluster_position: u64,
}

/// WebM writer emitting one `SimpleBlock` per sample.
///
/// Samples must arrive in non-decreasing presentation order across tracks: clusters are
/// written sequentially and are never revisited except to patch their size.
pub struct WebmWriter<W: Write + Seek> {
    inner: W,
    tracks: Vec<WebmTrackConfig>,
    layout: Option<Layout>,
    position: u64,
    cluster: Option<OpenCluster>,
    cues: Vec<CuePoint>,
    end_time: i64,
}

impl<W: Write + Seek> WebmWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            tracks: Vec::new(),
            layout: None,
            position: 0,
            cluster: None,
            cues: Vec::new(),
            end_time: 0,
        }
    }

    /// Register an output track and return its index. Track numbers are reassigned.
    pub fn add_track(&mut self, mut config: WebmTrackConfig) -> Result<usize, WebmError> {
        if self.layout.is_some() {
            return Err(WebmError::InvalidState("tracks must be added before samples"));
        }
        if config.timescale == 0 {
            return Err(WebmError::InvalidState("track timescale must be non-zero"));
        }
        let number = self.tracks.len() as u64 + 1;
        config.track.number = number;
        if config.track.uid == 0 {
            config.track.uid = number;
        }
        self.tracks.push(config);
        Ok(self.tracks.len() - 1)
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<(), WebmError> {
        self.inner.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    fn has_video(&self) -> bool {
        self.tracks
            .iter()
            .any(|t| t.track.track_type == TRACK_TYPE_VIDEO)
    }

    fn start(&mut self) -> Result<(), WebmError> {
        if self.tracks.is_empty() {
            return Err(WebmError::InvalidState("no tracks registered"));
        }

        let mut head = Vec::new();
        write_master(&mut head, ids::EBML, |out| {
            write_uint(out, ids::EBML_VERSION, 1);
            write_uint(out, ids::EBML_READ_VERSION, 1);
            write_uint(out, ids::EBML_MAX_ID_LENGTH, 4);
            write_uint(out, ids::EBML_MAX_SIZE_LENGTH, 8);
            write_string(out, ids::DOC_TYPE, "webm");
            write_uint(out, ids::DOC_TYPE_VERSION, 4);
            write_uint(out, ids::DOC_TYPE_READ_VERSION, 2);
        });
        write_id(&mut head, ids::SEGMENT);
        let segment_size_at = head.len() as u64;
        head.extend_from_slice(&size_field_8(0));
        let segment_data_start = head.len() as u64;
        write_void(&mut head, SEEK_HEAD_RESERVED);

        let info_at = head.len() as u64;
        let mut info = Vec::new();
        write_uint(&mut info, ids::TIMECODE_SCALE, TIMECODE_SCALE);
        write_string(&mut info, ids::MUXING_APP, MUXING_APP);
        write_string(&mut info, ids::WRITING_APP, MUXING_APP);
        // Duration id (2 bytes) and size (1 byte) precede the patched float.
        let duration_in_info = info.len() as u64 + 3;
        write_float(&mut info, ids::DURATION, 0.0);
        write_id(&mut head, ids::INFO);
        write_size(&mut head, info.len() as u64);
        let duration_at = head.len() as u64 + duration_in_info;
        head.extend_from_slice(&info);

        let tracks_at = head.len() as u64;
        write_master(&mut head, ids::TRACKS, |out| {
            for config in &self.tracks {
                config.track.write(out);
            }
        });

        self.emit(&head)?;
        self.layout = Some(Layout {
            segment_size_at,
            segment_data_start,
            info_at,
            tracks_at,
            duration_at,
        });
        Ok(())
    }

    fn close_cluster(&mut self) -> Result<(), WebmError> {
        if let Some(cluster) = self.cluster.take() {
            // Cluster id (4 bytes) and 8-byte size field.
            let size = self.position - (cluster.start + 12);
            self.inner.seek(SeekFrom::Start(cluster.start + 4))?;
            self.inner.write_all(&size_field_8(size))?;
            self.inner.seek(SeekFrom::Start(self.position))?;
        }
        Ok(())
    }

    fn open_cluster(&mut self, timecode: i64) -> Result<(), WebmError> {
        self.close_cluster()?;
        let start = self.position;
        let mut head = Vec::with_capacity(24);
        write_id(&mut head, ids::CLUSTER);
        head.extend_from_slice(&size_field_8(0));
        write_uint(&mut head, ids::TIMECODE, timecode.max(0) as u64);
        self.emit(&head)?;
        self.cluster = Some(OpenCluster {
            start,
            timecode: timecode.max(0),
            blocks: 0,
        });
        Ok(())
    }

    /// Write `Cues`, then patch the segment size, `SeekHead` and `Duration`.
    pub fn finish(mut self) -> Result<W, WebmError> {
        if self.layout.is_none() {
            self.start()?;
        }
        self.close_cluster()?;
        let Some(layout) = self.layout.take() else {
            return Err(WebmError::InvalidState("writer was not started"));
        };
        let relative = |at: u64| at - layout.segment_data_start;

        let cues_at = if self.cues.is_empty() {
            None
        } else {
            let at = self.position;
            let mut cues = Vec::new();
            write_master(&mut cues, ids::CUES, |out| {
                for cue in &self.cues {
                    write_master(out, ids::CUE_POINT, |out| {
                        write_uint(out, ids::CUE_TIME, cue.time.max(0) as u64);
                        write_master(out, ids::CUE_TRACK_POSITIONS, |out| {
                            write_uint(out, ids::CUE_TRACK, cue.track);
                            write_uint(out, ids::CUE_CLUSTER_POSITION, cue.cluster_position);
                        });
                    });
                }
            });
            self.emit(&cues)?;
            Some(at)
        };
        let end = self.position;

        let mut seek_head = Vec::new();
        write_master(&mut seek_head, ids::SEEK_HEAD, |out| {
            let mut entries = vec![
                (ids::INFO, relative(layout.info_at)),
                (ids::TRACKS, relative(layout.tracks_at)),
            ];
            if let Some(at) = cues_at {
                entries.push((ids::CUES, relative(at)));
            }
            for (id, position) in entries {
                write_master(out, ids::SEEK, |out| {
                    let mut seek_id = Vec::new();
                    write_id(&mut seek_id, id);
                    write_binary(out, ids::SEEK_ID, &seek_id);
                    write_uint_fixed(out, ids::SEEK_POSITION, position);
                });
            }
        });
        let seek_head_len = seek_head.len();
        write_void(&mut seek_head, SEEK_HEAD_RESERVED - seek_head_len);

        self.inner
            .seek(SeekFrom::Start(layout.segment_data_start))?;
        self.inner.write_all(&seek_head)?;

        self.inner.seek(SeekFrom::Start(layout.segment_size_at))?;
        self.inner
            .write_all(&size_field_8(end - layout.segment_data_start))?;

        self.inner.seek(SeekFrom::Start(layout.duration_at))?;
        self.inner.write_all(&(self.end_time as f64).to_be_bytes())?;

        self.inner.seek(SeekFrom::Start(end))?;
        self.inner.flush()?;

        debug!(
            tracks = self.tracks.len(),
            cues = self.cues.len(),
            duration_ms = self.end_time,
            size = end,
            "webm finished"
        );
        Ok(self.inner)
    }
}

impl<W: Write + Seek> SampleSink for WebmWriter<W> {
    type Error = WebmError;

    fn write_sample(
        &mut self,
        track: usize,
        data: &[u8],
        meta: &SampleMeta,
    ) -> Result<(), WebmError> {
        let Some(config) = self.tracks.get(track) else {
            return Err(WebmError::NoSuchTrack(track));
        };
        let input_timescale = config.timescale;
        let is_video = config.track.track_type == TRACK_TYPE_VIDEO;
        let number = config.track.number;
        if self.layout.is_none() {
            self.start()?;
        }

        let timestamp = rescale(meta.presentation_time(), input_timescale, TICKS_PER_SECOND);
        let duration = rescale(i64::from(meta.duration), input_timescale, TICKS_PER_SECOND);

        let split = match &self.cluster {
            None => true,
            Some(cluster) => {
                let relative = timestamp - cluster.timecode;
                (is_video && meta.is_sync && cluster.blocks > 0)
                    || relative > i64::from(i16::MAX)
                    || relative < i64::from(i16::MIN)
            }
        };
        if split {
            self.open_cluster(timestamp)?;
            let cued_track = is_video || !self.has_video();
            if cued_track && meta.is_sync {
                let layout_start = self
                    .layout
                    .as_ref()
                    .map(|l| l.segment_data_start)
                    .unwrap_or(0);
                let cluster_position = self.cluster.as_ref().map(|c| c.start).unwrap_or(0);
                self.cues.push(CuePoint {
                    time: timestamp,
                    track: number,
                    cluster_position: cluster_position - layout_start,
                });
            }
        }

        let cluster_timecode = self.cluster.as_ref().map(|c| c.timecode).unwrap_or(0);
        let relative = (timestamp - cluster_timecode) as i16;

        let mut block = Vec::with_capacity(data.len() + 16);
        write_id(&mut block, ids::SIMPLE_BLOCK);
        // Track number vint, relative timecode, flags.
        let mut number_vint = Vec::new();
        write_size(&mut number_vint, number);
        write_size(&mut block, (number_vint.len() + 3 + data.len()) as u64);
        block.extend_from_slice(&number_vint);
        block.extend_from_slice(&relative.to_be_bytes());
        block.push(if meta.is_sync { 0x80 } else { 0x00 });
        block.extend_from_slice(data);
        self.emit(&block)?;

        if let Some(cluster) = self.cluster.as_mut() {
            cluster.blocks += 1;
        }
        self.end_time = self.end_time.max(timestamp + duration);
        Ok(())
    }
}
