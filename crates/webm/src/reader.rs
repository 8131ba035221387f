use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{BigEndian, ReadBytesExt};
use media_types::{MediaKind, SampleMeta, SampleSource};
use tracing::{debug, trace, warn};

use crate::ebml::{
    ElementHeader, children, ids, parse_float, parse_string, parse_uint, read_element_header,
    read_track_number,
};
use crate::error::WebmError;
use crate::track::WebmTrack;

/// Nanoseconds per timecode tick when `Info` does not say otherwise.
pub const DEFAULT_TIMECODE_SCALE: u64 = 1_000_000;

/// Buffered elements (headers, `Info`, `Tracks`, blocks) larger than this are rejected.
const MAX_BUFFERED_ELEMENT: u64 = 256 * 1024 * 1024;

const LACING_MASK: u8 = 0x06;
const KEYFRAME_FLAG: u8 = 0x80;

/// Block reader over a WebM file.
///
/// Segment metadata is parsed on open; clusters are walked lazily while reading the
/// selected track, so the reader never holds more than one block in memory.
pub struct WebmReader<R> {
    inner: R,
    doc_type: String,
    timecode_scale: u64,
    duration: Option<f64>,
    tracks: Vec<WebmTrack>,
    segment_end: u64,
    first_cluster: u64,
    selected: Option<usize>,
    position: u64,
    cluster_timecode: i64,
}

impl WebmReader<BufReader<File>> {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, WebmError> {
        let file = File::open(path.as_ref())?;
        Self::open(BufReader::new(file))
    }
}

impl<R: Read + Seek> WebmReader<R> {
    pub fn open(mut inner: R) -> Result<Self, WebmError> {
        let file_len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;

        let header = read_element_header(&mut inner)?.ok_or(WebmError::NotEbml)?;
        if header.id != ids::EBML {
            return Err(WebmError::NotEbml);
        }
        let body = read_body(&mut inner, &header)?;
        let mut doc_type = String::from("matroska");
        for child in children(&body) {
            if let (ids::DOC_TYPE, value) = child? {
                doc_type = parse_string(value);
            }
        }
        if doc_type != "webm" && doc_type != "matroska" {
            return Err(WebmError::UnsupportedDocType(doc_type));
        }

        let mut position = header.header_len + header.size.unwrap_or(0);
        let segment = loop {
            inner.seek(SeekFrom::Start(position))?;
            let header = read_element_header(&mut inner)?
                .ok_or(WebmError::MissingElement("Segment"))?;
            if header.id == ids::SEGMENT {
                break header;
            }
            let size = header
                .size
                .ok_or_else(|| WebmError::invalid(header.id, "unknown size before Segment"))?;
            position += header.header_len + size;
        };
        let segment_start = position + segment.header_len;
        let segment_end = segment
            .size
            .map(|size| (segment_start + size).min(file_len))
            .unwrap_or(file_len);

        let mut reader = Self {
            inner,
            doc_type,
            timecode_scale: DEFAULT_TIMECODE_SCALE,
            duration: None,
            tracks: Vec::new(),
            segment_end,
            first_cluster: segment_end,
            selected: None,
            position: segment_start,
            cluster_timecode: 0,
        };
        reader.read_segment_metadata(segment_start)?;

        if reader.tracks.is_empty() {
            return Err(WebmError::MissingElement("Tracks"));
        }
        debug!(
            doc_type = %reader.doc_type,
            tracks = reader.tracks.len(),
            timecode_scale = reader.timecode_scale,
            "opened webm"
        );
        Ok(reader)
    }

    /// Parse `Info` and `Tracks`, stopping at the first `Cluster`.
    fn read_segment_metadata(&mut self, segment_start: u64) -> Result<(), WebmError> {
        let mut position = segment_start;
        while position < self.segment_end {
            self.inner.seek(SeekFrom::Start(position))?;
            let Some(header) = read_element_header(&mut self.inner)? else {
                break;
            };
            if header.id == ids::CLUSTER {
                self.first_cluster = position;
                break;
            }
            let size = header
                .size
                .ok_or(WebmError::Unsupported("unknown-size element outside clusters"))?;

            match header.id {
                ids::INFO => {
                    let body = read_body(&mut self.inner, &header)?;
                    for child in children(&body) {
                        match child? {
                            (ids::TIMECODE_SCALE, value) => {
                                self.timecode_scale = parse_uint(value).max(1)
                            }
                            (ids::DURATION, value) => {
                                self.duration = Some(parse_float(ids::DURATION, value)?)
                            }
                            _ => {}
                        }
                    }
                }
                ids::TRACKS => {
                    let body = read_body(&mut self.inner, &header)?;
                    for child in children(&body) {
                        if let (ids::TRACK_ENTRY, entry) = child? {
                            self.tracks.push(WebmTrack::parse(entry)?);
                        }
                    }
                }
                other => trace!(id = other, size, "skipping segment element"),
            }
            position += header.header_len + size;
        }
        Ok(())
    }

    pub fn doc_type(&self) -> &str {
        &self.doc_type
    }

    pub fn tracks(&self) -> &[WebmTrack] {
        &self.tracks
    }

    pub fn timecode_scale(&self) -> u64 {
        self.timecode_scale
    }

    /// Segment duration in timecode ticks, when the file records it.
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn find_track(&self, kind: MediaKind) -> Option<usize> {
        self.tracks
            .iter()
            .position(|track| kind.matches_mime(&track.mime()))
    }

    /// Select the track [`SampleSource::read_sample`] reads from and rewind to the first cluster.
    pub fn select_track(&mut self, index: usize) -> Result<(), WebmError> {
        if index >= self.tracks.len() {
            return Err(WebmError::NoSuchTrack(index));
        }
        self.selected = Some(index);
        self.position = self.first_cluster;
        self.cluster_timecode = 0;
        Ok(())
    }

    pub fn selected_track(&self) -> Option<&WebmTrack> {
        self.selected.map(|index| &self.tracks[index])
    }

    fn default_duration_ticks(&self, track: &WebmTrack) -> u32 {
        track
            .default_duration
            .map(|ns| (ns / self.timecode_scale) as u32)
            .unwrap_or(0)
    }

    /// Decode a block payload; `None` when it belongs to another track.
    fn decode_block(
        &self,
        body: &mut Vec<u8>,
        track_number: u64,
        simple: bool,
    ) -> Result<Option<(i64, bool)>, WebmError> {
        let (number, len) = read_track_number(body)?;
        if number != track_number {
            return Ok(None);
        }
        let mut header = &body[len..];
        let relative = header.read_i16::<BigEndian>()?;
        let flags = header.read_u8()?;
        if flags & LACING_MASK != 0 {
            return Err(WebmError::Unsupported("laced blocks"));
        }
        body.drain(..len + 3);
        let timestamp = self.cluster_timecode + i64::from(relative);
        Ok(Some((timestamp, simple && flags & KEYFRAME_FLAG != 0)))
    }
}

fn read_body<R: Read>(reader: &mut R, header: &ElementHeader) -> Result<Vec<u8>, WebmError> {
    let size = header
        .size
        .ok_or_else(|| WebmError::invalid(header.id, "unknown size"))?;
    if size > MAX_BUFFERED_ELEMENT {
        return Err(WebmError::invalid(header.id, format!("{size} bytes")));
    }
    let mut body = vec![0u8; size as usize];
    reader.read_exact(&mut body)?;
    Ok(body)
}

impl<R: Read + Seek> SampleSource for WebmReader<R> {
    type Error = WebmError;

    /// Ticks per second of block timestamps: one tick is `TimecodeScale` nanoseconds.
    fn timescale(&self) -> u32 {
        (1_000_000_000 / self.timecode_scale).clamp(1, u64::from(u32::MAX)) as u32
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleMeta>, WebmError> {
        let index = self
            .selected
            .ok_or(WebmError::InvalidState("no track selected"))?;
        let track_number = self.tracks[index].number;

        while self.position < self.segment_end {
            self.inner.seek(SeekFrom::Start(self.position))?;
            let Some(header) = read_element_header(&mut self.inner)? else {
                break;
            };
            let body_start = self.position + header.header_len;

            match header.id {
                // Descend: cluster children are walked at the same level as top-level elements.
                ids::CLUSTER => {
                    self.position = body_start;
                }
                ids::TIMECODE => {
                    let body = read_body(&mut self.inner, &header)?;
                    self.cluster_timecode = parse_uint(&body) as i64;
                    self.position = body_start + body.len() as u64;
                }
                ids::SIMPLE_BLOCK => {
                    let mut body = read_body(&mut self.inner, &header)?;
                    self.position = body_start + body.len() as u64;
                    if let Some((timestamp, is_sync)) =
                        self.decode_block(&mut body, track_number, true)?
                    {
                        let duration = self.default_duration_ticks(&self.tracks[index]);
                        *buf = body;
                        return Ok(Some(SampleMeta {
                            decode_time: timestamp,
                            composition_offset: 0,
                            duration,
                            is_sync,
                        }));
                    }
                }
                ids::BLOCK_GROUP => {
                    let group = read_body(&mut self.inner, &header)?;
                    self.position = body_start + group.len() as u64;

                    let mut block = None;
                    let mut block_duration = None;
                    let mut referenced = false;
                    for child in children(&group) {
                        match child? {
                            (ids::BLOCK, value) => block = Some(value.to_vec()),
                            (ids::BLOCK_DURATION, value) => {
                                block_duration = Some(parse_uint(value) as u32)
                            }
                            (ids::REFERENCE_BLOCK, _) => referenced = true,
                            _ => {}
                        }
                    }
                    let Some(mut body) = block else {
                        warn!(position = self.position, "BlockGroup without Block");
                        continue;
                    };
                    if let Some((timestamp, _)) =
                        self.decode_block(&mut body, track_number, false)?
                    {
                        let duration = block_duration
                            .unwrap_or_else(|| self.default_duration_ticks(&self.tracks[index]));
                        *buf = body;
                        return Ok(Some(SampleMeta {
                            decode_time: timestamp,
                            composition_offset: 0,
                            duration,
                            is_sync: !referenced,
                        }));
                    }
                }
                _ => {
                    let size = header
                        .size
                        .ok_or(WebmError::Unsupported("unknown-size element outside clusters"))?;
                    self.position = body_start + size;
                }
            }
        }

        Ok(None)
    }
}
