//! EBML primitives: element IDs, variable-length integers, typed element payloads.

use std::io::{self, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::WebmError;

pub mod ids {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x1853_8067;

    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;

    pub const INFO: u32 = 0x1549_A966;
    pub const TIMECODE_SCALE: u32 = 0x2A_D7B1;
    pub const DURATION: u32 = 0x4489;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const LANGUAGE: u32 = 0x22_B59C;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const DEFAULT_DURATION: u32 = 0x23_E383;
    pub const CODEC_DELAY: u32 = 0x56AA;
    pub const SEEK_PRE_ROLL: u32 = 0x56BB;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;
    pub const BIT_DEPTH: u32 = 0x6264;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMECODE: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const BLOCK_DURATION: u32 = 0x9B;
    pub const REFERENCE_BLOCK: u32 = 0xFB;

    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;

    pub const VOID: u32 = 0xEC;
}

/// Header of one element: its ID and payload size (`None` for unknown-size masters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementHeader {
    pub id: u32,
    pub size: Option<u64>,
    pub header_len: u64,
}

/// Read a variable-length integer. Returns `(value, length)`; with `keep_marker` the
/// length marker bit stays in the value, which is how element IDs are compared.
fn read_vint<R: Read>(reader: &mut R, keep_marker: bool) -> Result<(u64, u64), WebmError> {
    let first = reader.read_u8()?;
    if first == 0 {
        return Err(WebmError::InvalidVint);
    }
    let len = first.leading_zeros() as u64 + 1;
    let mut value = if keep_marker {
        u64::from(first)
    } else {
        u64::from(first & (0xFFu16 >> len) as u8)
    };
    for _ in 1..len {
        value = (value << 8) | u64::from(reader.read_u8()?);
    }
    Ok((value, len))
}

/// Read an element header, returning `None` on a clean end of stream.
pub fn read_element_header<R: Read>(reader: &mut R) -> Result<Option<ElementHeader>, WebmError> {
    let (id, id_len) = match read_vint(reader, true) {
        Ok(v) => v,
        Err(WebmError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if id_len > 4 {
        return Err(WebmError::InvalidVint);
    }
    let (size, size_len) = read_vint(reader, false)?;
    let unknown = size == (1u64 << (7 * size_len)) - 1;
    Ok(Some(ElementHeader {
        id: id as u32,
        size: (!unknown).then_some(size),
        header_len: id_len + size_len,
    }))
}

/// Track number vint at the start of a block payload: `(track_number, length)`.
pub fn read_track_number(data: &[u8]) -> Result<(u64, usize), WebmError> {
    let mut cursor = io::Cursor::new(data);
    let (value, len) = read_vint(&mut cursor, false)?;
    Ok((value, len as usize))
}

pub fn parse_uint(data: &[u8]) -> u64 {
    data.iter().take(8).fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

pub fn parse_float(id: u32, data: &[u8]) -> Result<f64, WebmError> {
    let mut cursor = io::Cursor::new(data);
    match data.len() {
        0 => Ok(0.0),
        4 => Ok(f64::from(cursor.read_f32::<BigEndian>()?)),
        8 => Ok(cursor.read_f64::<BigEndian>()?),
        n => Err(WebmError::invalid(id, format!("float of {n} bytes"))),
    }
}

pub fn parse_string(data: &[u8]) -> String {
    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Iterate `(id, payload)` pairs of a fully buffered master element body.
pub fn children(body: &[u8]) -> impl Iterator<Item = Result<(u32, &[u8]), WebmError>> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset >= body.len() {
            return None;
        }
        let mut cursor = io::Cursor::new(&body[offset..]);
        let header = match read_element_header(&mut cursor) {
            Ok(Some(header)) => header,
            Ok(None) => return None,
            Err(e) => {
                offset = body.len();
                return Some(Err(e));
            }
        };
        let start = offset + header.header_len as usize;
        let Some(size) = header.size else {
            offset = body.len();
            return Some(Err(WebmError::invalid(header.id, "unknown size inside buffered master")));
        };
        let end = start.saturating_add(size as usize);
        if end > body.len() {
            offset = body.len();
            return Some(Err(WebmError::invalid(header.id, "element overruns its parent")));
        }
        offset = end;
        Some(Ok((header.id, &body[start..end])))
    })
}

pub fn write_id(out: &mut Vec<u8>, id: u32) {
    let bytes = id.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(3);
    out.extend_from_slice(&bytes[skip..]);
}

/// Minimal-length size vint.
pub fn write_size(out: &mut Vec<u8>, size: u64) {
    let len = (1..=8u32)
        .find(|len| size < (1u64 << (7 * len)) - 1)
        .unwrap_or(8);
    write_size_fixed(out, size, len as usize);
}

/// Size vint padded to exactly `len` bytes, so it can be patched later.
pub fn write_size_fixed(out: &mut Vec<u8>, size: u64, len: usize) {
    let marked = size | (1u64 << (7 * len));
    out.extend_from_slice(&marked.to_be_bytes()[8 - len..]);
}

/// Encoded 8-byte size field for an element whose size is patched after the fact.
pub fn size_field_8(size: u64) -> [u8; 8] {
    (size | (1u64 << 56)).to_be_bytes()
}

pub fn write_uint(out: &mut Vec<u8>, id: u32, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    write_id(out, id);
    write_size(out, (8 - skip) as u64);
    out.extend_from_slice(&bytes[skip..]);
}

/// Unsigned integer element with an 8-byte payload, for values patched later.
pub fn write_uint_fixed(out: &mut Vec<u8>, id: u32, value: u64) {
    write_id(out, id);
    write_size(out, 8);
    out.extend_from_slice(&value.to_be_bytes());
}

pub fn write_float(out: &mut Vec<u8>, id: u32, value: f64) {
    write_id(out, id);
    write_size(out, 8);
    // Writing into a Vec cannot fail.
    let _ = out.write_f64::<BigEndian>(value);
}

pub fn write_string(out: &mut Vec<u8>, id: u32, value: &str) {
    write_binary(out, id, value.as_bytes());
}

pub fn write_binary(out: &mut Vec<u8>, id: u32, value: &[u8]) {
    write_id(out, id);
    write_size(out, value.len() as u64);
    out.extend_from_slice(value);
}

pub fn write_master(out: &mut Vec<u8>, id: u32, body: impl FnOnce(&mut Vec<u8>)) {
    let mut inner = Vec::new();
    body(&mut inner);
    write_binary(out, id, &inner);
}

/// A Void element occupying exactly `total` bytes (at least 2).
pub fn write_void(out: &mut Vec<u8>, total: usize) {
    debug_assert!(total >= 2);
    let size_len = if total - 1 > 127 { 8 } else { 1 };
    let payload = total.saturating_sub(1 + size_len);
    write_id(out, ids::VOID);
    write_size_fixed(out, payload as u64, size_len);
    out.resize(out.len() + payload, 0);
}
