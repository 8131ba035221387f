//! Fragmented MP4 (`moof`) sample index.
//!
//! Each `traf` run is resolved against the track defaults from `trex` and `tfhd`
//! and appended to the sample list of the matching [`Mp4Track`](crate::Mp4Track).

use bytes::Bytes;
use tracing::debug;

use crate::box_utils::{be_i32, be_u32, be_u64, box_at, children, find_first_box, full_box_header};
use crate::error::Mp4Error;
use crate::isobmff::{Movie, SampleEntry};

const TFHD_BASE_DATA_OFFSET: u32 = 0x000001;
const TFHD_SAMPLE_DESCRIPTION_INDEX: u32 = 0x000002;
const TFHD_DEFAULT_DURATION: u32 = 0x000008;
const TFHD_DEFAULT_SIZE: u32 = 0x000010;
const TFHD_DEFAULT_FLAGS: u32 = 0x000020;

const TRUN_DATA_OFFSET: u32 = 0x000001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x000004;
const TRUN_DURATION: u32 = 0x000100;
const TRUN_SIZE: u32 = 0x000200;
const TRUN_FLAGS: u32 = 0x000400;
const TRUN_CTO: u32 = 0x000800;

/// `sample_is_non_sync_sample` bit of the ISOBMFF sample flags.
const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

#[derive(Debug, Clone, Copy)]
struct FragmentDefaults {
    track_id: u32,
    base_data_offset: u64,
    duration: u32,
    size: u32,
    flags: u32,
}

fn parse_tfhd(body: &[u8], movie: &Movie, moof_start: u64) -> Result<FragmentDefaults, Mp4Error> {
    let (_, flags) = full_box_header(body).ok_or_else(|| Mp4Error::malformed("tfhd", "short"))?;
    let track_id = be_u32(body, 4).ok_or_else(|| Mp4Error::malformed("tfhd", "short"))?;
    let extends = movie.extends_for(track_id);

    let mut defaults = FragmentDefaults {
        track_id,
        base_data_offset: moof_start,
        duration: extends.default_sample_duration,
        size: extends.default_sample_size,
        flags: extends.default_sample_flags,
    };

    let missing = |field: &str| Mp4Error::malformed("tfhd", format!("missing {field}"));
    let mut idx = 8;
    if flags & TFHD_BASE_DATA_OFFSET != 0 {
        defaults.base_data_offset = be_u64(body, idx).ok_or_else(|| missing("base_data_offset"))?;
        idx += 8;
    }
    if flags & TFHD_SAMPLE_DESCRIPTION_INDEX != 0 {
        idx += 4;
    }
    if flags & TFHD_DEFAULT_DURATION != 0 {
        defaults.duration = be_u32(body, idx).ok_or_else(|| missing("default_sample_duration"))?;
        idx += 4;
    }
    if flags & TFHD_DEFAULT_SIZE != 0 {
        defaults.size = be_u32(body, idx).ok_or_else(|| missing("default_sample_size"))?;
        idx += 4;
    }
    if flags & TFHD_DEFAULT_FLAGS != 0 {
        defaults.flags = be_u32(body, idx).ok_or_else(|| missing("default_sample_flags"))?;
    }

    Ok(defaults)
}

fn parse_tfdt(body: &[u8]) -> Option<i64> {
    let (version, _) = full_box_header(body)?;
    if version == 1 {
        be_u64(body, 4).map(|v| v as i64)
    } else {
        be_u32(body, 4).map(i64::from)
    }
}

/// Running position of a `traf` while its runs are being expanded.
struct RunCursor {
    data_offset: u64,
    decode_time: i64,
}

fn parse_trun(
    body: &[u8],
    defaults: &FragmentDefaults,
    cursor: &mut RunCursor,
    out: &mut Vec<SampleEntry>,
) -> Result<(), Mp4Error> {
    let (_, flags) = full_box_header(body).ok_or_else(|| Mp4Error::malformed("trun", "short"))?;
    let sample_count = be_u32(body, 4).ok_or_else(|| Mp4Error::malformed("trun", "short"))?;
    let overflow = || Mp4Error::malformed("trun", "sample table overflows box");

    let mut idx = 8;
    if flags & TRUN_DATA_OFFSET != 0 {
        let relative = be_i32(body, idx).ok_or_else(overflow)?;
        let absolute = defaults.base_data_offset as i64 + i64::from(relative);
        if absolute < 0 {
            return Err(Mp4Error::malformed("trun", "negative sample offset"));
        }
        cursor.data_offset = absolute as u64;
        idx += 4;
    }

    let mut first_sample_flags = None;
    if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        first_sample_flags = Some(be_u32(body, idx).ok_or_else(overflow)?);
        idx += 4;
    }

    for i in 0..sample_count {
        let mut next = || -> Result<u32, Mp4Error> {
            let value = be_u32(body, idx).ok_or_else(overflow)?;
            idx += 4;
            Ok(value)
        };

        let duration = if flags & TRUN_DURATION != 0 {
            next()?
        } else {
            defaults.duration
        };
        let size = if flags & TRUN_SIZE != 0 {
            next()?
        } else {
            defaults.size
        };
        let sample_flags = if flags & TRUN_FLAGS != 0 {
            next()?
        } else if i == 0 {
            first_sample_flags.unwrap_or(defaults.flags)
        } else {
            defaults.flags
        };
        // Version 0 stores unsigned offsets; both are read as signed.
        let composition_offset = if flags & TRUN_CTO != 0 {
            next()? as i32
        } else {
            0
        };

        out.push(SampleEntry {
            offset: cursor.data_offset,
            size,
            decode_time: cursor.decode_time,
            composition_offset,
            duration,
            is_sync: sample_flags & SAMPLE_IS_NON_SYNC == 0,
        });
        cursor.data_offset += u64::from(size);
        cursor.decode_time += i64::from(duration);
    }

    Ok(())
}

/// Append the samples described by one `moof` box to the tracks of `movie`.
///
/// `data` holds the `moof` box alone and `moof_start` is its absolute file position.
pub(crate) fn apply_moof(data: &Bytes, moof_start: u64, movie: &mut Movie) -> Result<(), Mp4Error> {
    let moof = box_at(data, 0, data.len())
        .filter(|b| b.fourcc == *b"moof")
        .ok_or(Mp4Error::MissingBox("moof"))?;

    for traf in children(data, moof.body_start, moof.body_end).filter(|b| b.fourcc == *b"traf") {
        let tfhd = find_first_box(data, traf.body_start, traf.body_end, *b"tfhd")
            .ok_or(Mp4Error::MissingBox("tfhd"))?;
        let defaults = parse_tfhd(&data[tfhd.body_start..tfhd.body_end], movie, moof_start)?;

        let Some(index) = movie.track_index(defaults.track_id) else {
            debug!(track_id = defaults.track_id, "fragment for unknown track");
            continue;
        };
        let track = &mut movie.tracks[index];

        let running_end = track
            .samples
            .last()
            .map(|s| s.decode_time + i64::from(s.duration))
            .unwrap_or(0);
        let decode_time = find_first_box(data, traf.body_start, traf.body_end, *b"tfdt")
            .and_then(|tfdt| parse_tfdt(&data[tfdt.body_start..tfdt.body_end]))
            .unwrap_or(running_end);

        let mut cursor = RunCursor {
            data_offset: defaults.base_data_offset,
            decode_time,
        };
        for trun in children(data, traf.body_start, traf.body_end).filter(|b| b.fourcc == *b"trun")
        {
            parse_trun(
                &data[trun.body_start..trun.body_end],
                &defaults,
                &mut cursor,
                &mut track.samples,
            )?;
        }
    }

    Ok(())
}
