//! `moov` tree parsing.
//!
//! Builds a [`Movie`] from a `moov` box: movie timescale, per-track headers, the first
//! sample description of every track and, for progressive files, the full sample index.
//! Fragmented files carry an empty index here; their samples come from `moof` boxes
//! (see [`crate::fragment`]).

use bytes::Bytes;
use media_types::{MediaKind, rescale};
use tracing::{debug, warn};

use crate::box_utils::{
    BoxView, be_i32, be_u16, be_u32, be_u64, children, find_first_box, full_box_header,
};
use crate::error::Mp4Error;
use crate::sample_table::parse_sample_table;

/// One sample of a track, resolved to an absolute file position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleEntry {
    pub offset: u64,
    pub size: u32,
    pub decode_time: i64,
    pub composition_offset: i32,
    pub duration: u32,
    pub is_sync: bool,
}

/// Per-track defaults from `mvex/trex`, used by fragment runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TrackExtends {
    pub(crate) track_id: u32,
    pub(crate) default_sample_duration: u32,
    pub(crate) default_sample_size: u32,
    pub(crate) default_sample_flags: u32,
}

#[derive(Debug, Clone)]
pub struct Mp4Track {
    pub track_id: u32,
    /// `hdlr` handler type, e.g. `vide` or `soun`.
    pub handler: [u8; 4],
    pub timescale: u32,
    /// Packed ISO-639-2/T language code from `mdhd`.
    pub language: u16,
    /// Presentation width and height from `tkhd`, as 16.16 fixed point.
    pub width: u32,
    pub height: u32,
    /// 8.8 fixed point volume from `tkhd`.
    pub volume: u16,
    /// First `stsd` entry, box header included.
    pub sample_entry: Bytes,
    pub(crate) samples: Vec<SampleEntry>,
    /// Added to every decode time: leading empty edits minus the first media edit's start.
    pub(crate) edit_shift: i64,
}

impl Mp4Track {
    /// FourCC of the sample entry, e.g. `avc1` or `mp4a`.
    pub fn codec(&self) -> [u8; 4] {
        if self.sample_entry.len() < 8 {
            return [0; 4];
        }
        [
            self.sample_entry[4],
            self.sample_entry[5],
            self.sample_entry[6],
            self.sample_entry[7],
        ]
    }

    /// MIME type of the track's samples.
    pub fn mime(&self) -> String {
        let mime = match &self.codec() {
            b"avc1" | b"avc3" => "video/avc",
            b"hvc1" | b"hev1" => "video/hevc",
            b"av01" => "video/av01",
            b"vp09" => "video/x-vnd.on2.vp9",
            b"vp08" => "video/x-vnd.on2.vp8",
            b"mp4v" => "video/mp4v-es",
            b"mp4a" => "audio/mp4a-latm",
            b"Opus" => "audio/opus",
            b"ac-3" => "audio/ac3",
            b"ec-3" => "audio/eac3",
            b"fLaC" => "audio/flac",
            b".mp3" => "audio/mpeg",
            _ => match &self.handler {
                b"vide" => "video/unknown",
                b"soun" => "audio/unknown",
                _ => "application/octet-stream",
            },
        };
        mime.to_string()
    }

    pub fn kind(&self) -> Option<MediaKind> {
        let mime = self.mime();
        [MediaKind::Video, MediaKind::Audio]
            .into_iter()
            .find(|kind| kind.matches_mime(&mime))
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn samples(&self) -> &[SampleEntry] {
        &self.samples
    }
}

#[derive(Debug, Clone, Default)]
pub struct Movie {
    pub timescale: u32,
    pub tracks: Vec<Mp4Track>,
    pub(crate) extends: Vec<TrackExtends>,
    pub(crate) fragmented: bool,
}

impl Movie {
    pub(crate) fn track_index(&self, track_id: u32) -> Option<usize> {
        self.tracks.iter().position(|t| t.track_id == track_id)
    }

    pub(crate) fn extends_for(&self, track_id: u32) -> TrackExtends {
        self.extends
            .iter()
            .find(|t| t.track_id == track_id)
            .copied()
            .unwrap_or(TrackExtends {
                track_id,
                ..Default::default()
            })
    }
}

fn child(data: &Bytes, parent: &BoxView, fourcc: [u8; 4]) -> Option<BoxView> {
    find_first_box(data, parent.body_start, parent.body_end, fourcc)
}

fn require(
    data: &Bytes,
    parent: &BoxView,
    fourcc: [u8; 4],
    name: &'static str,
) -> Result<BoxView, Mp4Error> {
    child(data, parent, fourcc).ok_or(Mp4Error::MissingBox(name))
}

/// Parse a complete `moov` box (header included).
pub fn parse_moov(data: &Bytes) -> Result<Movie, Mp4Error> {
    let moov = crate::box_utils::box_at(data, 0, data.len())
        .filter(|b| b.fourcc == *b"moov")
        .ok_or(Mp4Error::MissingBox("moov"))?;

    let mvhd = require(data, &moov, *b"mvhd", "mvhd")?;
    let timescale = parse_mvhd_timescale(&data[mvhd.body_start..mvhd.body_end])?;

    let mut movie = Movie {
        timescale,
        ..Default::default()
    };

    if let Some(mvex) = child(data, &moov, *b"mvex") {
        movie.fragmented = true;
        for trex in children(data, mvex.body_start, mvex.body_end).filter(|b| b.fourcc == *b"trex")
        {
            movie
                .extends
                .push(parse_trex(&data[trex.body_start..trex.body_end])?);
        }
    }

    for trak in children(data, moov.body_start, moov.body_end).filter(|b| b.fourcc == *b"trak") {
        match parse_trak(data, &trak, timescale)? {
            Some(track) => movie.tracks.push(track),
            None => debug!("skipping trak without sample description"),
        }
    }

    Ok(movie)
}

fn parse_mvhd_timescale(body: &[u8]) -> Result<u32, Mp4Error> {
    let (version, _) = full_box_header(body).ok_or_else(|| Mp4Error::malformed("mvhd", "short"))?;
    let at = if version == 1 { 20 } else { 12 };
    match be_u32(body, at) {
        Some(0) | None => Err(Mp4Error::malformed("mvhd", "missing timescale")),
        Some(ts) => Ok(ts),
    }
}

fn parse_trex(body: &[u8]) -> Result<TrackExtends, Mp4Error> {
    let field = |at| be_u32(body, at).ok_or_else(|| Mp4Error::malformed("trex", "short"));
    Ok(TrackExtends {
        track_id: field(4)?,
        default_sample_duration: field(12)?,
        default_sample_size: field(16)?,
        default_sample_flags: field(20)?,
    })
}

struct TrackHeader {
    track_id: u32,
    volume: u16,
    width: u32,
    height: u32,
}

fn parse_tkhd(body: &[u8]) -> Result<TrackHeader, Mp4Error> {
    let (version, _) = full_box_header(body).ok_or_else(|| Mp4Error::malformed("tkhd", "short"))?;
    let (id_at, volume_at, width_at) = if version == 1 {
        (20, 48, 88)
    } else {
        (12, 36, 76)
    };
    let track_id =
        be_u32(body, id_at).ok_or_else(|| Mp4Error::malformed("tkhd", "missing track id"))?;
    Ok(TrackHeader {
        track_id,
        volume: be_u16(body, volume_at).unwrap_or(0),
        width: be_u32(body, width_at).unwrap_or(0),
        height: be_u32(body, width_at + 4).unwrap_or(0),
    })
}

fn parse_mdhd(body: &[u8]) -> Result<(u32, u16), Mp4Error> {
    let (version, _) = full_box_header(body).ok_or_else(|| Mp4Error::malformed("mdhd", "short"))?;
    let (ts_at, lang_at) = if version == 1 { (20, 32) } else { (12, 20) };
    let timescale = match be_u32(body, ts_at) {
        Some(0) | None => return Err(Mp4Error::malformed("mdhd", "missing timescale")),
        Some(ts) => ts,
    };
    Ok((timescale, be_u16(body, lang_at).unwrap_or(0x55C4)))
}

/// Offset added to every decode time so presentation follows the edit list.
///
/// Leading empty edits delay the track. The first media edit starts presentation at
/// its `media_time`, so that media time maps to the end of the delay. Later edits are
/// not applied.
fn parse_edit_shift(
    data: &Bytes,
    trak: &BoxView,
    movie_timescale: u32,
    media_timescale: u32,
) -> i64 {
    let Some(edts) = child(data, trak, *b"edts") else {
        return 0;
    };
    let Some(elst) = child(data, &edts, *b"elst") else {
        return 0;
    };
    let body = &data[elst.body_start..elst.body_end];
    let Some((version, _)) = full_box_header(body) else {
        return 0;
    };
    let entry_count = be_u32(body, 4).unwrap_or(0) as usize;
    let entry_size = if version == 1 { 20 } else { 12 };

    let mut delay = 0i64;
    for index in 0..entry_count {
        let at = 8 + index * entry_size;
        let entry = if version == 1 {
            be_u64(body, at).zip(be_u64(body, at + 8).map(|t| t as i64))
        } else {
            be_u32(body, at)
                .map(u64::from)
                .zip(be_i32(body, at + 4).map(i64::from))
        };
        let Some((segment_duration, media_time)) = entry else {
            warn!(index, entry_count, "elst shorter than its entry count");
            break;
        };

        let segment_duration = i64::try_from(segment_duration).unwrap_or(i64::MAX);
        if media_time == -1 {
            delay = delay.saturating_add(segment_duration);
            continue;
        }
        if index + 1 < entry_count {
            debug!(
                edits = entry_count - index - 1,
                "ignoring edits after the first media edit"
            );
        }
        return rescale(delay, movie_timescale, media_timescale).saturating_sub(media_time.max(0));
    }
    rescale(delay, movie_timescale, media_timescale)
}

fn parse_trak(
    data: &Bytes,
    trak: &BoxView,
    movie_timescale: u32,
) -> Result<Option<Mp4Track>, Mp4Error> {
    let tkhd = require(data, trak, *b"tkhd", "tkhd")?;
    let header = parse_tkhd(&data[tkhd.body_start..tkhd.body_end])?;

    let mdia = require(data, trak, *b"mdia", "mdia")?;
    let mdhd = require(data, &mdia, *b"mdhd", "mdhd")?;
    let (timescale, language) = parse_mdhd(&data[mdhd.body_start..mdhd.body_end])?;

    let handler = child(data, &mdia, *b"hdlr")
        .and_then(|hdlr| {
            let body = &data[hdlr.body_start..hdlr.body_end];
            body.get(8..12).map(|h| [h[0], h[1], h[2], h[3]])
        })
        .unwrap_or(*b"\0\0\0\0");

    let minf = require(data, &mdia, *b"minf", "minf")?;
    let stbl = require(data, &minf, *b"stbl", "stbl")?;
    let stsd = require(data, &stbl, *b"stsd", "stsd")?;

    let stsd_body = &data[stsd.body_start..stsd.body_end];
    let entry_count = be_u32(stsd_body, 4).unwrap_or(0);
    if entry_count > 1 {
        warn!(
            track_id = header.track_id,
            entry_count, "track has several sample descriptions, only the first is copied"
        );
    }
    let Some(entry) = crate::box_utils::box_at(data, stsd.body_start + 8, stsd.body_end) else {
        return Ok(None);
    };

    let samples = parse_sample_table(data, &stbl)?;
    let edit_shift = parse_edit_shift(data, trak, movie_timescale, timescale);

    Ok(Some(Mp4Track {
        track_id: header.track_id,
        handler,
        timescale,
        language,
        width: header.width,
        height: header.height,
        volume: header.volume,
        sample_entry: data.slice(entry.start..entry.end),
        samples,
        edit_shift,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_box, make_full_box};

    fn mvhd(timescale: u32) -> Vec<u8> {
        let mut payload = vec![0u8; 96];
        payload[8..12].copy_from_slice(&timescale.to_be_bytes());
        make_full_box(b"mvhd", 0, 0, &payload)
    }

    fn trak(track_id: u32, handler: &[u8; 4], entry: &[u8; 4], timescale: u32) -> Vec<u8> {
        let mut tkhd_payload = vec![0u8; 80];
        tkhd_payload[8..12].copy_from_slice(&track_id.to_be_bytes());
        tkhd_payload[72..76].copy_from_slice(&(640u32 << 16).to_be_bytes());
        tkhd_payload[76..80].copy_from_slice(&(360u32 << 16).to_be_bytes());
        let tkhd = make_full_box(b"tkhd", 0, 0, &tkhd_payload);

        let mut mdhd_payload = vec![0u8; 20];
        mdhd_payload[8..12].copy_from_slice(&timescale.to_be_bytes());
        let mdhd = make_full_box(b"mdhd", 0, 0, &mdhd_payload);

        let mut hdlr_payload = vec![0u8; 21];
        hdlr_payload[4..8].copy_from_slice(handler);
        let hdlr = make_full_box(b"hdlr", 0, 0, &hdlr_payload);

        let mut stsd_payload = 1u32.to_be_bytes().to_vec();
        stsd_payload.extend_from_slice(&make_box(entry, &[0u8; 8]));
        let stsd = make_full_box(b"stsd", 0, 0, &stsd_payload);
        let empty = 0u32.to_be_bytes();
        let mut stbl_body = stsd;
        stbl_body.extend(make_full_box(b"stts", 0, 0, &empty));
        stbl_body.extend(make_full_box(b"stsc", 0, 0, &empty));
        stbl_body.extend(make_full_box(b"stsz", 0, 0, &[0u8; 8]));
        stbl_body.extend(make_full_box(b"stco", 0, 0, &empty));

        let minf = make_box(b"minf", &make_box(b"stbl", &stbl_body));
        let mut mdia_body = mdhd;
        mdia_body.extend(hdlr);
        mdia_body.extend(minf);

        let mut trak_body = tkhd;
        trak_body.extend(make_box(b"mdia", &mdia_body));
        make_box(b"trak", &trak_body)
    }

    fn elst_trak(version: u8, entries: &[(i64, i64)]) -> (Bytes, BoxView) {
        let mut elst = (entries.len() as u32).to_be_bytes().to_vec();
        for &(duration, media_time) in entries {
            if version == 1 {
                elst.extend_from_slice(&(duration as u64).to_be_bytes());
                elst.extend_from_slice(&media_time.to_be_bytes());
            } else {
                elst.extend_from_slice(&(duration as u32).to_be_bytes());
                elst.extend_from_slice(&(media_time as i32).to_be_bytes());
            }
            elst.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        }
        let edts = make_box(b"edts", &make_full_box(b"elst", version, 0, &elst));
        let data = Bytes::from(make_box(b"trak", &edts));
        let trak = crate::box_utils::box_at(&data, 0, data.len()).unwrap();
        (data, trak)
    }

    #[test]
    fn test_edit_shift_from_leading_edits() {
        // 500 ms of nothing, then media from tick 1024 on.
        let (data, trak) = elst_trak(0, &[(500, -1), (10_000, 1024), (2_000, 0)]);
        assert_eq!(parse_edit_shift(&data, &trak, 1000, 48_000), 24_000 - 1024);

        let (data, trak) = elst_trak(1, &[(0, 2 * 3000)]);
        assert_eq!(parse_edit_shift(&data, &trak, 1000, 90_000), -6000);

        let (data, trak) = elst_trak(1, &[(1000, -1)]);
        assert_eq!(parse_edit_shift(&data, &trak, 1000, 90_000), 90_000);

        let data = Bytes::from(make_box(b"trak", &[]));
        let trak = crate::box_utils::box_at(&data, 0, data.len()).unwrap();
        assert_eq!(parse_edit_shift(&data, &trak, 1000, 90_000), 0);
    }

    #[test]
    fn test_parse_moov_tracks() {
        let mut body = mvhd(1000);
        body.extend(trak(1, b"vide", b"avc1", 90_000));
        body.extend(trak(2, b"soun", b"mp4a", 44_100));
        let moov = Bytes::from(make_box(b"moov", &body));

        let movie = parse_moov(&moov).unwrap();
        assert_eq!(movie.timescale, 1000);
        assert!(!movie.fragmented);
        assert_eq!(movie.tracks.len(), 2);

        let video = &movie.tracks[0];
        assert_eq!(video.track_id, 1);
        assert_eq!(video.timescale, 90_000);
        assert_eq!(video.mime(), "video/avc");
        assert_eq!(video.kind(), Some(MediaKind::Video));
        assert_eq!(video.width >> 16, 640);
        assert_eq!(video.height >> 16, 360);
        assert_eq!(&video.sample_entry[4..8], b"avc1");

        let audio = &movie.tracks[1];
        assert_eq!(audio.mime(), "audio/mp4a-latm");
        assert_eq!(audio.kind(), Some(MediaKind::Audio));
        assert_eq!(audio.sample_count(), 0);
    }

    #[test]
    fn test_unknown_codec_falls_back_to_handler() {
        let mut body = mvhd(1000);
        body.extend(trak(7, b"soun", b"zzzz", 48_000));
        let moov = Bytes::from(make_box(b"moov", &body));
        let movie = parse_moov(&moov).unwrap();
        assert_eq!(movie.tracks[0].mime(), "audio/unknown");
        assert_eq!(movie.track_index(7), Some(0));
    }

    #[test]
    fn test_missing_mvhd_is_an_error() {
        let moov = Bytes::from(make_box(b"moov", &trak(1, b"vide", b"avc1", 1000)));
        assert!(matches!(parse_moov(&moov), Err(Mp4Error::MissingBox("mvhd"))));
    }
}
