use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use bytes::Bytes;
use media_types::{MediaKind, SampleMeta, SampleSource};
use tracing::{debug, trace};

use crate::box_utils::read_box_header;
use crate::error::Mp4Error;
use crate::fragment::apply_moof;
use crate::isobmff::{Movie, Mp4Track, parse_moov};

/// Top-level boxes larger than this are never buffered.
const MAX_INDEX_BOX_SIZE: u64 = 64 * 1024 * 1024;

/// Sample reader over a progressive or fragmented MP4 file.
///
/// The whole sample index is built by [`Mp4Reader::open`]; sample payloads are read
/// lazily, one at a time, for the selected track.
pub struct Mp4Reader<R> {
    inner: R,
    movie: Movie,
    selected: Option<usize>,
    cursor: usize,
}

impl Mp4Reader<BufReader<File>> {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, Mp4Error> {
        let file = File::open(path.as_ref())?;
        Self::open(BufReader::new(file))
    }
}

impl<R: Read + Seek> Mp4Reader<R> {
    pub fn open(mut inner: R) -> Result<Self, Mp4Error> {
        let file_len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;

        let mut moov: Option<Bytes> = None;
        let mut fragments: Vec<(u64, Bytes)> = Vec::new();
        let mut position = 0u64;
        let mut first = true;

        while file_len.saturating_sub(position) >= 8 {
            inner.seek(SeekFrom::Start(position))?;
            let mut header = [0u8; 16];
            let available = (file_len - position).min(16) as usize;
            inner.read_exact(&mut header[..available])?;

            let Some((size, fourcc, header_size)) = read_box_header(&header[..available]) else {
                break;
            };
            // `size == 0` means "to end of file", which the header helper maps to the slice length.
            let size = if size == available && header_size == 8 && header[..4] == [0; 4] {
                file_len - position
            } else {
                size as u64
            };

            if first && !is_plausible_leading_box(&fourcc) {
                return Err(Mp4Error::NotIsobmff(format!(
                    "unexpected leading box {:?}",
                    String::from_utf8_lossy(&fourcc)
                )));
            }
            first = false;

            if size < header_size as u64 {
                return Err(Mp4Error::NotIsobmff(format!(
                    "box {:?} at {position} has size {size}",
                    String::from_utf8_lossy(&fourcc)
                )));
            }
            let box_end = position.checked_add(size);
            if box_end.is_none_or(|box_end| box_end > file_len) {
                debug!(
                    fourcc = %String::from_utf8_lossy(&fourcc),
                    position, size, file_len, "top-level box truncated"
                );
                if &fourcc != b"mdat" {
                    break;
                }
            }

            trace!(fourcc = %String::from_utf8_lossy(&fourcc), position, size, "top-level box");
            match &fourcc {
                b"moov" | b"moof" => {
                    if size > MAX_INDEX_BOX_SIZE {
                        return Err(Mp4Error::malformed("moov", format!("{size} bytes")));
                    }
                    let mut buf = vec![0u8; size as usize];
                    inner.seek(SeekFrom::Start(position))?;
                    inner.read_exact(&mut buf)?;
                    if &fourcc == b"moov" {
                        moov = Some(Bytes::from(buf));
                    } else {
                        fragments.push((position, Bytes::from(buf)));
                    }
                }
                _ => {}
            }

            let Some(next) = box_end else {
                break;
            };
            position = next;
        }

        let moov = moov.ok_or(Mp4Error::MissingBox("moov"))?;
        let mut movie = parse_moov(&moov)?;
        for (moof_start, moof) in &fragments {
            apply_moof(moof, *moof_start, &mut movie)?;
        }

        for track in &mut movie.tracks {
            if track.edit_shift != 0 {
                for sample in &mut track.samples {
                    sample.decode_time += track.edit_shift;
                }
            }
        }

        debug!(
            tracks = movie.tracks.len(),
            fragments = fragments.len(),
            "opened mp4"
        );

        Ok(Self {
            inner,
            movie,
            selected: None,
            cursor: 0,
        })
    }

    pub fn movie(&self) -> &Movie {
        &self.movie
    }

    pub fn tracks(&self) -> &[Mp4Track] {
        &self.movie.tracks
    }

    pub fn is_fragmented(&self) -> bool {
        self.movie.fragmented
    }

    /// Index of the first track whose MIME type belongs to `kind`.
    pub fn find_track(&self, kind: MediaKind) -> Option<usize> {
        self.movie
            .tracks
            .iter()
            .position(|track| kind.matches_mime(&track.mime()))
    }

    /// Select the track [`SampleSource::read_sample`] reads from and rewind it.
    pub fn select_track(&mut self, index: usize) -> Result<(), Mp4Error> {
        if index >= self.movie.tracks.len() {
            return Err(Mp4Error::NoSuchTrack(index));
        }
        self.selected = Some(index);
        self.cursor = 0;
        Ok(())
    }

    pub fn selected_track(&self) -> Option<&Mp4Track> {
        self.selected.map(|index| &self.movie.tracks[index])
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn is_plausible_leading_box(fourcc: &[u8; 4]) -> bool {
    matches!(
        fourcc,
        b"ftyp" | b"styp" | b"moov" | b"mdat" | b"free" | b"skip" | b"sidx" | b"wide" | b"pdin"
    )
}

impl<R: Read + Seek> SampleSource for Mp4Reader<R> {
    type Error = Mp4Error;

    fn timescale(&self) -> u32 {
        self.selected_track().map(|t| t.timescale).unwrap_or(1)
    }

    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleMeta>, Mp4Error> {
        let index = self
            .selected
            .ok_or(Mp4Error::InvalidState("no track selected"))?;
        let Some(sample) = self.movie.tracks[index].samples.get(self.cursor).copied() else {
            return Ok(None);
        };
        self.cursor += 1;

        buf.clear();
        buf.resize(sample.size as usize, 0);
        self.inner.seek(SeekFrom::Start(sample.offset))?;
        self.inner.read_exact(buf)?;

        Ok(Some(SampleMeta {
            decode_time: sample.decode_time,
            composition_offset: sample.composition_offset,
            duration: sample.duration,
            is_sync: sample.is_sync,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::test_support::{SyntheticTrack, build_fragmented_mp4, build_progressive_mp4};

    #[test]
    fn test_reads_fragmented_file() {
        let track = SyntheticTrack::video(7);
        let file = build_fragmented_mp4(&track, &[3, 4]);
        let mut reader = Mp4Reader::open(Cursor::new(file)).unwrap();
        assert!(reader.is_fragmented());

        let index = reader.find_track(MediaKind::Video).unwrap();
        reader.select_track(index).unwrap();
        assert_eq!(reader.timescale(), 90_000);

        let mut buf = Vec::new();
        for i in 0..7 {
            let meta = reader.read_sample(&mut buf).unwrap().unwrap();
            let (expected_data, expected_meta) = track.sample(i);
            assert_eq!(buf, expected_data);
            assert_eq!(meta, expected_meta);
        }
        assert!(reader.read_sample(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_fragmented_edit_list_restores_timestamps() {
        let reordered = SyntheticTrack::video(9).with_b_frames().starting_at(-3000);
        let delayed = SyntheticTrack::audio(4).starting_at(4800);

        for track in [reordered, delayed] {
            let file = build_fragmented_mp4(&track, &[5, 4]);
            let mut reader = Mp4Reader::open(Cursor::new(file)).unwrap();
            reader.select_track(0).unwrap();
            let mut buf = Vec::new();
            for i in 0..track.count {
                let meta = reader.read_sample(&mut buf).unwrap().unwrap();
                assert_eq!(meta, track.sample(i).1, "sample {i}");
            }
        }

        let (_, first) = reordered.sample(0);
        assert_eq!(first.presentation_time(), 0);
    }

    #[test]
    fn test_select_track_rewinds() {
        let file = build_progressive_mp4(&[SyntheticTrack::audio(2)]);
        let mut reader = Mp4Reader::open(Cursor::new(file)).unwrap();
        assert_eq!(reader.find_track(MediaKind::Video), None);

        let mut buf = Vec::new();
        assert!(matches!(
            reader.read_sample(&mut buf),
            Err(Mp4Error::InvalidState(_))
        ));

        reader.select_track(0).unwrap();
        reader.read_sample(&mut buf).unwrap().unwrap();
        reader.select_track(0).unwrap();
        let meta = reader.read_sample(&mut buf).unwrap().unwrap();
        assert_eq!(meta.decode_time, 0);
        assert!(matches!(reader.select_track(3), Err(Mp4Error::NoSuchTrack(3))));
    }

    #[test]
    fn test_rejects_non_isobmff() {
        let data = b"\x1A\x45\xDF\xA3 this is matroska".to_vec();
        assert!(matches!(
            Mp4Reader::open(Cursor::new(data)),
            Err(Mp4Error::NotIsobmff(_))
        ));
    }

    #[test]
    fn test_oversized_top_level_box_stops_the_walk() {
        let mut file = build_progressive_mp4(&[SyntheticTrack::audio(3)]);
        file.extend_from_slice(&1u32.to_be_bytes());
        file.extend_from_slice(b"free");
        file.extend_from_slice(&(u64::MAX - 4).to_be_bytes());

        let mut reader = Mp4Reader::open(Cursor::new(file)).unwrap();
        reader.select_track(0).unwrap();
        let mut buf = Vec::new();
        assert!(reader.read_sample(&mut buf).unwrap().is_some());
    }

    #[test]
    fn test_missing_moov() {
        let data = crate::test_support::make_box(b"ftyp", b"isom\0\0\0\0");
        assert!(matches!(
            Mp4Reader::open(Cursor::new(data)),
            Err(Mp4Error::MissingBox("moov"))
        ));
    }
}
