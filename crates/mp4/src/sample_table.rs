//! Progressive sample index (`stbl`) expansion.

use bytes::Bytes;

use crate::box_utils::{BoxView, be_i32, be_u16, be_u32, be_u64, find_first_box};
use crate::error::Mp4Error;
use crate::isobmff::SampleEntry;

fn payload<'a>(data: &'a Bytes, stbl: &BoxView, fourcc: [u8; 4]) -> Option<&'a [u8]> {
    let parsed = find_first_box(data, stbl.body_start, stbl.body_end, fourcc)?;
    Some(&data[parsed.body_start..parsed.body_end])
}

/// Read `count` fixed-size entries that follow a FullBox header and a 32-bit entry count.
fn entries<T>(
    body: &[u8],
    name: &'static str,
    entry_size: usize,
    mut parse: impl FnMut(&[u8]) -> T,
) -> Result<Vec<T>, Mp4Error> {
    let count = be_u32(body, 4).ok_or_else(|| Mp4Error::malformed(name, "short"))? as usize;
    let table = &body[8..];
    if table.len() < count.saturating_mul(entry_size) {
        return Err(Mp4Error::malformed(
            name,
            format!("{count} entries do not fit in {} bytes", table.len()),
        ));
    }
    Ok(table
        .chunks_exact(entry_size)
        .take(count)
        .map(&mut parse)
        .collect())
}

fn sample_sizes(data: &Bytes, stbl: &BoxView) -> Result<Vec<u32>, Mp4Error> {
    if let Some(body) = payload(data, stbl, *b"stsz") {
        let fixed = be_u32(body, 4).ok_or_else(|| Mp4Error::malformed("stsz", "short"))?;
        let count = be_u32(body, 8).ok_or_else(|| Mp4Error::malformed("stsz", "short"))? as usize;
        if fixed != 0 {
            return Ok(vec![fixed; count]);
        }
        let table = &body[12..];
        if table.len() < count.saturating_mul(4) {
            return Err(Mp4Error::malformed("stsz", "truncated size table"));
        }
        return Ok(table
            .chunks_exact(4)
            .take(count)
            .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect());
    }

    let body = payload(data, stbl, *b"stz2").ok_or(Mp4Error::MissingBox("stsz"))?;
    let field_size = *body.get(7).ok_or_else(|| Mp4Error::malformed("stz2", "short"))?;
    let count = be_u32(body, 8).ok_or_else(|| Mp4Error::malformed("stz2", "short"))? as usize;
    let table = &body[12..];
    let mut sizes = Vec::with_capacity(count);
    for i in 0..count {
        let size = match field_size {
            4 => table.get(i / 2).map(|b| {
                if i % 2 == 0 {
                    u32::from(b >> 4)
                } else {
                    u32::from(b & 0x0F)
                }
            }),
            8 => table.get(i).map(|b| u32::from(*b)),
            16 => be_u16(table, i * 2).map(u32::from),
            _ => return Err(Mp4Error::malformed("stz2", format!("field size {field_size}"))),
        };
        sizes.push(size.ok_or_else(|| Mp4Error::malformed("stz2", "truncated size table"))?);
    }
    Ok(sizes)
}

fn chunk_offsets(data: &Bytes, stbl: &BoxView) -> Result<Vec<u64>, Mp4Error> {
    if let Some(body) = payload(data, stbl, *b"stco") {
        return entries(body, "stco", 4, |e| {
            u64::from(u32::from_be_bytes([e[0], e[1], e[2], e[3]]))
        });
    }
    if let Some(body) = payload(data, stbl, *b"co64") {
        return entries(body, "co64", 8, |e| be_u64(e, 0).unwrap_or_default());
    }
    Err(Mp4Error::MissingBox("stco"))
}

/// Expand the run-length tables of a progressive `stbl` into per-sample entries.
pub(crate) fn parse_sample_table(
    data: &Bytes,
    stbl: &BoxView,
) -> Result<Vec<SampleEntry>, Mp4Error> {
    let sizes = sample_sizes(data, stbl)?;
    if sizes.is_empty() {
        return Ok(Vec::new());
    }

    let stts_body = payload(data, stbl, *b"stts").ok_or(Mp4Error::MissingBox("stts"))?;
    let stts = entries(stts_body, "stts", 8, |e| {
        (be_u32(e, 0).unwrap_or(0), be_u32(e, 4).unwrap_or(0))
    })?;

    let ctts = match payload(data, stbl, *b"ctts") {
        // Version 0 offsets are nominally unsigned; writers store negative ones anyway.
        Some(body) => entries(body, "ctts", 8, |e| {
            (be_u32(e, 0).unwrap_or(0), be_i32(e, 4).unwrap_or(0))
        })?,
        None => Vec::new(),
    };

    let sync: Option<Vec<u32>> = match payload(data, stbl, *b"stss") {
        Some(body) => Some(entries(body, "stss", 4, |e| be_u32(e, 0).unwrap_or(0))?),
        None => None,
    };

    let stsc_body = payload(data, stbl, *b"stsc").ok_or(Mp4Error::MissingBox("stsc"))?;
    let stsc = entries(stsc_body, "stsc", 12, |e| {
        (be_u32(e, 0).unwrap_or(0), be_u32(e, 4).unwrap_or(0))
    })?;
    let chunks = chunk_offsets(data, stbl)?;

    let mut samples = Vec::with_capacity(sizes.len());

    // Offsets: walk chunks, taking `samples_per_chunk` from the applicable stsc run.
    let mut sample_index = 0usize;
    'chunks: for (chunk_index, chunk_offset) in chunks.iter().enumerate() {
        let chunk_number = chunk_index as u32 + 1;
        let per_chunk = stsc
            .iter()
            .take_while(|(first_chunk, _)| *first_chunk <= chunk_number)
            .last()
            .map(|(_, per_chunk)| *per_chunk)
            .unwrap_or(0);

        let mut offset = *chunk_offset;
        for _ in 0..per_chunk {
            let Some(size) = sizes.get(sample_index) else {
                break 'chunks;
            };
            samples.push(SampleEntry {
                offset,
                size: *size,
                decode_time: 0,
                composition_offset: 0,
                duration: 0,
                is_sync: sync.is_none(),
            });
            offset += u64::from(*size);
            sample_index += 1;
        }
    }

    if samples.len() != sizes.len() {
        return Err(Mp4Error::malformed(
            "stsc",
            format!(
                "chunk map covers {} of {} samples",
                samples.len(),
                sizes.len()
            ),
        ));
    }

    let mut decode_time = 0i64;
    let mut deltas = stts
        .iter()
        .flat_map(|(count, delta)| std::iter::repeat_n(*delta, *count as usize));
    for sample in samples.iter_mut() {
        let delta = deltas.next().unwrap_or(0);
        sample.decode_time = decode_time;
        sample.duration = delta;
        decode_time += i64::from(delta);
    }

    let offsets = ctts
        .iter()
        .flat_map(|(count, offset)| std::iter::repeat_n(*offset, *count as usize));
    for (sample, offset) in samples.iter_mut().zip(offsets) {
        sample.composition_offset = offset;
    }

    if let Some(sync) = sync {
        for number in sync {
            if let Some(sample) = (number as usize)
                .checked_sub(1)
                .and_then(|i| samples.get_mut(i))
            {
                sample.is_sync = true;
            }
        }
    }

    Ok(samples)
}
