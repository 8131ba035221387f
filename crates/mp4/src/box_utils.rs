use bytes::Bytes;

/// Parsed view over a single ISOBMFF box inside a parent byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoxView {
    pub(crate) start: usize,
    pub(crate) end: usize,
    pub(crate) size: usize,
    pub(crate) header_size: usize,
    pub(crate) fourcc: [u8; 4],
    pub(crate) body_start: usize,
    pub(crate) body_end: usize,
}

/// Read a box header: returns `(total_box_size, fourcc, header_size)`.
///
/// Handles 32-bit size, 64-bit extended size (`size == 1`),
/// and box-extends-to-EOF (`size == 0`).
pub(crate) fn read_box_header(data: &[u8]) -> Option<(usize, [u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }

    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc: [u8; 4] = [data[4], data[5], data[6], data[7]];

    if size == 1 {
        if data.len() < 16 {
            return None;
        }
        let ext_size = u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        Some((usize::try_from(ext_size).ok()?, fourcc, 16))
    } else if size == 0 {
        Some((data.len(), fourcc, 8))
    } else {
        Some((size as usize, fourcc, 8))
    }
}

/// Parse a single box located at `offset` within `[0..end)`.
pub(crate) fn box_at(data: &Bytes, offset: usize, end: usize) -> Option<BoxView> {
    if offset >= end {
        return None;
    }

    let remaining = &data[offset..end];
    let (size, fourcc, header_size) = read_box_header(remaining)?;

    if size < header_size {
        return None;
    }
    let box_end = offset.checked_add(size).filter(|box_end| *box_end <= end)?;

    let body_start = offset + header_size;
    Some(BoxView {
        start: offset,
        end: box_end,
        size,
        header_size,
        fourcc,
        body_start,
        body_end: box_end,
    })
}

/// Iterate over the sibling boxes inside `[start..end)`, stopping at the first malformed one.
pub(crate) fn children(data: &Bytes, start: usize, end: usize) -> impl Iterator<Item = BoxView> {
    let mut offset = start;
    std::iter::from_fn(move || {
        let parsed = box_at(data, offset, end)?;
        offset = parsed.end;
        Some(parsed)
    })
}

/// Find the first child box with the given FourCC inside `[start..end)`.
pub(crate) fn find_first_box(
    data: &Bytes,
    start: usize,
    end: usize,
    target: [u8; 4],
) -> Option<BoxView> {
    children(data, start, end).find(|parsed| parsed.fourcc == target)
}

/// Find the first child box payload for the given FourCC inside `[start..end)`.
pub(crate) fn find_first_box_payload(
    data: &Bytes,
    start: usize,
    end: usize,
    target: [u8; 4],
) -> Option<Bytes> {
    let parsed = find_first_box(data, start, end, target)?;
    Some(data.slice(parsed.body_start..parsed.body_end))
}

/// Split a FullBox payload into `(version, flags)`.
pub(crate) fn full_box_header(body: &[u8]) -> Option<(u8, u32)> {
    if body.len() < 4 {
        return None;
    }
    let flags = ((body[1] as u32) << 16) | ((body[2] as u32) << 8) | body[3] as u32;
    Some((body[0], flags))
}

#[inline]
pub(crate) fn be_u16(body: &[u8], at: usize) -> Option<u16> {
    let bytes = body.get(at..at + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub(crate) fn be_u32(body: &[u8], at: usize) -> Option<u32> {
    let bytes = body.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub(crate) fn be_i32(body: &[u8], at: usize) -> Option<i32> {
    be_u32(body, at).map(|v| v as i32)
}

#[inline]
pub(crate) fn be_u64(body: &[u8], at: usize) -> Option<u64> {
    let bytes = body.get(at..at + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_be_bytes(raw))
}

/// Append a box to `out`, letting `body` write the payload. The size field is patched afterwards.
pub(crate) fn write_box(out: &mut Vec<u8>, fourcc: &[u8; 4], body: impl FnOnce(&mut Vec<u8>)) {
    let start = out.len();
    out.extend_from_slice(&0u32.to_be_bytes());
    out.extend_from_slice(fourcc);
    body(out);
    let size = (out.len() - start) as u32;
    out[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

/// Append a FullBox (version + 24-bit flags) to `out`.
pub(crate) fn write_full_box(
    out: &mut Vec<u8>,
    fourcc: &[u8; 4],
    version: u8,
    flags: u32,
    body: impl FnOnce(&mut Vec<u8>),
) {
    write_box(out, fourcc, |out| {
        out.push(version);
        out.extend_from_slice(&flags.to_be_bytes()[1..]);
        body(out);
    });
}
