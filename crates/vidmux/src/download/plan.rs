use std::fmt;

/// Inclusive byte range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

#[allow(clippy::len_without_is_empty)]
impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value of the `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Partition of a known length into contiguous ranges, one per worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    ranges: Vec<ByteRange>,
}

impl ChunkPlan {
    /// Split `total` bytes into `workers` ranges; the last one absorbs the remainder.
    ///
    /// The worker count is clamped to `[1, total]` so no range is empty. A zero
    /// length yields an empty plan.
    pub fn new(total: u64, workers: usize) -> Self {
        if total == 0 {
            return Self { ranges: Vec::new() };
        }
        let count = (workers.max(1) as u64).min(total);
        let base = total / count;
        let ranges = (0..count)
            .map(|i| {
                let start = i * base;
                let end = if i + 1 == count {
                    total - 1
                } else {
                    start + base - 1
                };
                ByteRange { start, end }
            })
            .collect();
        Self { ranges }
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }
}

/// Parse the complete length out of a `Content-Range` value such as `bytes 0-0/1234`.
///
/// `None` for an unknown (`*`) or malformed length.
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}
