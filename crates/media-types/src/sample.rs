/// Timing and flags of one encoded sample.
///
/// All values are expressed in the timescale (ticks per second) of the track the
/// sample belongs to; see [`SampleSource::timescale`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleMeta {
    /// Decode timestamp.
    pub decode_time: i64,
    /// Presentation minus decode time. Zero for codecs without reordering.
    pub composition_offset: i32,
    /// Sample duration, zero when the container does not record it.
    pub duration: u32,
    /// Sync sample (key frame) flag.
    pub is_sync: bool,
}

impl SampleMeta {
    /// Presentation timestamp.
    #[inline]
    pub fn presentation_time(&self) -> i64 {
        self.decode_time + i64::from(self.composition_offset)
    }
}

/// Convert `value` from one timescale to another, rounding toward negative infinity.
pub fn rescale(value: i64, from: u32, to: u32) -> i64 {
    if from == to || from == 0 {
        return value;
    }
    let scaled = i128::from(value) * i128::from(to);
    scaled.div_euclid(i128::from(from)) as i64
}

/// A demuxer positioned on one selected track.
pub trait SampleSource {
    type Error;

    /// Ticks per second of the timestamps returned by [`Self::read_sample`].
    fn timescale(&self) -> u32;

    /// Read the next sample of the selected track into `buf`, replacing its contents.
    ///
    /// Returns `Ok(None)` once the track is exhausted.
    fn read_sample(&mut self, buf: &mut Vec<u8>) -> Result<Option<SampleMeta>, Self::Error>;
}

/// A muxer accepting samples for tracks it registered earlier.
pub trait SampleSink {
    type Error;

    fn write_sample(
        &mut self,
        track: usize,
        data: &[u8],
        meta: &SampleMeta,
    ) -> Result<(), Self::Error>;
}
