//! ISOBMFF (MP4) sample reading and progressive writing.
//!
//! [`Mp4Reader`] indexes progressive and fragmented files and yields the samples of one
//! selected track. [`Mp4Writer`] lays samples out in a single `mdat` followed by `moov`.
//! Sample payloads are copied untouched; no codec bitstream is parsed.

mod box_utils;
pub mod error;
mod fragment;
pub mod isobmff;
pub mod reader;
mod sample_table;
pub mod writer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use error::Mp4Error;
pub use isobmff::{Movie, Mp4Track, SampleEntry};
pub use reader::Mp4Reader;
pub use writer::{Mp4Writer, TrackConfig};
