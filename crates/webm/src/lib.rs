//! WebM block reading and writing for stream copy remuxing.
//!
//! [`WebmReader`] walks the clusters of a WebM (or Matroska) file and yields the blocks
//! of one selected track. [`WebmWriter`] writes a seekable WebM file with `Cues`.
//! Block payloads are copied untouched.

pub mod ebml;
pub mod error;
pub mod reader;
pub mod track;
pub mod writer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use error::WebmError;
pub use reader::WebmReader;
pub use track::{AudioSettings, VideoSettings, WebmTrack};
pub use writer::{WebmTrackConfig, WebmWriter};
