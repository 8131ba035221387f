//! Shared media domain types used by the container crates and the engine.

mod container;
mod sample;

pub use container::{ContainerFamily, MediaKind};
pub use sample::{SampleMeta, SampleSink, SampleSource, rescale};

/// Video resolution information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    #[inline]
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Short quality label, e.g. `1080p`.
    pub fn label(&self) -> String {
        format!("{}p", self.height)
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
