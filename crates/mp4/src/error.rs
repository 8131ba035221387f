use thiserror::Error;

#[derive(Debug, Error)]
pub enum Mp4Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an ISOBMFF file: {0}")]
    NotIsobmff(String),

    #[error("missing required `{0}` box")]
    MissingBox(&'static str),

    #[error("malformed `{fourcc}` box: {reason}")]
    Malformed { fourcc: &'static str, reason: String },

    #[error("track index {0} does not exist")]
    NoSuchTrack(usize),

    #[error("invalid writer state: {0}")]
    InvalidState(&'static str),
}

impl Mp4Error {
    pub(crate) fn malformed(fourcc: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            fourcc,
            reason: reason.into(),
        }
    }
}
