use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an EBML document")]
    NotEbml,

    #[error("unsupported document type: {0}")]
    UnsupportedDocType(String),

    #[error("invalid element 0x{id:X}: {reason}")]
    InvalidElement { id: u32, reason: String },

    #[error("invalid variable-length integer")]
    InvalidVint,

    #[error("missing required element: {0}")]
    MissingElement(&'static str),

    #[error("unsupported feature: {0}")]
    Unsupported(&'static str),

    #[error("track index {0} does not exist")]
    NoSuchTrack(usize),

    #[error("invalid writer state: {0}")]
    InvalidState(&'static str),
}

impl WebmError {
    pub(crate) fn invalid(id: u32, reason: impl Into<String>) -> Self {
        Self::InvalidElement {
            id,
            reason: reason.into(),
        }
    }
}
