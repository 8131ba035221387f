use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download error: {0}")]
    Download(#[from] vidmux_engine::DownloadError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    /// The download ended with an error event.
    #[error("{0}")]
    Failed(String),

    #[error("Interrupted")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, AppError>;
