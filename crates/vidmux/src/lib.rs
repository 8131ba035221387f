//! # vidmux engine
//!
//! Download-and-mux engine for online video pages. A [`StreamSource`] lists the
//! formats of a page, [`build_catalog`] turns them into ranked choices, the
//! [`ChunkedDownloader`] fetches a stream with concurrent byte ranges and the
//! [`DownloadOrchestrator`] ties it together, muxing separate video and audio
//! tracks into one file when needed.

pub mod catalog;
pub mod client;
pub mod config;
pub mod context;
pub mod download;
pub mod error;
pub mod events;
pub mod mux;
pub mod naming;
pub mod orchestrator;
pub mod proxy;
pub mod source;

// Export common types for ease of use
pub use catalog::{Catalog, CatalogOptions, RawStream, StreamDescriptor, build_catalog};
pub use config::{DownloaderConfig, EngineConfig, HttpVersionPreference};
pub use context::EngineContext;
pub use download::retry::RetryPolicy;
pub use download::{ChunkedDownloader, DownloadTask};
pub use error::{DownloadError, MuxError};
pub use events::{ProgressEvent, ProgressScale, ProgressSink};
pub use mux::{MuxJob, MuxStats, mux};
pub use orchestrator::{DownloadHandle, DownloadOrchestrator, DownloadRequest};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use source::{StreamListing, StreamSource};

pub use media_types::{ContainerFamily, MediaKind};
