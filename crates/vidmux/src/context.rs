use std::sync::Arc;

use reqwest::Client;
use tracing::info;

use crate::DownloadError;
use crate::client::create_client;
use crate::config::EngineConfig;
use crate::download::ChunkedDownloader;

/// Shared engine state: validated configuration plus the HTTP client.
///
/// Built once with [`EngineContext::init`] and passed around as `Arc<EngineContext>`.
#[derive(Debug)]
pub struct EngineContext {
    config: EngineConfig,
    client: Client,
}

impl EngineContext {
    /// Validate `config`, create the output directory and build the HTTP client.
    pub fn init(config: EngineConfig) -> Result<Arc<Self>, DownloadError> {
        config.validate()?;
        std::fs::create_dir_all(&config.output_dir)?;
        let client = create_client(&config.downloader)?;
        info!(
            output_dir = %config.output_dir.display(),
            workers = config.worker_count,
            "Engine initialized"
        );
        Ok(Arc::new(Self { config, client }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// A downloader sharing this context's client and settings.
    pub fn downloader(&self) -> ChunkedDownloader {
        ChunkedDownloader::new(self.client.clone(), &self.config)
    }
}
