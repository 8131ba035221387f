use std::path::PathBuf;
use std::time::Duration;

use media_types::ContainerFamily;
use reqwest::header::{HeaderMap, HeaderValue};

use crate::download::retry::RetryPolicy;
use crate::proxy::ProxyConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Ranges fetched concurrently in parallel mode.
pub const DEFAULT_WORKER_COUNT: usize = 4;
/// Files below this size are fetched in a single streamed request.
pub const DEFAULT_SMALL_FILE_THRESHOLD: u64 = 1024 * 1024;
/// Parallel mode reports progress at most once per this many bytes.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 512 * 1024;
/// Single-pass mode reports progress every this many percentage points.
pub const DEFAULT_PROGRESS_STEP: f32 = 2.0;

/// HTTP version preference for connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HttpVersionPreference {
    /// Let ALPN negotiate the best version (default)
    #[default]
    Auto,
    /// Force HTTP/1.1 only (disable HTTP/2)
    Http1Only,
}

/// Options for the shared HTTP client
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Overall timeout for the entire HTTP request. Zero disables it.
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    pub follow_redirects: bool,

    pub user_agent: String,

    /// Headers sent with every request, merged over [`Self::get_default_headers`]
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool,

    pub http_version: HttpVersionPreference,

    // --- Connection Pool Configuration ---
    /// Maximum idle connections to keep per host. Parallel range fetches hit the same
    /// host, so this should be at least the worker count.
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(0),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: DownloaderConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            http_version: HttpVersionPreference::Auto,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    /// Merge custom headers over the defaults; custom values win for the same name.
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_proxy(mut self, proxy: Option<ProxyConfig>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        // Byte ranges must address the stored representation.
        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("identity"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5"),
        );
        default_headers
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory receiving final and temporary files.
    pub output_dir: PathBuf,
    pub worker_count: usize,
    pub small_file_threshold: u64,
    pub retry: RetryPolicy,
    /// Percentage points between single-pass progress events.
    pub progress_step: f32,
    /// Bytes between parallel-mode progress events.
    pub progress_interval: u64,
    /// Container family kept in the catalog for each media kind.
    pub preferred_family: ContainerFamily,
    /// Initial capacity of the sample buffer reused while muxing.
    pub mux_buffer_size: usize,
    pub downloader: DownloaderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            worker_count: DEFAULT_WORKER_COUNT,
            small_file_threshold: DEFAULT_SMALL_FILE_THRESHOLD,
            retry: RetryPolicy::default(),
            progress_step: DEFAULT_PROGRESS_STEP,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            preferred_family: ContainerFamily::Mp4,
            mux_buffer_size: 256 * 1024,
            downloader: DownloaderConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_small_file_threshold(mut self, threshold: u64) -> Self {
        self.small_file_threshold = threshold;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_preferred_family(mut self, family: ContainerFamily) -> Self {
        self.preferred_family = family;
        self
    }

    pub fn with_downloader(mut self, downloader: DownloaderConfig) -> Self {
        self.downloader = downloader;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), crate::DownloadError> {
        if self.worker_count == 0 {
            return Err(crate::DownloadError::configuration(
                "worker count must be at least 1",
            ));
        }
        if self.progress_interval == 0 {
            return Err(crate::DownloadError::configuration(
                "progress interval must be positive",
            ));
        }
        if !(self.progress_step > 0.0 && self.progress_step <= 100.0) {
            return Err(crate::DownloadError::configuration(format!(
                "progress step {} is outside (0, 100]",
                self.progress_step
            )));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(crate::DownloadError::configuration(
                "output directory is empty",
            ));
        }
        Ok(())
    }
}
