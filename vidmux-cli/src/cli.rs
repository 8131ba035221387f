use std::path::PathBuf;

use clap::Parser;
use vidmux_engine::ProxyType;
use vidmux_engine::config::{DEFAULT_SMALL_FILE_THRESHOLD, DEFAULT_WORKER_COUNT};

/// Download a video (or just its audio) from a page supported by yt-dlp.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Page URL
    pub url: String,

    /// Format id to download (see --list). Defaults to the best video.
    #[arg(short, long)]
    pub format: Option<String>,

    /// Download the best audio-only stream instead of video
    #[arg(short, long, conflicts_with = "format")]
    pub audio: bool,

    /// Print the available formats and exit
    #[arg(short, long)]
    pub list: bool,

    /// Prefer WebM over MP4 when building the format list
    #[arg(long)]
    pub webm: bool,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Concurrent range requests per file
    #[arg(short, long, default_value_t = DEFAULT_WORKER_COUNT)]
    pub workers: usize,

    /// Files smaller than this many bytes are fetched in one request
    #[arg(long, default_value_t = DEFAULT_SMALL_FILE_THRESHOLD)]
    pub small_file_threshold: u64,

    /// Proxy URL (http://, https:// or socks5://)
    #[arg(long)]
    pub proxy: Option<String>,

    /// Proxy type, inferred from the URL scheme when omitted
    #[arg(long, value_enum, requires = "proxy")]
    pub proxy_type: Option<ProxyType>,

    #[arg(long, requires = "proxy")]
    pub proxy_user: Option<String>,

    #[arg(long, requires = "proxy_user")]
    pub proxy_pass: Option<String>,

    /// Ignore the system proxy settings
    #[arg(long, conflicts_with = "proxy")]
    pub no_system_proxy: bool,

    /// Path of the yt-dlp executable
    #[arg(long, default_value = "yt-dlp")]
    pub yt_dlp: PathBuf,

    /// Read the format list from a `yt-dlp -J` JSON file instead of running yt-dlp
    #[arg(long)]
    pub metadata: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}
