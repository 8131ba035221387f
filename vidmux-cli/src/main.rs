mod cli;
mod error;
mod output;
mod progress;
mod source;

use std::process;
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};
use vidmux_engine::{
    Catalog, CatalogOptions, ContainerFamily, DownloadOrchestrator, DownloadRequest,
    DownloaderConfig, EngineConfig, EngineContext, ProxyConfig, StreamDescriptor, StreamSource,
    build_catalog,
};

use crate::cli::Args;
use crate::error::{AppError, Result};
use crate::source::{MetadataFileSource, YtDlpSource};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = init_logging(args.verbose, args.quiet) {
        eprintln!("Error: {e}");
        process::exit(1);
    }

    let token = CancellationToken::new();
    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            ctrl_c.cancel();
        }
    });

    match run(args, token).await {
        Ok(()) => {}
        Err(AppError::Cancelled) => {
            eprintln!("Cancelled");
            process::exit(130);
        }
        Err(e) => {
            error!("Application error: {}", e);
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

async fn run(args: Args, token: CancellationToken) -> Result<()> {
    let config = engine_config(&args);
    let ctx = EngineContext::init(config)?;

    let source: Arc<dyn StreamSource> = match &args.metadata {
        Some(path) => Arc::new(MetadataFileSource::new(path)),
        None => Arc::new(YtDlpSource::new(&args.yt_dlp)),
    };

    info!(url = %args.url, "Fetching format list");
    let listing = tokio::select! {
        _ = token.cancelled() => return Err(AppError::Cancelled),
        listing = source.fetch_streams(&args.url) => listing?,
    };
    let options = CatalogOptions {
        preferred_family: ctx.config().preferred_family,
    };
    let catalog = build_catalog(&listing.streams, listing.duration_secs, &options);
    debug!(
        video = catalog.video.len(),
        audio = catalog.audio.len(),
        "Catalog built"
    );

    if args.list {
        print!("{}", output::render_catalog(&listing.title, &catalog));
        return Ok(());
    }

    let stream = select_stream(&catalog, args.format.as_deref(), args.audio)?;
    info!(id = %stream.id, quality = %stream.label, size = %stream.size_label, "Selected format");

    let orchestrator = DownloadOrchestrator::new(ctx, source);
    let request = DownloadRequest {
        page_url: args.url.clone(),
        title: listing.title,
        stream: stream.clone(),
    };
    let handle = orchestrator.acquire_with_token(request, token.clone());

    match progress::follow(&stream.label, handle).await {
        Ok(path) => {
            println!("{}", path.display());
            Ok(())
        }
        Err(_) if token.is_cancelled() => Err(AppError::Cancelled),
        Err(e) => Err(e),
    }
}

fn engine_config(args: &Args) -> EngineConfig {
    let proxy = args.proxy.as_ref().map(|url| {
        let mut proxy = ProxyConfig::from_url(url);
        if let Some(proxy_type) = args.proxy_type {
            proxy.proxy_type = proxy_type;
        }
        match (&args.proxy_user, &args.proxy_pass) {
            (Some(user), pass) => proxy.with_auth(user, pass.clone().unwrap_or_default()),
            _ => proxy,
        }
    });
    let downloader = DownloaderConfig {
        use_system_proxy: !args.no_system_proxy,
        ..DownloaderConfig::default()
    }
    .with_proxy(proxy);

    let family = if args.webm {
        ContainerFamily::WebM
    } else {
        ContainerFamily::Mp4
    };

    EngineConfig::new(&args.output_dir)
        .with_worker_count(args.workers)
        .with_small_file_threshold(args.small_file_threshold)
        .with_preferred_family(family)
        .with_downloader(downloader)
}

/// `--format` wins, then `--audio`, otherwise the best video.
fn select_stream<'a>(
    catalog: &'a Catalog,
    format: Option<&str>,
    audio: bool,
) -> Result<&'a StreamDescriptor> {
    if let Some(id) = format {
        return catalog
            .find(id)
            .ok_or_else(|| AppError::InvalidInput(format!("format `{id}` is not available")));
    }
    let best = if audio {
        catalog.audio.first()
    } else {
        catalog.video.first()
    };
    best.ok_or_else(|| {
        AppError::InvalidInput(format!(
            "no {} formats available",
            if audio { "audio" } else { "video" }
        ))
    })
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_level(verbose)
                .with_writer(indicatif_layer.get_stderr_writer()),
        )
        .with(indicatif_layer)
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))
}
