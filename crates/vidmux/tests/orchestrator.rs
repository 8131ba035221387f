mod common;

use std::sync::Arc;
use std::time::Duration;

use media_types::{ContainerFamily, MediaKind};
use mp4::Mp4Reader;
use mp4::test_support::{SyntheticTrack, build_progressive_mp4};
use vidmux_engine::events::{PHASE_AUDIO, PHASE_DOWNLOADING, PHASE_MERGING, PHASE_VIDEO};
use vidmux_engine::naming::is_temp_file;
use vidmux_engine::{
    CatalogOptions, DownloadOrchestrator, DownloadRequest, EngineContext, ProgressEvent,
    StreamDescriptor, StreamListing, build_catalog,
};
use webm::test_support::{SyntheticStream, build_webm};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

use common::{
    PendingSource, RangeResponder, StaticSource, assert_monotonic, drain, payload, raw_audio,
    raw_video, test_config,
};

const PAGE: &str = "https://video.example/watch?v=abc";

struct Fixture {
    server: MockServer,
    listing: StreamListing,
}

impl Fixture {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let files = [
            ("/137", build_progressive_mp4(&[SyntheticTrack::video(30)])),
            ("/140", build_progressive_mp4(&[SyntheticTrack::audio(40)])),
            ("/139", build_progressive_mp4(&[SyntheticTrack::audio(8)])),
            ("/18", payload(3_000)),
            ("/broken", payload(2_000)),
            ("/248", build_webm(&[SyntheticStream::vp9(12)])),
            ("/251", build_webm(&[SyntheticStream::opus(25)])),
        ];
        for (route, body) in files {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(RangeResponder::new(body))
                .mount(&server)
                .await;
        }

        let uri = server.uri();
        let mut combined = raw_video("18", "mp4", 360, format!("{uri}/18"));
        combined.has_audio = true;
        let listing = StreamListing {
            title: "Sample Clip".into(),
            duration_secs: Some(12.0),
            streams: vec![
                raw_video("137", "mp4", 1080, format!("{uri}/137")),
                raw_video("136", "mp4", 720, format!("{uri}/broken")),
                raw_audio("140", "m4a", 129.5, format!("{uri}/140")),
                raw_audio("139", "m4a", 48.0, format!("{uri}/139")),
                combined,
                raw_video("248", "webm", 1080, format!("{uri}/248")),
                raw_audio("251", "webm", 160.0, format!("{uri}/251")),
            ],
        };
        Self { server, listing }
    }

    fn stream(&self, id: &str) -> StreamDescriptor {
        build_catalog(&self.listing.streams, None, &CatalogOptions::default())
            .find(id)
            .cloned()
            .unwrap()
    }

    fn request(&self, id: &str) -> DownloadRequest {
        DownloadRequest {
            page_url: PAGE.into(),
            title: self.listing.title.clone(),
            stream: self.stream(id),
        }
    }
}

fn leftover_temps(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|p| is_temp_file(p))
        .collect()
}

#[tokio::test]
async fn test_split_streams_are_downloaded_and_muxed() {
    let fixture = Fixture::new().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::init(test_config(dir.path())).unwrap();
    let source = StaticSource::new(fixture.listing.clone());
    let orchestrator = DownloadOrchestrator::new(ctx, source.clone());

    let (percents, messages, terminal) = drain(orchestrator.acquire(fixture.request("137"))).await;

    let expected = dir.path().join("Sample Clip_1080p.mp4");
    assert_eq!(terminal, Some(ProgressEvent::Success { path: expected.clone() }));
    assert_monotonic(&percents);
    assert_eq!(percents.last(), Some(&100.0));
    assert!(percents.contains(&70.0) && percents.contains(&95.0));
    for phase in [PHASE_VIDEO, PHASE_AUDIO, PHASE_MERGING] {
        assert!(messages.iter().any(|m| m == phase), "{phase} never reported");
    }
    assert_eq!(source.calls(), 1);

    let mut reader = Mp4Reader::open_path(&expected).unwrap();
    let video = reader.find_track(MediaKind::Video).unwrap();
    let audio = reader.find_track(MediaKind::Audio).unwrap();
    assert_eq!(reader.tracks()[video].sample_count(), 30);
    // Highest bitrate m4a, not the 48 kbps one.
    assert_eq!(reader.tracks()[audio].sample_count(), 40);

    assert!(leftover_temps(dir.path()).is_empty());
    let requested: Vec<String> = fixture
        .server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert!(!requested.iter().any(|p| p == "/139"));
}

#[tokio::test]
async fn test_webm_split_streams() {
    let fixture = Fixture::new().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path()).with_preferred_family(ContainerFamily::WebM);
    let ctx = EngineContext::init(config).unwrap();
    let orchestrator =
        DownloadOrchestrator::new(ctx, StaticSource::new(fixture.listing.clone()));

    let (_, _, terminal) = drain(orchestrator.acquire(fixture.request("248"))).await;

    let expected = dir.path().join("Sample Clip_1080p.webm");
    assert_eq!(terminal, Some(ProgressEvent::Success { path: expected.clone() }));
    let reader = webm::WebmReader::open_path(&expected).unwrap();
    assert!(reader.find_track(MediaKind::Video).is_some());
    assert!(reader.find_track(MediaKind::Audio).is_some());
    assert!(leftover_temps(dir.path()).is_empty());
}

#[tokio::test]
async fn test_existing_file_short_circuits() {
    let fixture = Fixture::new().await;
    let dir = tempfile::tempdir().unwrap();
    let existing = dir.path().join("Sample Clip_1080p.mp4");
    std::fs::write(&existing, b"already here").unwrap();

    let ctx = EngineContext::init(test_config(dir.path())).unwrap();
    let source = StaticSource::new(fixture.listing.clone());
    let orchestrator = DownloadOrchestrator::new(ctx, source.clone());

    let (percents, messages, terminal) = drain(orchestrator.acquire(fixture.request("137"))).await;

    assert_eq!(percents, vec![100.0]);
    assert_eq!(messages, vec![PHASE_DOWNLOADING.to_string()]);
    assert_eq!(terminal, Some(ProgressEvent::Success { path: existing.clone() }));
    assert_eq!(source.calls(), 0);
    assert_eq!(std::fs::read(&existing).unwrap(), b"already here");
    assert!(fixture.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expired_stream_is_reported() {
    let fixture = Fixture::new().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::init(test_config(dir.path())).unwrap();
    let mut listing = fixture.listing.clone();
    listing.streams.retain(|s| s.id != "137");
    let orchestrator = DownloadOrchestrator::new(ctx, StaticSource::new(listing));

    let (_, _, terminal) = drain(orchestrator.acquire(fixture.request("137"))).await;

    match terminal {
        Some(ProgressEvent::Error { message }) => {
            assert!(message.contains("137"), "{message}");
            assert!(message.contains("no longer offered"), "{message}");
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(!dir.path().join("Sample Clip_1080p.mp4").exists());
}

#[tokio::test]
async fn test_combined_stream_is_downloaded_directly() {
    let fixture = Fixture::new().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::init(test_config(dir.path())).unwrap();
    let orchestrator =
        DownloadOrchestrator::new(ctx, StaticSource::new(fixture.listing.clone()));

    let (percents, messages, terminal) = drain(orchestrator.acquire(fixture.request("18"))).await;

    let expected = dir.path().join("Sample Clip_360p.mp4");
    assert_eq!(terminal, Some(ProgressEvent::Success { path: expected.clone() }));
    assert_eq!(std::fs::read(&expected).unwrap(), payload(3_000));
    assert_monotonic(&percents);
    assert!(messages.iter().all(|m| m == PHASE_DOWNLOADING));
}

#[tokio::test]
async fn test_audio_only_stream_is_downloaded_directly() {
    let fixture = Fixture::new().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::init(test_config(dir.path())).unwrap();
    let orchestrator =
        DownloadOrchestrator::new(ctx, StaticSource::new(fixture.listing.clone()));

    let (_, _, terminal) = drain(orchestrator.acquire(fixture.request("140"))).await;

    let expected = dir.path().join("Sample Clip.m4a");
    assert_eq!(terminal, Some(ProgressEvent::Success { path: expected.clone() }));
    assert_eq!(
        std::fs::read(&expected).unwrap(),
        build_progressive_mp4(&[SyntheticTrack::audio(40)])
    );
}

#[tokio::test]
async fn test_mux_failure_cleans_up() {
    let fixture = Fixture::new().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::init(test_config(dir.path())).unwrap();
    let orchestrator =
        DownloadOrchestrator::new(ctx, StaticSource::new(fixture.listing.clone()));

    let (_, _, terminal) = drain(orchestrator.acquire(fixture.request("136"))).await;

    match terminal {
        Some(ProgressEvent::Error { message }) => {
            assert!(message.starts_with("Merging failed:"), "{message}");
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(!dir.path().join("Sample Clip_720p.mp4").exists());
    assert!(leftover_temps(dir.path()).is_empty());
}

#[tokio::test]
async fn test_audio_failure_after_video_cleans_up() {
    let fixture = Fixture::new().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::init(test_config(dir.path())).unwrap();
    let mut listing = fixture.listing.clone();
    for stream in &mut listing.streams {
        if stream.id == "140" {
            stream.url = format!("{}/gone", fixture.server.uri());
        }
    }
    let orchestrator = DownloadOrchestrator::new(ctx, StaticSource::new(listing));

    let (percents, messages, terminal) = drain(orchestrator.acquire(fixture.request("137"))).await;

    match terminal {
        Some(ProgressEvent::Error { message }) => {
            assert!(message.starts_with("Downloading Audio Track failed"), "{message}");
            assert!(message.contains("404"), "{message}");
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(messages.iter().any(|m| m == PHASE_VIDEO));
    assert!(!messages.iter().any(|m| m == PHASE_MERGING));
    assert_monotonic(&percents);
    assert!(!dir.path().join("Sample Clip_1080p.mp4").exists());
    assert!(leftover_temps(dir.path()).is_empty());

    let requested: Vec<String> = fixture
        .server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .collect();
    assert!(requested.iter().any(|p| p == "/137"));
    assert!(requested.iter().any(|p| p == "/gone"));
}

#[tokio::test]
async fn test_cancel_while_resolving() {
    let fixture = Fixture::new().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::init(test_config(dir.path())).unwrap();
    let orchestrator = DownloadOrchestrator::new(ctx, Arc::new(PendingSource));

    let handle = orchestrator.acquire(fixture.request("137"));
    let token = handle.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });

    let (_, _, terminal) = tokio::time::timeout(Duration::from_secs(5), drain(handle))
        .await
        .expect("cancellation should end the stream");
    assert_eq!(
        terminal,
        Some(ProgressEvent::Error {
            message: "Download cancelled".to_string()
        })
    );
}

#[tokio::test]
async fn test_dropping_handle_cancels() {
    let fixture = Fixture::new().await;
    let dir = tempfile::tempdir().unwrap();
    let ctx = EngineContext::init(test_config(dir.path())).unwrap();
    let orchestrator = DownloadOrchestrator::new(ctx, Arc::new(PendingSource));

    let handle = orchestrator.acquire(fixture.request("137"));
    let token = handle.cancellation_token();
    assert!(!token.is_cancelled());
    drop(handle);
    assert!(token.is_cancelled());
}
