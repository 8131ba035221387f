use std::path::Path;

use media_types::{ContainerFamily, MediaKind, SampleMeta, SampleSource};
use mp4::Mp4Reader;
use mp4::test_support::{SyntheticTrack, build_fragmented_mp4, build_progressive_mp4};
use tokio_util::sync::CancellationToken;
use vidmux_engine::{MuxError, MuxJob, mux};
use webm::WebmReader;
use webm::test_support::{SyntheticStream, build_webm};

fn read_all<S: SampleSource>(source: &mut S) -> Vec<(Vec<u8>, SampleMeta)>
where
    S::Error: std::fmt::Debug,
{
    let mut out = Vec::new();
    let mut buf = Vec::new();
    while let Some(meta) = source.read_sample(&mut buf).unwrap() {
        out.push((buf.clone(), meta));
    }
    out
}

fn mp4_samples(path: &Path, kind: MediaKind) -> Vec<(Vec<u8>, SampleMeta)> {
    let mut reader = Mp4Reader::open_path(path).unwrap();
    let index = reader.find_track(kind).unwrap();
    reader.select_track(index).unwrap();
    read_all(&mut reader)
}

fn webm_samples(path: &Path, kind: MediaKind) -> Vec<(Vec<u8>, SampleMeta)> {
    let mut reader = WebmReader::open_path(path).unwrap();
    let index = reader.find_track(kind).unwrap();
    reader.select_track(index).unwrap();
    read_all(&mut reader)
}

/// Payload, timing and sync flag of every sample match the source stream.
fn assert_same_samples(
    actual: &[(Vec<u8>, SampleMeta)],
    expected: impl Fn(usize) -> (Vec<u8>, SampleMeta),
    count: usize,
) {
    assert_eq!(actual.len(), count);
    for (i, (data, meta)) in actual.iter().enumerate() {
        let (expected_data, expected_meta) = expected(i);
        assert_eq!(data, &expected_data, "payload of sample {i}");
        assert_eq!(meta, &expected_meta, "timing of sample {i}");
    }
}

/// Like [`assert_same_samples`] for containers that only store presentation times.
fn assert_same_presentation(
    actual: &[(Vec<u8>, SampleMeta)],
    expected: impl Fn(usize) -> (Vec<u8>, SampleMeta),
    count: usize,
) {
    assert_eq!(actual.len(), count);
    for (i, (data, meta)) in actual.iter().enumerate() {
        let (expected_data, expected_meta) = expected(i);
        assert_eq!(data, &expected_data, "payload of sample {i}");
        assert_eq!(
            meta.presentation_time(),
            expected_meta.presentation_time(),
            "time of sample {i}"
        );
        assert_eq!(meta.is_sync, expected_meta.is_sync, "sync flag of sample {i}");
    }
}

#[tokio::test]
async fn test_mux_mp4_video_with_m4a_audio() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("video.mp4");
    let audio = dir.path().join("audio.m4a");
    let output = dir.path().join("merged.mp4");
    let video_track = SyntheticTrack::video(30);
    let audio_track = SyntheticTrack::audio(40);
    std::fs::write(&video, build_progressive_mp4(&[video_track])).unwrap();
    std::fs::write(&audio, build_progressive_mp4(&[audio_track])).unwrap();

    let stats = mux(MuxJob::new(&video, &audio, &output, ContainerFamily::Mp4))
        .await
        .unwrap();
    assert_eq!((stats.video_samples, stats.audio_samples), (30, 40));

    assert_same_samples(&mp4_samples(&output, MediaKind::Video), |i| video_track.sample(i), 30);
    assert_same_samples(&mp4_samples(&output, MediaKind::Audio), |i| audio_track.sample(i), 40);
}

#[tokio::test]
async fn test_mux_mp4_keeps_reordered_presentation_times() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("video.mp4");
    let audio = dir.path().join("audio.m4a");
    let output = dir.path().join("merged.mp4");
    // B-frames push decode times below zero so the first frame is shown at zero.
    let video_track = SyntheticTrack::video(24).with_b_frames().starting_at(-3000);
    let audio_track = SyntheticTrack::audio(30).starting_at(1024);
    std::fs::write(&video, build_progressive_mp4(&[video_track])).unwrap();
    std::fs::write(&audio, build_progressive_mp4(&[audio_track])).unwrap();

    let inputs = (
        mp4_samples(&video, MediaKind::Video),
        mp4_samples(&audio, MediaKind::Audio),
    );
    assert_eq!(inputs.0[0].1.decode_time, -3000);
    assert_eq!(inputs.0[0].1.presentation_time(), 0);

    mux(MuxJob::new(&video, &audio, &output, ContainerFamily::Mp4))
        .await
        .unwrap();

    let videos = mp4_samples(&output, MediaKind::Video);
    let audios = mp4_samples(&output, MediaKind::Audio);
    assert_same_samples(&videos, |i| video_track.sample(i), 24);
    assert_same_samples(&audios, |i| audio_track.sample(i), 30);
    for (merged, source) in videos.iter().zip(&inputs.0) {
        assert_eq!(merged.1.presentation_time(), source.1.presentation_time());
    }
    assert_eq!(audios[0].1.presentation_time(), 1024);
}

#[tokio::test]
async fn test_mux_fragmented_mp4_input() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("video.mp4");
    let audio = dir.path().join("audio.m4a");
    let output = dir.path().join("merged.mp4");
    let video_track = SyntheticTrack::video(15).with_b_frames().starting_at(-3000);
    let audio_track = SyntheticTrack::audio(20);
    std::fs::write(&video, build_fragmented_mp4(&video_track, &[5, 5, 5])).unwrap();
    std::fs::write(&audio, build_fragmented_mp4(&audio_track, &[10, 10])).unwrap();

    mux(MuxJob::new(&video, &audio, &output, ContainerFamily::Mp4))
        .await
        .unwrap();

    assert!(!Mp4Reader::open_path(&output).unwrap().is_fragmented());
    assert_same_samples(&mp4_samples(&output, MediaKind::Video), |i| video_track.sample(i), 15);
    assert_same_samples(&mp4_samples(&output, MediaKind::Audio), |i| audio_track.sample(i), 20);
}

#[tokio::test]
async fn test_mux_webm_video_with_webm_audio() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("video.webm");
    let audio = dir.path().join("audio.webm");
    let output = dir.path().join("merged.webm");
    let vp9 = SyntheticStream::vp9(20);
    let opus = SyntheticStream::opus(30);
    std::fs::write(&video, build_webm(std::slice::from_ref(&vp9))).unwrap();
    std::fs::write(&audio, build_webm(std::slice::from_ref(&opus))).unwrap();

    let stats = mux(MuxJob::new(&video, &audio, &output, ContainerFamily::WebM))
        .await
        .unwrap();
    assert_eq!((stats.video_samples, stats.audio_samples), (20, 30));

    assert_same_presentation(&webm_samples(&output, MediaKind::Video), |i| vp9.sample(i), 20);
    assert_same_presentation(&webm_samples(&output, MediaKind::Audio), |i| opus.sample(i), 30);
}

#[tokio::test]
async fn test_mux_webm_keeps_offset_start() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("video.webm");
    let audio = dir.path().join("audio.webm");
    let output = dir.path().join("merged.webm");
    let vp9 = SyntheticStream::vp9(15).starting_at(120);
    let opus = SyntheticStream::opus(40).starting_at(7);
    std::fs::write(&video, build_webm(std::slice::from_ref(&vp9))).unwrap();
    std::fs::write(&audio, build_webm(std::slice::from_ref(&opus))).unwrap();

    mux(MuxJob::new(&video, &audio, &output, ContainerFamily::WebM))
        .await
        .unwrap();

    let videos = webm_samples(&output, MediaKind::Video);
    assert_eq!(videos[0].1.presentation_time(), 120);
    assert_same_presentation(&videos, |i| vp9.sample(i), 15);
    assert_same_presentation(&webm_samples(&output, MediaKind::Audio), |i| opus.sample(i), 40);
}

#[tokio::test]
async fn test_mixed_families_are_rejected_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("video.mp4");
    let audio = dir.path().join("audio.webm");
    let output = dir.path().join("merged.mp4");
    std::fs::write(&video, build_progressive_mp4(&[SyntheticTrack::video(5)])).unwrap();
    std::fs::write(&audio, build_webm(&[SyntheticStream::opus(5)])).unwrap();

    let result = mux(MuxJob::new(&video, &audio, &output, ContainerFamily::Mp4)).await;
    assert!(matches!(
        result,
        Err(MuxError::ContainerMismatch {
            video: ContainerFamily::Mp4,
            audio: ContainerFamily::WebM,
            ..
        })
    ));
    assert!(!output.exists());
}

#[tokio::test]
async fn test_missing_video_track() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("video.mp4");
    let audio = dir.path().join("audio.m4a");
    let output = dir.path().join("merged.mp4");
    std::fs::write(&video, build_progressive_mp4(&[SyntheticTrack::audio(5)])).unwrap();
    std::fs::write(&audio, build_progressive_mp4(&[SyntheticTrack::audio(5)])).unwrap();

    let result = mux(MuxJob::new(&video, &audio, &output, ContainerFamily::Mp4)).await;
    assert!(matches!(
        result,
        Err(MuxError::TrackNotFound {
            kind: MediaKind::Video,
            ..
        })
    ));
    assert!(!output.exists());
}

#[tokio::test]
async fn test_unrecognized_input_is_unsupported() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("video.mp4");
    let audio = dir.path().join("audio.m4a");
    std::fs::write(&video, b"definitely not a movie").unwrap();
    std::fs::write(&audio, build_progressive_mp4(&[SyntheticTrack::audio(5)])).unwrap();

    let result = mux(MuxJob::new(
        &video,
        &audio,
        dir.path().join("merged.mp4"),
        ContainerFamily::Mp4,
    ))
    .await;
    assert!(matches!(result, Err(MuxError::UnsupportedContainer { .. })));
}

#[tokio::test]
async fn test_cancelled_mux_removes_output() {
    let dir = tempfile::tempdir().unwrap();
    let video = dir.path().join("video.mp4");
    let audio = dir.path().join("audio.m4a");
    let output = dir.path().join("merged.mp4");
    std::fs::write(&video, build_progressive_mp4(&[SyntheticTrack::video(10)])).unwrap();
    std::fs::write(&audio, build_progressive_mp4(&[SyntheticTrack::audio(10)])).unwrap();

    let token = CancellationToken::new();
    token.cancel();
    let job = MuxJob::new(&video, &audio, &output, ContainerFamily::Mp4).with_cancellation(token);
    assert!(matches!(mux(job).await, Err(MuxError::Cancelled)));
    assert!(!output.exists());
}
