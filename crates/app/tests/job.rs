mod common;

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};

use annotate::vision::{AnnotationJob, ProgressEvent, ProgressStatus, RunConfig, VideoInput};
use common::ScriptedDetector;
use video_ingest::{FfmpegSource, FrameRate, FrameSource, probe};

fn ffmpeg_available() -> bool {
    ["ffmpeg", "ffprobe"].iter().all(|bin| {
        Command::new(bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

fn make_fixture(dir: &Path, frames: u32) -> PathBuf {
    let path = dir.join("road.mp4");
    let status = Command::new("ffmpeg")
        .args(["-hide_banner", "-loglevel", "error", "-y", "-f", "lavfi", "-i"])
        .arg("testsrc=size=96x64:rate=12")
        .args(["-frames:v", &frames.to_string()])
        .args(["-c:v", "mpeg4", "-pix_fmt", "yuv420p"])
        .arg(&path)
        .status()
        .expect("ffmpeg should run");
    assert!(status.success(), "fixture generation failed");
    path
}

#[test]
fn annotated_output_matches_input_geometry_and_rate() {
    if !ffmpeg_available() {
        eprintln!("Skipping test: ffmpeg/ffprobe not found on PATH");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let fixture = make_fixture(dir.path(), 12);
    let staging = dir.path().join("staging");
    fs::create_dir(&staging).unwrap();
    let config = RunConfig {
        output_dir: dir.path().join("out"),
        staging_root: Some(staging.clone()),
        codec: video_ingest::VideoCodec::Mpeg4,
        ..RunConfig::default()
    };

    let job = AnnotationJob::new(config, Arc::new(ScriptedDetector::with_boxes(&[0.9])));
    let run_id = job.run_id();
    let mut statuses = Vec::new();
    let summary = job
        .run(VideoInput::path(&fixture), &mut |e: &ProgressEvent| {
            statuses.push(e.status)
        })
        .unwrap();

    let output = summary.output.clone().unwrap();
    assert_eq!(
        output,
        dir.path().join("out").join(format!("annotated-{run_id}.mp4"))
    );
    assert_eq!(summary.frames_written, 12);
    assert_eq!(statuses.last(), Some(&ProgressStatus::Completed));

    let info = probe(Path::new("ffprobe"), &output).unwrap();
    assert_eq!((info.width, info.height), (96, 64));
    assert_eq!(info.frame_rate, FrameRate::new(12, 1).unwrap());

    let mut reread = FfmpegSource::open(&output).unwrap();
    let mut frames = 0;
    while reread.next_frame().unwrap().is_some() {
        frames += 1;
    }
    reread.close();
    assert_eq!(frames, 12);

    assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
}

#[test]
fn in_memory_input_is_staged_and_cleaned_up() {
    if !ffmpeg_available() {
        eprintln!("Skipping test: ffmpeg/ffprobe not found on PATH");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let fixture = make_fixture(dir.path(), 6);
    let bytes = fs::read(&fixture).unwrap();
    let staging = dir.path().join("staging");
    fs::create_dir(&staging).unwrap();
    let config = RunConfig {
        output_dir: dir.path().join("out"),
        staging_root: Some(staging.clone()),
        codec: video_ingest::VideoCodec::Mpeg4,
        ..RunConfig::default()
    };

    let summary = AnnotationJob::new(config, Arc::new(ScriptedDetector::empty()))
        .run(
            VideoInput::bytes(bytes, Some("upload.MP4")),
            &mut |_: &ProgressEvent| {},
        )
        .unwrap();

    assert_eq!(summary.frames_written, 6);
    assert!(summary.output.unwrap().is_file());
    assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
}

#[test]
fn unreadable_input_fails_to_open_and_leaves_no_output() {
    if !ffmpeg_available() {
        eprintln!("Skipping test: ffmpeg/ffprobe not found on PATH");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let config = RunConfig {
        output_dir: out.clone(),
        staging_root: Some(dir.path().to_path_buf()),
        ..RunConfig::default()
    };

    let failure = AnnotationJob::new(config, Arc::new(ScriptedDetector::empty()))
        .run(
            VideoInput::bytes(b"definitely not a video".to_vec(), Some("clip.mp4")),
            &mut |_: &ProgressEvent| {},
        )
        .unwrap_err();

    assert_eq!(failure.kind(), annotate::vision::ErrorKind::OpenFailed);
    assert_eq!(failure.partial_output, None);
    assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
}
