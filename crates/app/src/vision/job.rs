//! One end-to-end annotation job: stage the input, run the ffmpeg-backed
//! pipeline, clean up, and describe the outcome as a JSON report.

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ml_core::Detector;
use serde::Serialize;
use tracing::{info_span, warn};
use uuid::Uuid;
use video_ingest::{FfmpegSink, FfmpegSource, VideoCodec, VideoInfo};

use crate::vision::{
    cancel::CancelToken,
    config::{FailurePolicy, RunConfig},
    error::{ErrorKind, PipelineError, RunFailure, Stage},
    pipeline::{PipelineDriver, RunState, RunSummary},
    progress::{ProgressEvent, ProgressReporter, ProgressStatus},
    staging::{RunWorkspace, VideoInput},
};

pub struct AnnotationJob {
    run_id: Uuid,
    config: RunConfig,
    detector: Arc<dyn Detector>,
    cancel: CancelToken,
}

impl AnnotationJob {
    pub fn new(config: RunConfig, detector: Arc<dyn Detector>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            config,
            detector,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Annotate `input` into `<output_dir>/annotated-<run-id>.mp4`.
    ///
    /// The staging directory is removed before this returns, whatever the
    /// outcome; the output (or partial output) file is left in place.
    pub fn run(
        self,
        input: VideoInput,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<RunSummary, RunFailure> {
        let span = info_span!("annotate.job", run_id = %self.run_id, input = %input.describe());
        let _span_guard = span.enter();

        let mut workspace = match RunWorkspace::create(
            self.run_id,
            self.config.staging_root.as_deref(),
            &self.config.output_dir,
        ) {
            Ok(workspace) => workspace,
            Err(err) => {
                let error = PipelineError::staging(err);
                return Err(staging_failure(self.run_id, error, reporter));
            }
        };
        let staged = match workspace.stage(input) {
            Ok(path) => path,
            Err(err) => {
                let error = PipelineError::staging(err);
                return Err(staging_failure(self.run_id, error, reporter));
            }
        };

        let output_path = workspace.output_path().to_path_buf();
        let codec = self.config.codec;
        let ffmpeg = self.config.ffmpeg.clone();
        let driver = PipelineDriver::new(self.detector, &self.config)
            .with_run_id(self.run_id)
            .with_cancel_token(self.cancel);

        let outcome = driver.run(
            || FfmpegSource::open_with(&staged, &ffmpeg),
            |spec| FfmpegSink::create_with(&output_path, spec, codec, &ffmpeg),
            reporter,
        );
        workspace.release();
        outcome
    }
}

fn staging_failure(
    run_id: Uuid,
    error: PipelineError,
    reporter: &mut dyn ProgressReporter,
) -> RunFailure {
    warn!(
        run_id = %run_id,
        "run failed before opening the source: {error}: {:#}",
        error.source
    );
    metrics::counter!("annotate_failures_total", "kind" => error.kind.as_str()).increment(1);
    reporter.report(&ProgressEvent {
        run_id,
        frames_processed: 0,
        frames_total: None,
        latest_frame: None,
        status: ProgressStatus::Failed,
    });
    RunFailure {
        run_id,
        error,
        frames_written: 0,
        partial_output: None,
        history: vec![RunState::Idle, RunState::Failed, RunState::Closed],
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReportError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub frame: Option<u64>,
    pub message: String,
}

/// Machine-readable record of one run, written by `annotate run --report`.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub input: String,
    pub status: ReportStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    pub detector: String,
    pub threshold: f32,
    pub failure_policy: FailurePolicy,
    pub codec: VideoCodec,
    pub workers: usize,
    pub output: Option<String>,
    pub frames_written: u64,
    pub frames_skipped: u64,
    pub detections: u64,
    pub source: Option<VideoInfo>,
    pub error: Option<ReportError>,
    pub history: Vec<RunState>,
}

impl RunReport {
    pub fn new(
        input: &str,
        config: &RunConfig,
        detector: &str,
        started_at: DateTime<Utc>,
        outcome: &Result<RunSummary, RunFailure>,
    ) -> Self {
        let finished_at = Utc::now();
        let mut report = RunReport {
            run_id: Uuid::nil(),
            input: input.to_string(),
            status: ReportStatus::Completed,
            started_at,
            finished_at,
            elapsed_ms: (finished_at - started_at).num_milliseconds(),
            detector: detector.to_string(),
            threshold: config.threshold.value(),
            failure_policy: config.failure_policy,
            codec: config.codec,
            workers: config.workers,
            output: None,
            frames_written: 0,
            frames_skipped: 0,
            detections: 0,
            source: None,
            error: None,
            history: Vec::new(),
        };
        match outcome {
            Ok(summary) => {
                report.run_id = summary.run_id;
                report.output = summary.output.as_deref().map(path_string);
                report.frames_written = summary.frames_written;
                report.frames_skipped = summary.frames_skipped;
                report.detections = summary.detections;
                report.source = Some(summary.input.clone());
                report.history = summary.history.clone();
            }
            Err(failure) => {
                report.run_id = failure.run_id;
                report.status = ReportStatus::Failed;
                report.output = failure.partial_output.as_deref().map(path_string);
                report.frames_written = failure.frames_written;
                report.error = Some(ReportError {
                    kind: failure.error.kind,
                    stage: failure.error.stage,
                    frame: failure.error.frame,
                    message: format!("{:#}", failure.error.source),
                });
                report.history = failure.history.clone();
            }
        }
        report
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialise run report")?;
        fs::write(path, json)
            .with_context(|| format!("failed to write run report to {}", path.display()))
    }
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use ml_core::NullDetector;

    use super::*;

    #[test]
    fn missing_input_fails_to_open_and_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let staging = root.path().join("staging");
        fs::create_dir(&staging).unwrap();
        let config = RunConfig {
            output_dir: root.path().join("out"),
            staging_root: Some(staging.clone()),
            ..RunConfig::default()
        };
        let mut events = Vec::new();
        let failure = AnnotationJob::new(config, Arc::new(NullDetector))
            .run(
                VideoInput::path(root.path().join("missing.mp4")),
                &mut |e: &ProgressEvent| events.push(e.status),
            )
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::OpenFailed);
        assert_eq!(failure.stage(), Stage::Source);
        assert_eq!(failure.partial_output, None);
        assert_eq!(
            failure.history,
            vec![RunState::Idle, RunState::Failed, RunState::Closed]
        );
        assert_eq!(events, vec![ProgressStatus::Failed]);
        assert_eq!(fs::read_dir(&staging).unwrap().count(), 0);
        assert_eq!(fs::read_dir(root.path().join("out")).unwrap().count(), 0);
    }

    #[test]
    fn unusable_staging_root_fails_in_staging() {
        let root = tempfile::tempdir().unwrap();
        let not_a_dir = root.path().join("staging");
        fs::write(&not_a_dir, b"file").unwrap();
        let config = RunConfig {
            output_dir: root.path().join("out"),
            staging_root: Some(not_a_dir),
            ..RunConfig::default()
        };
        let failure = AnnotationJob::new(config, Arc::new(NullDetector))
            .run(
                VideoInput::bytes(b"clip".to_vec(), Some("clip.mp4")),
                &mut |_: &ProgressEvent| {},
            )
            .unwrap_err();

        assert_eq!(failure.kind(), ErrorKind::StagingFailed);
        assert_eq!(failure.stage(), Stage::Staging);
        assert_eq!(failure.frames_written, 0);
    }

    #[test]
    fn report_describes_failures() {
        let failure = RunFailure {
            run_id: Uuid::new_v4(),
            error: PipelineError::decode(video_ingest::SourceError::Decode {
                frame: 5,
                reason: "truncated".into(),
            }),
            frames_written: 5,
            partial_output: Some(PathBuf::from("/tmp/annotated-x.mp4")),
            history: vec![RunState::Idle, RunState::Failed, RunState::Closed],
        };
        let run_id = failure.run_id;
        let report = RunReport::new(
            "road.mp4",
            &RunConfig::default(),
            "none",
            Utc::now(),
            &Err(failure),
        );
        assert_eq!(report.run_id, run_id);
        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.frames_written, 5);

        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "decode_failed");
        assert_eq!(json["error"]["frame"], 5);
        assert_eq!(json["output"], "/tmp/annotated-x.mp4");
        assert_eq!(json["history"][1], "failed");
    }
}
