//! Run driver: open source and sink, pump frames through detection and
//! annotation, then release everything exactly once.
//!
//! A run moves through `Idle → Opened → Running → {Completed, Failed} →
//! Closed`; open failures jump from `Idle` straight to `Failed`. The path a
//! run took is returned in its summary or failure.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use ml_core::{ConfidenceThreshold, DetectError, DetectionSet, Detector};
use serde::Serialize;
use tracing::{debug, debug_span, info, info_span, warn};
use uuid::Uuid;
use video_ingest::{
    Frame, FrameSink, FrameSource, OutputSpec, SinkError, SourceError, VideoInfo,
};

use crate::vision::{
    annotation::{AnnotateError, Annotator, BoxAnnotator},
    cancel::CancelToken,
    config::{FailurePolicy, RunConfig},
    error::{PipelineError, RunFailure},
    parallel,
    progress::{ProgressEvent, ProgressReporter, ProgressStatus},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Opened,
    Running,
    Completed,
    Failed,
    Closed,
}

/// Result of a run that reached `Completed`.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Finalised artifact; `None` only for sinks that do not write files.
    pub output: Option<PathBuf>,
    pub frames_written: u64,
    /// Frames written without overlay under [`FailurePolicy::SkipFrame`].
    pub frames_skipped: u64,
    pub detections: u64,
    pub input: VideoInfo,
    pub output_spec: OutputSpec,
    pub elapsed: Duration,
    pub history: Vec<RunState>,
}

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RunCounters {
    pub(crate) frames_read: u64,
    pub(crate) frames_written: u64,
    pub(crate) frames_skipped: u64,
    pub(crate) detections: u64,
}

/// A frame ready for the sink.
pub(crate) struct ProcessedFrame {
    pub(crate) frame: Arc<Frame>,
    pub(crate) detections: usize,
    pub(crate) skipped: bool,
}

/// Detection and annotation for a single frame. Shared by reference with
/// the worker pool, so it holds no per-frame state.
pub(crate) struct FrameProcessor<'a> {
    detector: &'a dyn Detector,
    annotator: &'a dyn Annotator,
    threshold: ConfidenceThreshold,
    policy: FailurePolicy,
}

impl FrameProcessor<'_> {
    pub(crate) fn process(&self, frame: Frame) -> Result<ProcessedFrame, PipelineError> {
        let index = frame.index();
        let (width, height) = frame.dimensions();

        let started = Instant::now();
        let raw = panic::catch_unwind(AssertUnwindSafe(|| {
            self.detector.detect(&frame, self.threshold)
        }))
        .unwrap_or_else(|payload| {
            Err(DetectError::Panicked {
                frame: index,
                message: panic_message(payload.as_ref()),
            })
        });
        metrics::histogram!("annotate_stage_latency_seconds", "stage" => "inference")
            .record(started.elapsed().as_secs_f64());

        let detections = match raw {
            Ok(raw) => DetectionSet::admit(raw, self.threshold, width, height),
            Err(err) => return self.skip_or_fail(frame, PipelineError::inference(err)),
        };

        let started = Instant::now();
        let annotated = panic::catch_unwind(AssertUnwindSafe(|| {
            self.annotator.annotate(&frame, detections.as_slice())
        }))
        .unwrap_or_else(|payload| {
            Err(AnnotateError {
                frame: index,
                reason: format!("annotator panicked: {}", panic_message(payload.as_ref())),
            })
        })
        .and_then(|out| {
            if out.dimensions() == (width, height) {
                Ok(out)
            } else {
                Err(AnnotateError {
                    frame: index,
                    reason: format!(
                        "annotator changed frame size from {width}x{height} to {}x{}",
                        out.width(),
                        out.height()
                    ),
                })
            }
        });
        metrics::histogram!("annotate_stage_latency_seconds", "stage" => "annotation")
            .record(started.elapsed().as_secs_f64());

        match annotated {
            Ok(out) => Ok(ProcessedFrame {
                frame: Arc::new(out),
                detections: detections.len(),
                skipped: false,
            }),
            Err(err) => self.skip_or_fail(frame, PipelineError::annotation(err, index)),
        }
    }

    fn skip_or_fail(
        &self,
        frame: Frame,
        err: PipelineError,
    ) -> Result<ProcessedFrame, PipelineError> {
        match self.policy {
            FailurePolicy::Abort => Err(err),
            FailurePolicy::SkipFrame => {
                warn!(frame = frame.index(), "writing frame without overlay: {err}: {:#}", err.source);
                metrics::counter!("annotate_frames_skipped_total").increment(1);
                Ok(ProcessedFrame {
                    frame: Arc::new(frame),
                    detections: 0,
                    skipped: true,
                })
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Turns written frames into progress events for the caller's reporter.
pub(crate) struct ProgressEmitter<'r> {
    run_id: Uuid,
    total: Option<u64>,
    frames_processed: u64,
    latest: Option<Arc<Frame>>,
    reporter: &'r mut dyn ProgressReporter,
}

impl ProgressEmitter<'_> {
    fn frame_written(&mut self, frame: Arc<Frame>) {
        self.frames_processed += 1;
        self.latest = Some(frame);
        self.emit(ProgressStatus::Running);
    }

    fn finish(&mut self, status: ProgressStatus) {
        self.emit(status);
    }

    fn emit(&mut self, status: ProgressStatus) {
        let event = ProgressEvent {
            run_id: self.run_id,
            frames_processed: self.frames_processed,
            frames_total: self.total,
            latest_frame: self.latest.clone(),
            status,
        };
        self.reporter.report(&event);
    }
}

/// Hand one processed frame to the sink and account for it.
pub(crate) fn write_frame<K: FrameSink + ?Sized>(
    sink: &mut K,
    processed: ProcessedFrame,
    counters: &mut RunCounters,
    emitter: &mut ProgressEmitter<'_>,
) -> Result<(), PipelineError> {
    let index = processed.frame.index();
    let started = Instant::now();
    sink.write(&processed.frame)
        .map_err(|err| PipelineError::encode(err, Some(index)))?;
    metrics::histogram!("annotate_stage_latency_seconds", "stage" => "encode")
        .record(started.elapsed().as_secs_f64());
    metrics::counter!("annotate_frames_processed_total").increment(1);

    counters.frames_written += 1;
    counters.detections += processed.detections as u64;
    if processed.skipped {
        counters.frames_skipped += 1;
    }
    emitter.frame_written(processed.frame);
    Ok(())
}

/// Pull the next frame, timing the decode.
pub(crate) fn read_frame<S: FrameSource + ?Sized>(
    source: &mut S,
    counters: &mut RunCounters,
) -> Result<Option<Frame>, PipelineError> {
    let started = Instant::now();
    let next = source.next_frame().map_err(PipelineError::decode)?;
    metrics::histogram!("annotate_stage_latency_seconds", "stage" => "decode")
        .record(started.elapsed().as_secs_f64());
    if next.is_some() {
        counters.frames_read += 1;
    }
    Ok(next)
}

/// Owns one run from open to close.
pub struct PipelineDriver {
    run_id: Uuid,
    detector: Arc<dyn Detector>,
    annotator: Arc<dyn Annotator>,
    threshold: ConfidenceThreshold,
    policy: FailurePolicy,
    workers: usize,
    cancel: CancelToken,
    state: RunState,
    history: Vec<RunState>,
}

impl PipelineDriver {
    pub fn new(detector: Arc<dyn Detector>, config: &RunConfig) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            detector,
            annotator: Arc::new(BoxAnnotator::new(config.style)),
            threshold: config.threshold,
            policy: config.failure_policy,
            workers: config.workers.max(1),
            cancel: CancelToken::new(),
            state: RunState::Idle,
            history: vec![RunState::Idle],
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn with_annotator(mut self, annotator: Arc<dyn Annotator>) -> Self {
        self.annotator = annotator;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Execute the run.
    ///
    /// `open_sink` receives the geometry and rate of the opened source; the
    /// sink it returns must report the same spec. Source and sink are closed
    /// exactly once each, on every path, source first.
    pub fn run<S, K, OS, OK>(
        mut self,
        open_source: OS,
        open_sink: OK,
        reporter: &mut dyn ProgressReporter,
    ) -> Result<RunSummary, RunFailure>
    where
        S: FrameSource,
        K: FrameSink,
        OS: FnOnce() -> Result<S, SourceError>,
        OK: FnOnce(OutputSpec) -> Result<K, SinkError>,
    {
        let span = info_span!(
            "annotate.run",
            run_id = %self.run_id,
            detector = self.detector.name(),
            threshold = %self.threshold,
            workers = self.workers,
            policy = %self.policy,
        );
        let _span_guard = span.enter();
        let started = Instant::now();

        let mut emitter = ProgressEmitter {
            run_id: self.run_id,
            total: None,
            frames_processed: 0,
            latest: None,
            reporter,
        };

        let mut source = match open_source() {
            Ok(source) => source,
            Err(err) => {
                return Err(self.fail_unopened(PipelineError::source_open(err), &mut emitter));
            }
        };
        let input = source.info().clone();
        let spec = OutputSpec::from(&input);
        emitter.total = input.total_frames();

        let mut sink = match open_sink(spec) {
            Ok(sink) if *sink.spec() == spec => sink,
            Ok(mut sink) => {
                let err = PipelineError::sink_open(SinkError::Open {
                    path: PathBuf::new(),
                    reason: format!(
                        "sink opened as {:?} but the source is {:?}",
                        sink.spec(),
                        spec
                    ),
                });
                source.close();
                if let Err(close_err) = sink.close() {
                    debug!("discarding mismatched sink: {close_err}");
                }
                return Err(self.fail_unopened(err, &mut emitter));
            }
            Err(err) => {
                source.close();
                return Err(self.fail_unopened(PipelineError::sink_open(err), &mut emitter));
            }
        };

        self.transition(RunState::Opened);
        info!(
            width = input.width,
            height = input.height,
            rate = %input.frame_rate,
            frames = ?input.total_frames(),
            "run opened"
        );

        self.transition(RunState::Running);
        let mut counters = RunCounters::default();
        let processor = FrameProcessor {
            detector: self.detector.as_ref(),
            annotator: self.annotator.as_ref(),
            threshold: self.threshold,
            policy: self.policy,
        };
        let outcome = if self.workers > 1 {
            parallel::run_parallel(
                &processor,
                &mut source,
                &mut sink,
                &mut emitter,
                &mut counters,
                self.workers,
                &self.cancel,
            )
        } else {
            run_sequential(
                &processor,
                &mut source,
                &mut sink,
                &mut emitter,
                &mut counters,
                &self.cancel,
            )
        };
        let outcome = match outcome {
            Ok(()) if counters.frames_written == 0 => Err(PipelineError::empty_output()),
            other => other,
        };

        match outcome {
            Ok(()) => {
                self.transition(RunState::Completed);
                source.close();
                let closed = sink.close();
                self.transition(RunState::Closed);
                match closed {
                    Ok(summary) => {
                        emitter.finish(ProgressStatus::Completed);
                        metrics::counter!("annotate_runs_total", "outcome" => "completed")
                            .increment(1);
                        info!(
                            frames = counters.frames_written,
                            skipped = counters.frames_skipped,
                            detections = counters.detections,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "run completed"
                        );
                        Ok(RunSummary {
                            run_id: self.run_id,
                            output: summary.path,
                            frames_written: counters.frames_written,
                            frames_skipped: counters.frames_skipped,
                            detections: counters.detections,
                            input,
                            output_spec: spec,
                            elapsed: started.elapsed(),
                            history: self.history,
                        })
                    }
                    Err(err) => {
                        let error = PipelineError::encode(err, None);
                        Err(self.into_failure(error, counters.frames_written, None, &mut emitter))
                    }
                }
            }
            Err(error) => {
                self.transition(RunState::Failed);
                source.close();
                let partial = match sink.close() {
                    Ok(summary) if counters.frames_written > 0 => summary.path,
                    Ok(_) => None,
                    Err(SinkError::Empty { .. }) => None,
                    Err(err) => {
                        warn!("failed to finalise partial output: {err}");
                        None
                    }
                };
                self.transition(RunState::Closed);
                Err(self.into_failure(error, counters.frames_written, partial, &mut emitter))
            }
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = ?self.state, to = ?next, "run state");
        self.state = next;
        self.history.push(next);
    }

    /// `Idle → Failed → Closed` when the source or sink never opened.
    fn fail_unopened(
        mut self,
        error: PipelineError,
        emitter: &mut ProgressEmitter<'_>,
    ) -> RunFailure {
        self.transition(RunState::Failed);
        self.transition(RunState::Closed);
        self.into_failure(error, 0, None, emitter)
    }

    fn into_failure(
        self,
        error: PipelineError,
        frames_written: u64,
        partial_output: Option<PathBuf>,
        emitter: &mut ProgressEmitter<'_>,
    ) -> RunFailure {
        emitter.finish(ProgressStatus::Failed);
        metrics::counter!("annotate_runs_total", "outcome" => "failed").increment(1);
        metrics::counter!("annotate_failures_total", "kind" => error.kind.as_str()).increment(1);
        warn!(
            kind = %error.kind,
            stage = %error.stage,
            frame = ?error.frame,
            frames_written,
            partial = ?partial_output,
            "run failed: {error}: {:#}",
            error.source
        );
        RunFailure {
            run_id: self.run_id,
            error,
            frames_written,
            partial_output,
            history: self.history,
        }
    }
}

fn run_sequential<S: FrameSource, K: FrameSink>(
    processor: &FrameProcessor<'_>,
    source: &mut S,
    sink: &mut K,
    emitter: &mut ProgressEmitter<'_>,
    counters: &mut RunCounters,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::cancelled(counters.frames_read));
        }
        let Some(frame) = read_frame(source, counters)? else {
            return Ok(());
        };
        let _frame_span = debug_span!("frame", index = frame.index()).entered();
        let processed = processor.process(frame)?;
        write_frame(sink, processed, counters, emitter)?;
    }
}

#[cfg(test)]
mod tests {
    use ml_core::{BoundingBox, Detection, NullDetector};
    use video_ingest::{FrameRate, SinkSummary};

    use super::*;

    struct Frames {
        info: VideoInfo,
        remaining: u64,
        next: u64,
    }

    impl Frames {
        fn new(count: u64) -> Self {
            Self {
                info: VideoInfo {
                    width: 8,
                    height: 6,
                    frame_rate: FrameRate::new(25, 1).unwrap(),
                    frame_count: count,
                    codec: None,
                    duration_secs: None,
                },
                remaining: count,
                next: 0,
            }
        }
    }

    impl FrameSource for Frames {
        fn info(&self) -> &VideoInfo {
            &self.info
        }

        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            let index = self.next;
            self.next += 1;
            Ok(Some(Frame::filled(8, 6, [index as u8, 0, 0], index, 0)))
        }

        fn close(&mut self) {}
    }

    struct Collect {
        spec: OutputSpec,
        frames: Vec<Frame>,
    }

    impl FrameSink for Collect {
        fn spec(&self) -> &OutputSpec {
            &self.spec
        }

        fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
            self.frames.push(frame.clone());
            Ok(())
        }

        fn frames_written(&self) -> u64 {
            self.frames.len() as u64
        }

        fn close(&mut self) -> Result<SinkSummary, SinkError> {
            Ok(SinkSummary {
                path: None,
                frames_written: self.frames.len() as u64,
                spec: self.spec,
            })
        }
    }

    struct Panics;

    impl Detector for Panics {
        fn detect(
            &self,
            _frame: &Frame,
            _threshold: ConfidenceThreshold,
        ) -> Result<Vec<Detection>, DetectError> {
            panic!("model exploded")
        }
    }

    #[test]
    fn sequential_run_walks_the_happy_path() {
        let driver = PipelineDriver::new(Arc::new(NullDetector), &RunConfig::default());
        let summary = driver
            .run(
                || Ok(Frames::new(4)),
                |spec| Ok(Collect { spec, frames: Vec::new() }),
                &mut |_: &ProgressEvent| {},
            )
            .unwrap();
        assert_eq!(summary.frames_written, 4);
        assert_eq!(
            summary.history,
            vec![
                RunState::Idle,
                RunState::Opened,
                RunState::Running,
                RunState::Completed,
                RunState::Closed
            ]
        );
    }

    #[test]
    fn detector_panic_becomes_inference_failure() {
        let processor = FrameProcessor {
            detector: &Panics,
            annotator: &BoxAnnotator::default(),
            threshold: ConfidenceThreshold::default(),
            policy: FailurePolicy::Abort,
        };
        let err = processor
            .process(Frame::filled(4, 4, [0, 0, 0], 2, 0))
            .err()
            .unwrap();
        assert_eq!(err.kind, crate::vision::error::ErrorKind::InferenceFailed);
        assert_eq!(err.frame, Some(2));
        assert!(format!("{:#}", err.source).contains("model exploded"));
    }

    #[test]
    fn skip_policy_passes_the_original_frame_through() {
        let processor = FrameProcessor {
            detector: &Panics,
            annotator: &BoxAnnotator::default(),
            threshold: ConfidenceThreshold::default(),
            policy: FailurePolicy::SkipFrame,
        };
        let frame = Frame::filled(4, 4, [9, 9, 9], 0, 0);
        let out = processor.process(frame.clone()).unwrap();
        assert!(out.skipped);
        assert_eq!(*out.frame, frame);
    }

    #[test]
    fn detections_outside_the_threshold_are_not_drawn() {
        struct LowScore;
        impl Detector for LowScore {
            fn detect(
                &self,
                _frame: &Frame,
                _threshold: ConfidenceThreshold,
            ) -> Result<Vec<Detection>, DetectError> {
                Ok(vec![Detection::new(
                    BoundingBox::new(1.0, 1.0, 3.0, 3.0),
                    0.99,
                    0,
                    "crack",
                )])
            }
        }
        let processor = FrameProcessor {
            detector: &LowScore,
            annotator: &BoxAnnotator::default(),
            threshold: ConfidenceThreshold::new(1.0).unwrap(),
            policy: FailurePolicy::Abort,
        };
        let frame = Frame::filled(8, 8, [40, 40, 40], 0, 0);
        let out = processor.process(frame.clone()).unwrap();
        assert_eq!(out.detections, 0);
        assert_eq!(*out.frame, frame);
    }
}
