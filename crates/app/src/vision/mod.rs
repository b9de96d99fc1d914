//! Streaming annotation pipeline: decode a video, run a detector on every
//! frame, draw the detections and re-encode the result while reporting
//! progress.
//!
//! The module is split into focused submodules:
//! - `config`: run settings and their CLI form.
//! - `pipeline`: the run driver and its state machine.
//! - `parallel`: worker-pool frame loop with in-order delivery.
//! - `annotation`: box, label and HUD drawing.
//! - `progress`: progress events and reporters.
//! - `staging`: per-run temporary directory and input staging.
//! - `job`: staging plus ffmpeg source/sink wired into one call, and run reports.
//! - `error`: error kinds, stages and run failures.
//! - `cancel`: cooperative cancellation.
//! - `telemetry`: tracing subscriber and Prometheus recorder setup.

pub use annotation::{AnnotateError, AnnotationStyle, Annotator, BoxAnnotator};
pub use cancel::{CancelToken, cancel_on_ctrl_c};
pub use config::{FailurePolicy, RunArgs, RunConfig, TelemetryOptions};
pub use error::{ErrorKind, PipelineError, RunFailure, Stage};
pub use job::{AnnotationJob, ReportError, ReportStatus, RunReport};
pub use pipeline::{PipelineDriver, RunState, RunSummary};
pub use progress::{
    ChannelReporter, LogReporter, ProgressEvent, ProgressReporter, ProgressStatus, Throttled,
    progress_channel,
};
pub use staging::{RunWorkspace, StagingError, VideoInput};

pub mod annotation;
pub mod cancel;
pub mod config;
pub mod error;
pub mod job;
mod parallel;
pub mod pipeline;
pub mod progress;
pub mod staging;
pub mod telemetry;
