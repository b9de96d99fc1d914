use std::{fmt, path::PathBuf};

use ml_core::DetectError;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use video_ingest::{SinkError, SourceError};

use crate::vision::{annotation::AnnotateError, pipeline::RunState, staging::StagingError};

/// Terminal error categories of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    OpenFailed,
    DecodeFailed,
    InferenceFailed,
    EncodeFailed,
    SinkOpenFailed,
    EmptyOutput,
    Cancelled,
    StagingFailed,
}

impl ErrorKind {
    /// Stable label used for metrics and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::OpenFailed => "open_failed",
            ErrorKind::DecodeFailed => "decode_failed",
            ErrorKind::InferenceFailed => "inference_failed",
            ErrorKind::EncodeFailed => "encode_failed",
            ErrorKind::SinkOpenFailed => "sink_open_failed",
            ErrorKind::EmptyOutput => "empty_output",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StagingFailed => "staging_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline component an error originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Staging,
    Source,
    Detector,
    Annotator,
    Sink,
    Driver,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Staging => "staging",
            Stage::Source => "source",
            Stage::Detector => "detector",
            Stage::Annotator => "annotator",
            Stage::Sink => "sink",
            Stage::Driver => "driver",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{stage} {kind}{}", frame_suffix(.frame))]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub stage: Stage,
    /// Index of the frame being handled, when the failure is tied to one.
    pub frame: Option<u64>,
    #[source]
    pub source: anyhow::Error,
}

fn frame_suffix(frame: &Option<u64>) -> String {
    frame.map(|f| format!(" at frame {f}")).unwrap_or_default()
}

impl PipelineError {
    pub fn new(kind: ErrorKind, stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            stage,
            frame: None,
            source: source.into(),
        }
    }

    pub fn at_frame(mut self, frame: u64) -> Self {
        self.frame = Some(frame);
        self
    }

    pub fn cancelled(frames_read: u64) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            Stage::Driver,
            anyhow::anyhow!("run cancelled after {frames_read} frames"),
        )
    }

    pub fn empty_output() -> Self {
        Self::new(
            ErrorKind::EmptyOutput,
            Stage::Driver,
            anyhow::anyhow!("source produced no frames"),
        )
    }

    pub fn source_open(err: SourceError) -> Self {
        Self::new(ErrorKind::OpenFailed, Stage::Source, err)
    }

    pub fn decode(err: SourceError) -> Self {
        let frame = match &err {
            SourceError::Decode { frame, .. } => Some(*frame),
            _ => None,
        };
        Self {
            frame,
            ..Self::new(ErrorKind::DecodeFailed, Stage::Source, err)
        }
    }

    pub fn inference(err: DetectError) -> Self {
        let frame = err.frame();
        Self::new(ErrorKind::InferenceFailed, Stage::Detector, err).at_frame(frame)
    }

    /// Annotation failures share the inference kind: both abort the frame
    /// before it reaches the sink.
    pub fn annotation(err: AnnotateError, frame: u64) -> Self {
        Self::new(ErrorKind::InferenceFailed, Stage::Annotator, err).at_frame(frame)
    }

    pub fn sink_open(err: SinkError) -> Self {
        Self::new(ErrorKind::SinkOpenFailed, Stage::Sink, err)
    }

    pub fn encode(err: SinkError, frame: Option<u64>) -> Self {
        Self {
            frame,
            ..Self::new(ErrorKind::EncodeFailed, Stage::Sink, err)
        }
    }

    pub fn staging(err: StagingError) -> Self {
        Self::new(ErrorKind::StagingFailed, Stage::Staging, err)
    }
}

/// Terminal outcome of a run that did not complete.
#[derive(Debug, Error)]
#[error("run {run_id} failed after writing {frames_written} frames")]
pub struct RunFailure {
    pub run_id: Uuid,
    #[source]
    pub error: PipelineError,
    pub frames_written: u64,
    /// Finalised partial artifact; `None` when nothing was written or the
    /// container could not be finalised.
    pub partial_output: Option<PathBuf>,
    pub history: Vec<RunState>,
}

impl RunFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind
    }

    pub fn stage(&self) -> Stage {
        self.error.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_errors_keep_their_frame_index() {
        let err = PipelineError::decode(SourceError::Decode {
            frame: 6,
            reason: "corrupt packet".into(),
        });
        assert_eq!(err.kind, ErrorKind::DecodeFailed);
        assert_eq!(err.stage, Stage::Source);
        assert_eq!(err.frame, Some(6));
        assert_eq!(err.to_string(), "source decode_failed at frame 6");
    }

    #[test]
    fn sink_open_has_no_frame() {
        let err = PipelineError::sink_open(SinkError::Closed);
        assert_eq!(err.kind, ErrorKind::SinkOpenFailed);
        assert_eq!(err.frame, None);
        assert_eq!(err.to_string(), "sink sink_open_failed");
    }
}
