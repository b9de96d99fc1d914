use std::sync::Arc;

use thiserror::Error;
use video_ingest::Frame;

use crate::detection::{ConfidenceThreshold, Detection};

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector rejected frame {frame}: {reason}")]
    InvalidInput { frame: u64, reason: String },
    #[error("inference failed on frame {frame}")]
    Backend {
        frame: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("detector panicked on frame {frame}: {message}")]
    Panicked { frame: u64, message: String },
}

impl DetectError {
    pub fn backend(frame: &Frame, source: impl Into<anyhow::Error>) -> Self {
        DetectError::Backend {
            frame: frame.index(),
            source: source.into(),
        }
    }

    pub fn frame(&self) -> u64 {
        match self {
            DetectError::InvalidInput { frame, .. }
            | DetectError::Backend { frame, .. }
            | DetectError::Panicked { frame, .. } => *frame,
        }
    }
}

/// Per-frame object detector.
///
/// Implementations must behave as a pure function of `(frame, threshold)`:
/// the frame is only borrowed and no state may carry over between calls,
/// which is what lets one instance serve several worker threads.
pub trait Detector: Send + Sync {
    fn detect(
        &self,
        frame: &Frame,
        threshold: ConfidenceThreshold,
    ) -> Result<Vec<Detection>, DetectError>;

    /// Short name for logs and run reports.
    fn name(&self) -> &str {
        "detector"
    }
}

impl<D: Detector + ?Sized> Detector for &D {
    fn detect(
        &self,
        frame: &Frame,
        threshold: ConfidenceThreshold,
    ) -> Result<Vec<Detection>, DetectError> {
        (**self).detect(frame, threshold)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(
        &self,
        frame: &Frame,
        threshold: ConfidenceThreshold,
    ) -> Result<Vec<Detection>, DetectError> {
        (**self).detect(frame, threshold)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<D: Detector + ?Sized> Detector for Arc<D> {
    fn detect(
        &self,
        frame: &Frame,
        threshold: ConfidenceThreshold,
    ) -> Result<Vec<Detection>, DetectError> {
        (**self).detect(frame, threshold)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Detector that never finds anything. Runs with it re-encode the input
/// unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(
        &self,
        _frame: &Frame,
        _threshold: ConfidenceThreshold,
    ) -> Result<Vec<Detection>, DetectError> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "none"
    }
}
