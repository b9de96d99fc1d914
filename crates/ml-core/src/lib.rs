//! Detection types and the detector contract used by the annotation pipeline.
//!
//! The inference backend is pluggable: anything implementing [`Detector`]
//! can be injected into a run. Enable the `with-tch` feature to get
//! [`TorchScriptDetector`], which runs exported YOLOv8 models through `tch`.

pub mod detection;
pub mod detector;
pub mod labels;
#[cfg(feature = "with-tch")]
pub mod torchscript;

pub use detection::{
    BoundingBox, ConfidenceThreshold, Detection, DetectionSet, ThresholdError, non_max_suppression,
};
pub use detector::{DetectError, Detector, NullDetector};
pub use labels::LabelMap;
#[cfg(feature = "with-tch")]
pub use torchscript::TorchScriptDetector;

#[cfg(feature = "with-tch")]
pub use tch;
