//! Video annotation: run an object detector over every frame of a video and
//! write a copy with the detections drawn in.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use annotate::vision::{AnnotationJob, LogReporter, RunConfig, VideoInput};
//! use ml_core::NullDetector;
//!
//! let job = AnnotationJob::new(RunConfig::default(), Arc::new(NullDetector));
//! let summary = job.run(VideoInput::path("road.mp4"), &mut LogReporter)?;
//! println!("wrote {:?}", summary.output);
//! # Ok::<(), annotate::vision::RunFailure>(())
//! ```

pub mod vision;

pub use ml_core::{ConfidenceThreshold, Detection, Detector, NullDetector};
pub use video_ingest::{Frame, FrameSink, FrameSource, VideoInfo};
