//! Video ingestion and output for the annotation pipeline.
//!
//! Decoding and encoding are delegated to `ffmpeg`/`ffprobe` child processes
//! exchanging `rawvideo` RGB24 frames over pipes:
//! - `source`: [`FrameSource`] and the decoding [`FfmpegSource`].
//! - `sink`: [`FrameSink`] and the MP4-encoding [`FfmpegSink`].
//! - `probe`: stream metadata from `ffprobe`.
//! - `types`: frames, frame rates and stream metadata.

pub mod probe;
mod process;
pub mod sink;
pub mod source;
pub mod types;

pub use probe::{ProbeError, parse_probe_output, probe};
pub use process::FfmpegBinaries;
pub use sink::{
    FfmpegSink, FrameSink, OutputSpec, SinkError, SinkSummary, VideoCodec, check_dimensions,
};
pub use source::{FfmpegSource, FrameSource, SourceError};
pub use types::{Frame, FrameError, FrameFormat, FrameRate, VideoInfo, frame_len};
