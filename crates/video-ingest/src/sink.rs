//! Frame sinks: the [`FrameSink`] contract and the ffmpeg MP4 encoder.

use std::{
    fmt,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Child, ChildStdin, Command, Stdio},
    str::FromStr,
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    process::{FfmpegBinaries, StderrTail, describe_stderr},
    types::{Frame, FrameFormat, FrameRate, VideoInfo},
};

/// Geometry and timing every frame written to a sink must honour.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct OutputSpec {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
}

impl From<&VideoInfo> for OutputSpec {
    fn from(info: &VideoInfo) -> Self {
        Self {
            width: info.width,
            height: info.height,
            frame_rate: info.frame_rate,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SinkSummary {
    /// Finalised artifact, absent for in-memory sinks.
    pub path: Option<PathBuf>,
    pub frames_written: u64,
    pub spec: OutputSpec,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    #[error("failed to open output {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("frame is {actual_width}x{actual_height} but the sink expects {expected_width}x{expected_height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },
    #[error("encoder rejected frame {frame}: {reason}")]
    Encode { frame: u64, reason: String },
    #[error("failed to finalise {path:?}: {reason}")]
    Finalize { path: PathBuf, reason: String },
    #[error("no frames were written to {path:?}")]
    Empty { path: PathBuf },
    #[error("sink is already closed")]
    Closed,
}

/// Ordered consumer of annotated frames.
pub trait FrameSink {
    fn spec(&self) -> &OutputSpec;

    /// Append one frame. Frames whose size differs from [`FrameSink::spec`]
    /// are rejected, never rescaled.
    fn write(&mut self, frame: &Frame) -> Result<(), SinkError>;

    fn frames_written(&self) -> u64;

    /// Finalise the output. Later calls return the first call's outcome
    /// without touching the output again.
    fn close(&mut self) -> Result<SinkSummary, SinkError>;
}

impl<T: FrameSink + ?Sized> FrameSink for Box<T> {
    fn spec(&self) -> &OutputSpec {
        (**self).spec()
    }

    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        (**self).write(frame)
    }

    fn frames_written(&self) -> u64 {
        (**self).frames_written()
    }

    fn close(&mut self) -> Result<SinkSummary, SinkError> {
        (**self).close()
    }
}

/// Check the hard size precondition shared by every sink.
pub fn check_dimensions(spec: &OutputSpec, frame: &Frame) -> Result<(), SinkError> {
    if frame.dimensions() == (spec.width, spec.height) {
        Ok(())
    } else {
        Err(SinkError::DimensionMismatch {
            expected_width: spec.width,
            expected_height: spec.height,
            actual_width: frame.width(),
            actual_height: frame.height(),
        })
    }
}

/// Video codec used for the MP4 artifact.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// H.264 via libx264; plays in browsers.
    #[default]
    H264,
    /// MPEG-4 Part 2 (`mp4v`), always built into ffmpeg.
    Mpeg4,
}

impl VideoCodec {
    /// ffmpeg encoder implementing this codec.
    pub fn encoder_name(self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Mpeg4 => "mpeg4",
        }
    }

    /// Output-side ffmpeg arguments for a `width`x`height` stream.
    pub(crate) fn encoder_args(self, width: u32, height: u32) -> Result<Vec<&'static str>, String> {
        let even = width % 2 == 0 && height % 2 == 0;
        match self {
            // 4:2:0 needs even dimensions; fall back to 4:4:4 rather than resizing.
            VideoCodec::H264 => Ok(vec![
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-crf",
                "18",
                "-pix_fmt",
                if even { "yuv420p" } else { "yuv444p" },
            ]),
            VideoCodec::Mpeg4 if even => Ok(vec![
                "-c:v",
                "mpeg4",
                "-q:v",
                "2",
                "-pix_fmt",
                "yuv420p",
            ]),
            VideoCodec::Mpeg4 => Err(format!(
                "mpeg4 output requires even dimensions, got {width}x{height}"
            )),
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VideoCodec::H264 => "h264",
            VideoCodec::Mpeg4 => "mpeg4",
        })
    }
}

impl FromStr for VideoCodec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "h264" | "avc" | "libx264" => Ok(VideoCodec::H264),
            "mpeg4" | "mp4v" => Ok(VideoCodec::Mpeg4),
            other => Err(format!("unsupported codec {other:?} (expected h264 or mpeg4)")),
        }
    }
}

/// Encodes RGB24 frames piped into an `ffmpeg` child as an MP4 file.
pub struct FfmpegSink {
    path: PathBuf,
    spec: OutputSpec,
    codec: VideoCodec,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stderr: Option<StderrTail>,
    frames_written: u64,
    outcome: Option<Result<SinkSummary, SinkError>>,
}

impl FfmpegSink {
    pub fn create(
        path: impl AsRef<Path>,
        spec: OutputSpec,
        codec: VideoCodec,
    ) -> Result<Self, SinkError> {
        Self::create_with(path, spec, codec, &FfmpegBinaries::default())
    }

    pub fn create_with(
        path: impl AsRef<Path>,
        spec: OutputSpec,
        codec: VideoCodec,
        binaries: &FfmpegBinaries,
    ) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let open_error = |reason: String| SinkError::Open {
            path: path.clone(),
            reason,
        };

        if spec.width == 0 || spec.height == 0 {
            return Err(open_error(format!(
                "invalid output size {}x{}",
                spec.width, spec.height
            )));
        }
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        if !parent.is_dir() {
            return Err(open_error(format!(
                "output directory {} does not exist",
                parent.display()
            )));
        }
        let encoder_args = codec.encoder_args(spec.width, spec.height).map_err(open_error)?;
        ensure_encoder(&binaries.ffmpeg, codec).map_err(open_error)?;

        let size = format!("{}x{}", spec.width, spec.height);
        let rate = spec.frame_rate.to_string();
        let mut cmd = Command::new(&binaries.ffmpeg);
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg(FrameFormat::Rgb8.ffmpeg_pix_fmt())
            .arg("-video_size")
            .arg(&size)
            .arg("-framerate")
            .arg(&rate)
            .arg("-i")
            .arg("-")
            .arg("-an")
            .args(&encoder_args)
            .arg("-movflags")
            .arg("+faststart")
            .arg("-f")
            .arg("mp4")
            .arg(&path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|err| open_error(format!("failed to launch ffmpeg: {err}")))?;
        let stderr = child.stderr.take().map(StderrTail::spawn);
        let Some(stdin) = child.stdin.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(open_error("failed to capture ffmpeg stdin".into()));
        };

        debug!(
            output = %path.display(),
            size = %size,
            rate = %rate,
            codec = %codec,
            "opened ffmpeg frame sink"
        );

        Ok(Self {
            path,
            spec,
            codec,
            child: Some(child),
            stdin: Some(stdin),
            stderr,
            frames_written: 0,
            outcome: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    fn finalize(&mut self) -> Result<SinkSummary, SinkError> {
        // Closing stdin signals end of input to the encoder.
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return Err(SinkError::Closed);
        };

        if self.frames_written == 0 {
            let _ = child.kill();
            let _ = child.wait();
            if let Some(stderr) = self.stderr.take() {
                let _ = stderr.finish();
            }
            remove_partial(&self.path);
            return Err(SinkError::Empty {
                path: self.path.clone(),
            });
        }

        let status = child.wait().map_err(|err| SinkError::Finalize {
            path: self.path.clone(),
            reason: err.to_string(),
        })?;
        let stderr = self.stderr.take().map(StderrTail::finish).unwrap_or_default();
        if !status.success() {
            return Err(SinkError::Finalize {
                path: self.path.clone(),
                reason: format!("ffmpeg exited with {status}{}", describe_stderr(&stderr)),
            });
        }

        debug!(
            output = %self.path.display(),
            frames = self.frames_written,
            "finalised ffmpeg frame sink"
        );
        Ok(SinkSummary {
            path: Some(self.path.clone()),
            frames_written: self.frames_written,
            spec: self.spec,
        })
    }
}

impl FrameSink for FfmpegSink {
    fn spec(&self) -> &OutputSpec {
        &self.spec
    }

    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if self.outcome.is_some() {
            return Err(SinkError::Closed);
        }
        check_dimensions(&self.spec, frame)?;
        let stdin = self.stdin.as_mut().ok_or(SinkError::Closed)?;

        stdin
            .write_all(frame.data())
            .map_err(|err| SinkError::Encode {
                frame: self.frames_written,
                reason: match err.kind() {
                    io::ErrorKind::BrokenPipe => "ffmpeg encoder exited early".to_string(),
                    _ => err.to_string(),
                },
            })?;
        self.frames_written += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn close(&mut self) -> Result<SinkSummary, SinkError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = self.finalize();
        self.outcome = Some(outcome.clone());
        outcome
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            if let Err(err) = self.close() {
                warn!(output = %self.path.display(), "sink dropped without a clean close: {err}");
            }
        }
    }
}

/// Fail early when this ffmpeg build lacks the encoder; ffmpeg only opens the
/// encoder once the first frame arrives, which would otherwise surface as a
/// write failure.
fn ensure_encoder(ffmpeg: &Path, codec: VideoCodec) -> Result<(), String> {
    let output = Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map_err(|err| format!("failed to launch ffmpeg: {err}"))?;
    let listing = String::from_utf8_lossy(&output.stdout);
    if encoder_listed(&listing, codec.encoder_name()) {
        Ok(())
    } else {
        Err(format!(
            "ffmpeg has no {} encoder for {codec} output",
            codec.encoder_name()
        ))
    }
}

/// Rows of `ffmpeg -encoders` look like ` V....D libx264   libx264 H.264 ...`.
pub(crate) fn encoder_listed(listing: &str, name: &str) -> bool {
    listing.lines().any(|line| {
        let mut fields = line.split_whitespace();
        matches!(
            (fields.next(), fields.next()),
            (Some(flags), Some(encoder)) if flags.len() == 6 && encoder == name
        )
    })
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(output = %path.display(), "removed empty output"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(output = %path.display(), "failed to remove empty output: {err}"),
    }
}
