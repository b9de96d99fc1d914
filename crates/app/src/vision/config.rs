use std::{fmt, path::PathBuf, str::FromStr};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use ml_core::ConfidenceThreshold;
use serde::Serialize;
use video_ingest::{FfmpegBinaries, VideoCodec};

use crate::vision::annotation::AnnotationStyle;

/// What a run does when detection or annotation fails on one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the run; frames already written are finalised as partial output.
    #[default]
    Abort,
    /// Write the frame without overlay and keep going. Decode and encode
    /// failures still abort.
    SkipFrame,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::Abort => f.write_str("abort"),
            FailurePolicy::SkipFrame => f.write_str("skip"),
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(FailurePolicy::Abort),
            "skip" | "skip-frame" | "skip_frame" => Ok(FailurePolicy::SkipFrame),
            other => bail!("unknown frame error policy {other:?} (expected abort or skip)"),
        }
    }
}

/// Per-run settings. Built in code or from [`RunArgs`].
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub threshold: ConfidenceThreshold,
    pub failure_policy: FailurePolicy,
    /// Detection/annotation threads; 1 keeps everything on the driver thread.
    pub workers: usize,
    /// Where `annotated-<run-id>.mp4` is written.
    pub output_dir: PathBuf,
    /// Parent of the per-run staging directory; system temp dir when unset.
    pub staging_root: Option<PathBuf>,
    pub codec: VideoCodec,
    pub style: AnnotationStyle,
    pub ffmpeg: FfmpegBinaries,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threshold: ConfidenceThreshold::default(),
            failure_policy: FailurePolicy::default(),
            workers: 1,
            output_dir: PathBuf::from("."),
            staging_root: None,
            codec: VideoCodec::default(),
            style: AnnotationStyle::default(),
            ffmpeg: FfmpegBinaries::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("--workers must be at least 1");
        }
        Ok(())
    }
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    /// Video file to annotate (MP4, AVI, MOV, ...).
    pub input: PathBuf,
    /// TorchScript detector exported from YOLOv8. Requires the `with-tch` build.
    #[arg(long)]
    pub model: Option<PathBuf>,
    /// Class names: `coco`, `road-damage`, or a file with one name per line.
    #[arg(long, default_value = "road-damage")]
    pub labels: String,
    /// Minimum detection confidence, 0.0 to 1.0.
    #[arg(long = "conf", default_value_t = 0.25)]
    pub confidence: f32,
    #[arg(long, default_value = ".")]
    pub output_dir: PathBuf,
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,
    /// Output codec: h264 or mpeg4.
    #[arg(long, default_value = "h264")]
    pub codec: String,
    /// Per-frame detector failures: abort or skip.
    #[arg(long, default_value = "abort")]
    pub on_frame_error: String,
    #[arg(long, default_value_t = 1)]
    pub workers: usize,
    /// Log progress every N frames.
    #[arg(long, default_value_t = 30)]
    pub progress_every: u64,
    /// Draw a frame counter in the corner.
    #[arg(long)]
    pub hud: bool,
    #[arg(long)]
    pub line_width: Option<u32>,
    /// Write a JSON run report here.
    #[arg(long)]
    pub report: Option<PathBuf>,
}

impl TryFrom<&RunArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: &RunArgs) -> Result<Self> {
        let threshold = ConfidenceThreshold::new(args.confidence)
            .map_err(|err| anyhow!("--conf: {err}"))?;
        let codec = args
            .codec
            .parse::<VideoCodec>()
            .map_err(|err| anyhow!("--codec: {err}"))?;
        let failure_policy = args
            .on_frame_error
            .parse::<FailurePolicy>()
            .context("--on-frame-error")?;
        if args.progress_every == 0 {
            bail!("--progress-every must be at least 1");
        }
        if args.line_width == Some(0) {
            bail!("--line-width must be at least 1");
        }

        let config = RunConfig {
            threshold,
            failure_policy,
            workers: args.workers,
            output_dir: args.output_dir.clone(),
            staging_root: args.staging_dir.clone(),
            codec,
            style: AnnotationStyle {
                line_width: args.line_width,
                hud: args.hud,
                ..AnnotationStyle::default()
            },
            ffmpeg: FfmpegBinaries::default(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Process-wide observability outputs.
#[derive(Args, Clone, Debug, Default)]
pub struct TelemetryOptions {
    /// Write a Chrome trace (chrome://tracing, Perfetto) of all spans.
    #[arg(long, global = true)]
    pub chrome_trace: Option<PathBuf>,
    /// Write Prometheus metrics here when the command exits.
    #[arg(long, global = true)]
    pub metrics_out: Option<PathBuf>,
}
