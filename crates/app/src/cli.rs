use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use annotate::vision::{
    AnnotationJob, CancelToken, LogReporter, RunArgs, RunConfig, RunReport, TelemetryOptions,
    Throttled, VideoInput, cancel_on_ctrl_c, telemetry,
};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ml_core::{Detector, NullDetector};
use tracing::{info, warn};
use video_ingest::FfmpegBinaries;

#[derive(Parser, Debug)]
#[command(name = "annotate", version, about = "Draw object detections onto every frame of a video")]
pub struct Cli {
    #[command(flatten)]
    pub telemetry: TelemetryOptions,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Annotate a video and write `annotated-<run-id>.mp4`.
    Run(RunArgs),
    /// Print stream metadata as JSON.
    Probe {
        input: PathBuf,
    },
}

pub fn handle_command(cli: Cli) -> Result<()> {
    let _telemetry = telemetry::enter_runtime(&cli.telemetry);
    telemetry::init_metrics_recorder()?;

    let outcome = match &cli.command {
        Command::Run(args) => run_annotation(args),
        Command::Probe { input } => probe(input),
    };

    if let Some(path) = cli.telemetry.metrics_out.as_deref() {
        if let Err(err) = telemetry::write_metrics(path) {
            warn!("{err:#}");
        }
    }
    outcome
}

fn run_annotation(args: &RunArgs) -> Result<()> {
    let config = RunConfig::try_from(args)?;
    let detector = build_detector(args)?;
    let detector_name = detector.name().to_string();

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(&cancel);

    let job = AnnotationJob::new(config.clone(), detector).with_cancel_token(cancel);
    info!(
        run_id = %job.run_id(),
        input = %args.input.display(),
        detector = %detector_name,
        threshold = %config.threshold,
        workers = config.workers,
        "starting annotation run"
    );

    let started_at = Utc::now();
    let mut reporter = Throttled::new(LogReporter, args.progress_every);
    let outcome = job.run(VideoInput::path(&args.input), &mut reporter);

    if let Some(path) = args.report.as_deref() {
        let input = args.input.display().to_string();
        RunReport::new(&input, &config, &detector_name, started_at, &outcome).write_json(path)?;
        info!(report = %path.display(), "wrote run report");
    }

    match outcome {
        Ok(summary) => {
            let output = summary
                .output
                .as_deref()
                .map(|path| path.display().to_string())
                .unwrap_or_default();
            info!(
                frames = summary.frames_written,
                skipped = summary.frames_skipped,
                detections = summary.detections,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "annotated video written to {output}"
            );
            println!("{output}");
            Ok(())
        }
        Err(failure) => {
            let headline = format!("run {} failed: {}", failure.run_id, failure.error);
            let mut err = failure.error.source.context(headline);
            if let Some(partial) = failure.partial_output.as_deref() {
                err = err.context(format!(
                    "{} frames were written to {} before the failure",
                    failure.frames_written,
                    partial.display()
                ));
            }
            Err(err)
        }
    }
}

fn probe(input: &Path) -> Result<()> {
    let binaries = FfmpegBinaries::default();
    let info = video_ingest::probe(&binaries.ffprobe, input)
        .with_context(|| format!("failed to probe {}", input.display()))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&info).context("failed to serialise stream info")?
    );
    Ok(())
}

#[cfg(feature = "with-tch")]
fn build_detector(args: &RunArgs) -> Result<Arc<dyn Detector>> {
    use ml_core::{LabelMap, TorchScriptDetector};

    let Some(model) = args.model.as_deref() else {
        info!("no --model given; frames pass through without detections");
        return Ok(Arc::new(NullDetector));
    };
    let labels = match args.labels.as_str() {
        "coco" => LabelMap::coco(),
        "road-damage" => LabelMap::road_damage(),
        path => LabelMap::from_file(path)?,
    };
    let device = TorchScriptDetector::default_device();
    info!(model = %model.display(), ?device, classes = labels.len(), "loading detector");
    let detector = TorchScriptDetector::load(model, device, labels)?;
    Ok(Arc::new(detector))
}

#[cfg(not(feature = "with-tch"))]
fn build_detector(args: &RunArgs) -> Result<Arc<dyn Detector>> {
    if let Some(model) = args.model.as_deref() {
        anyhow::bail!(
            "cannot load {}: annotate was built without the with-tch feature",
            model.display()
        );
    }
    Ok(Arc::new(NullDetector))
}
