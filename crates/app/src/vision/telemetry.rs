//! Telemetry helpers for tracing spans and Prometheus metrics.

use std::{fs, io, path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Context, Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    layer::SubscriberExt,
    prelude::*,
};

use crate::vision::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static PROM_UPKEEP_THREAD: OnceLock<thread::JoinHandle<()>> = OnceLock::new();

/// Keeps the subscriber installed and flushes the Chrome trace on drop.
pub struct TelemetryGuard {
    _default_guard: tracing::subscriber::DefaultGuard,
    _chrome_guard: Option<tracing_chrome::FlushGuard>,
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|err| anyhow!("metrics recorder already installed: {err}"))?;

    let upkeep_handle = handle.clone();
    let upkeep = spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    });
    match upkeep {
        Ok(join) => {
            let _ = PROM_UPKEEP_THREAD.set(join);
        }
        Err(err) => tracing::warn!("failed to spawn prometheus upkeep thread: {err}"),
    }
    describe_pipeline_metrics();

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

fn describe_pipeline_metrics() {
    use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

    describe_counter!(
        "annotate_frames_processed_total",
        Unit::Count,
        "Frames handed to the sink"
    );
    describe_counter!(
        "annotate_frames_skipped_total",
        Unit::Count,
        "Frames written without overlay after a detector or annotator failure"
    );
    describe_counter!("annotate_runs_total", Unit::Count, "Finished runs by outcome");
    describe_counter!("annotate_failures_total", Unit::Count, "Failed runs by error kind");
    describe_counter!(
        "annotate_progress_events_dropped_total",
        Unit::Count,
        "Intermediate progress events dropped because the consumer lagged"
    );
    describe_histogram!(
        "annotate_stage_latency_seconds",
        Unit::Seconds,
        "Per-frame latency of decode, inference, annotation and encode"
    );
    describe_gauge!("annotate_inflight_frames", "Frames dispatched but not yet written");
    describe_gauge!(
        "annotate_reorder_pending_frames",
        "Finished frames waiting for an earlier frame"
    );
}

/// Access the Prometheus handle when already initialised.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Write the current Prometheus text exposition to `path`.
pub fn write_metrics(path: &Path) -> Result<()> {
    let handle = prometheus_handle().context("metrics recorder was not installed")?;
    handle.run_upkeep();
    fs::write(path, handle.render())
        .with_context(|| format!("failed to write metrics to {}", path.display()))
}

/// Install the tracing subscriber for the current thread; worker threads
/// inherit it through [`spawn_thread`] and [`spawn_scoped_thread`].
pub fn enter_runtime(opts: &TelemetryOptions) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace.as_ref() {
        Some(path) => match chrome_trace_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let default_guard = tracing::subscriber::set_default(
        tracing_subscriber::registry()
            .with(chrome_layer.map(|chrome| chrome.with_filter(span_only_filter)))
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(fmt::time::uptime())
                    .with_writer(io::stderr)
                    .with_filter(env_filter),
            )
            .with(tracing_error::ErrorLayer::default()),
    );

    TelemetryGuard {
        _default_guard: default_guard,
        _chrome_guard: chrome_guard,
    }
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// Scoped counterpart of [`spawn_thread`]; also enters the caller's span.
pub(crate) fn spawn_scoped_thread<'scope, 'env, F, T>(
    scope: &'scope thread::Scope<'scope, 'env>,
    name: impl Into<String>,
    f: F,
) -> io::Result<thread::ScopedJoinHandle<'scope, T>>
where
    F: FnOnce() -> T + Send + 'scope,
    T: Send + 'scope,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    let parent = tracing::Span::current();
    thread::Builder::new()
        .name(name.into())
        .spawn_scoped(scope, move || {
            tracing::dispatcher::with_default(&dispatch, || parent.in_scope(f))
        })
}

type ChromeLayer = tracing_chrome::ChromeLayer<tracing_subscriber::Registry>;

/// One Chrome trace track per thread, so driver and workers line up.
fn chrome_trace_layer(path: &Path) -> io::Result<(ChromeLayer, tracing_chrome::FlushGuard)> {
    let file = fs::File::create(path)?;
    Ok(tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build())
}
