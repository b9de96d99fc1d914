//! Progress events and the non-blocking reporters that consume them.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError, bounded};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use video_ingest::Frame;

/// How long the terminal event may wait for a lagging channel consumer.
const FINAL_EVENT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    /// Frames written to the sink so far; never decreases within a run.
    pub frames_processed: u64,
    /// Container frame count, `None` when the container does not say.
    pub frames_total: Option<u64>,
    /// Most recent annotated frame, shared with the sink write.
    pub latest_frame: Option<Arc<Frame>>,
    pub status: ProgressStatus,
}

impl ProgressEvent {
    /// Completed fraction in `[0, 1]`, or `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        match self.frames_total {
            Some(total) if total > 0 => {
                Some((self.frames_processed as f64 / total as f64).min(1.0))
            }
            _ => None,
        }
    }

    pub fn is_indeterminate(&self) -> bool {
        self.fraction().is_none()
    }

    pub fn is_complete(&self) -> bool {
        self.status == ProgressStatus::Completed
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ProgressStatus::Running
    }
}

/// One-way consumer of progress events.
///
/// Called on the driver thread between frames, so implementations must not
/// block for long.
pub trait ProgressReporter {
    fn report(&mut self, event: &ProgressEvent);
}

impl<F: FnMut(&ProgressEvent)> ProgressReporter for F {
    fn report(&mut self, event: &ProgressEvent) {
        self(event)
    }
}

/// Forwards events into a bounded channel, dropping intermediate events the
/// consumer has not kept up with.
pub struct ChannelReporter {
    tx: Sender<ProgressEvent>,
    dropped: u64,
    final_timeout: Duration,
}

/// Reporter plus the receiving end for a UI or another thread.
pub fn progress_channel(capacity: usize) -> (ChannelReporter, Receiver<ProgressEvent>) {
    let (tx, rx) = bounded(capacity.max(1));
    (
        ChannelReporter {
            tx,
            dropped: 0,
            final_timeout: FINAL_EVENT_TIMEOUT,
        },
        rx,
    )
}

impl ChannelReporter {
    pub fn with_final_timeout(mut self, timeout: Duration) -> Self {
        self.final_timeout = timeout;
        self
    }

    /// Events discarded because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn record_drop(&mut self) {
        self.dropped += 1;
        metrics::counter!("annotate_progress_events_dropped_total").increment(1);
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&mut self, event: &ProgressEvent) {
        if event.is_terminal() {
            match self.tx.send_timeout(event.clone(), self.final_timeout) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    self.record_drop();
                    warn!(run_id = %event.run_id, "progress consumer did not take the final event");
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    debug!(run_id = %event.run_id, "progress receiver gone");
                }
            }
            return;
        }

        match self.tx.try_send(event.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.record_drop(),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Rate limiter in front of another reporter.
///
/// An event passes when `every_frames` frames have gone by since the last
/// forwarded event or, if set, when `interval` has elapsed. The first event
/// and terminal events always pass.
pub struct Throttled<R> {
    inner: R,
    every_frames: u64,
    interval: Option<Duration>,
    last_frames: Option<u64>,
    last_at: Option<Instant>,
}

impl<R: ProgressReporter> Throttled<R> {
    pub fn new(inner: R, every_frames: u64) -> Self {
        Self {
            inner,
            every_frames: every_frames.max(1),
            interval: None,
            last_frames: None,
            last_at: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn should_forward(&self, event: &ProgressEvent) -> bool {
        if event.is_terminal() {
            return true;
        }
        let Some(last) = self.last_frames else {
            return true;
        };
        if event.frames_processed.saturating_sub(last) >= self.every_frames {
            return true;
        }
        match (self.interval, self.last_at) {
            (Some(interval), Some(at)) => at.elapsed() >= interval,
            _ => false,
        }
    }
}

impl<R: ProgressReporter> ProgressReporter for Throttled<R> {
    fn report(&mut self, event: &ProgressEvent) {
        if self.should_forward(event) {
            self.last_frames = Some(event.frames_processed);
            self.last_at = Some(Instant::now());
            self.inner.report(event);
        }
    }
}

/// Writes progress as structured `tracing` events.
#[derive(Debug, Default)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&mut self, event: &ProgressEvent) {
        let percent = event.fraction().map(|f| format!("{:.1}%", f * 100.0));
        match event.status {
            ProgressStatus::Running => info!(
                run_id = %event.run_id,
                frames = event.frames_processed,
                total = ?event.frames_total,
                percent = percent.as_deref().unwrap_or("?"),
                "annotating"
            ),
            ProgressStatus::Completed => info!(
                run_id = %event.run_id,
                frames = event.frames_processed,
                "annotation complete"
            ),
            ProgressStatus::Failed => warn!(
                run_id = %event.run_id,
                frames = event.frames_processed,
                "annotation stopped early"
            ),
        }
    }
}
