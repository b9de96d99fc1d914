//! Worker-pool variant of the frame loop.
//!
//! Decoding and encoding stay on the driver thread; detection and
//! annotation fan out to scoped workers. Results go through a reorder
//! buffer so the sink sees frames in source order, and at most
//! `2 * workers` frames are in flight at once.
//!
//! A decode error still lets dispatched frames reach the sink. Cancellation
//! does not: nothing is written once the token is set, so the partial output
//! ends where the caller cancelled.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use anyhow::anyhow;
use crossbeam_channel::{bounded, unbounded};
use tracing::{debug, debug_span};
use video_ingest::{Frame, FrameSink, FrameSource};

use crate::vision::{
    cancel::CancelToken,
    error::{ErrorKind, PipelineError, Stage},
    pipeline::{
        FrameProcessor, ProcessedFrame, ProgressEmitter, RunCounters, read_frame, write_frame,
    },
    telemetry,
};

type WorkerResult = (u64, Result<ProcessedFrame, PipelineError>);

/// Writes results to the sink strictly in sequence order and remembers the
/// first failure in that order.
struct Reorder {
    pending: BTreeMap<u64, Result<ProcessedFrame, PipelineError>>,
    next_write: u64,
    failure: Option<PipelineError>,
}

impl Reorder {
    fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            next_write: 0,
            failure: None,
        }
    }

    fn accept<K: FrameSink>(
        &mut self,
        (seq, result): WorkerResult,
        sink: &mut K,
        counters: &mut RunCounters,
        emitter: &mut ProgressEmitter<'_>,
        cancel: &CancelToken,
    ) {
        if self.failure.is_some() {
            return;
        }
        self.pending.insert(seq, result);
        while self.failure.is_none() && !cancel.is_cancelled() {
            let Some(result) = self.pending.remove(&self.next_write) else {
                break;
            };
            let written =
                result.and_then(|processed| write_frame(sink, processed, counters, emitter));
            match written {
                Ok(()) => self.next_write += 1,
                Err(err) => {
                    self.pending.clear();
                    self.failure = Some(err);
                }
            }
        }
        metrics::gauge!("annotate_reorder_pending_frames").set(self.pending.len() as f64);
    }
}

pub(crate) fn run_parallel<S: FrameSource, K: FrameSink>(
    processor: &FrameProcessor<'_>,
    source: &mut S,
    sink: &mut K,
    emitter: &mut ProgressEmitter<'_>,
    counters: &mut RunCounters,
    workers: usize,
    cancel: &CancelToken,
) -> Result<(), PipelineError> {
    let in_flight_limit = (workers * 2) as u64;
    let (work_tx, work_rx) = bounded::<(u64, Frame)>(workers * 2);
    let (done_tx, done_rx) = unbounded::<WorkerResult>();
    let halt = AtomicBool::new(false);

    thread::scope(|scope| {
        let mut reorder = Reorder::new();
        let mut dispatched: u64 = 0;
        // Failures that happen after every dispatched frame in source order.
        let mut read_failure: Option<PipelineError> = None;

        for worker in 0..workers {
            let work_rx = work_rx.clone();
            let done_tx = done_tx.clone();
            let halt = &halt;
            let name = format!("annotate-worker-{worker}");
            let spawned = telemetry::spawn_scoped_thread(scope, name, move || {
                for (seq, frame) in work_rx.iter() {
                    if halt.load(Ordering::Relaxed) {
                        break;
                    }
                    let _frame_span =
                        debug_span!("frame", index = frame.index(), worker).entered();
                    if done_tx.send((seq, processor.process(frame))).is_err() {
                        break;
                    }
                }
            });
            if let Err(err) = spawned {
                read_failure = Some(PipelineError::new(
                    ErrorKind::InferenceFailed,
                    Stage::Driver,
                    anyhow!(err).context("failed to spawn annotation worker"),
                ));
                break;
            }
        }
        drop(work_rx);
        drop(done_tx);

        while reorder.failure.is_none() && read_failure.is_none() {
            while dispatched - reorder.next_write >= in_flight_limit
                && reorder.failure.is_none()
                && !cancel.is_cancelled()
            {
                match done_rx.recv() {
                    Ok(result) => reorder.accept(result, sink, counters, emitter, cancel),
                    Err(_) => {
                        read_failure = Some(PipelineError::new(
                            ErrorKind::InferenceFailed,
                            Stage::Driver,
                            anyhow!("annotation workers exited early"),
                        ));
                        break;
                    }
                }
            }
            if reorder.failure.is_some() || read_failure.is_some() {
                break;
            }
            if cancel.is_cancelled() {
                read_failure = Some(PipelineError::cancelled(counters.frames_written));
                break;
            }
            match read_frame(source, counters) {
                Ok(Some(frame)) => {
                    if work_tx.send((dispatched, frame)).is_err() {
                        read_failure = Some(PipelineError::new(
                            ErrorKind::InferenceFailed,
                            Stage::Driver,
                            anyhow!("annotation workers exited early"),
                        ));
                        break;
                    }
                    dispatched += 1;
                    metrics::gauge!("annotate_inflight_frames")
                        .set((dispatched - reorder.next_write) as f64);
                }
                Ok(None) => break,
                Err(err) => {
                    read_failure = Some(err);
                    break;
                }
            }
            while let Ok(result) = done_rx.try_recv() {
                reorder.accept(result, sink, counters, emitter, cancel);
            }
        }
        if cancel.is_cancelled() {
            halt.store(true, Ordering::Relaxed);
        }
        drop(work_tx);

        // Frames already dispatched still reach the sink before the run ends,
        // unless the run was cancelled.
        while reorder.failure.is_none()
            && reorder.next_write < dispatched
            && !cancel.is_cancelled()
        {
            match done_rx.recv() {
                Ok(result) => reorder.accept(result, sink, counters, emitter, cancel),
                Err(_) => {
                    reorder.failure = Some(PipelineError::new(
                        ErrorKind::InferenceFailed,
                        Stage::Driver,
                        anyhow!(
                            "annotation workers stopped with {} frames outstanding",
                            dispatched - reorder.next_write
                        ),
                    ));
                }
            }
        }
        halt.store(true, Ordering::Relaxed);
        debug!(dispatched, written = reorder.next_write, "worker pool drained");

        if cancel.is_cancelled() && reorder.next_write < dispatched {
            debug!(
                discarded = dispatched - reorder.next_write,
                "dropping dispatched frames after cancellation"
            );
            if read_failure.is_none() {
                read_failure = Some(PipelineError::cancelled(counters.frames_written));
            }
        }
        match reorder.failure.or(read_failure) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
}
