#![allow(dead_code)]

use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::anyhow;
use ml_core::{BoundingBox, ConfidenceThreshold, DetectError, Detection, Detector};
use video_ingest::{
    Frame, FrameRate, FrameSink, FrameSource, OutputSpec, SinkError, SinkSummary, SourceError,
    VideoInfo, check_dimensions,
};

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 48;

pub fn video_info(frames: u64) -> VideoInfo {
    VideoInfo {
        width: WIDTH,
        height: HEIGHT,
        frame_rate: FrameRate::new(25, 1).unwrap(),
        frame_count: frames,
        codec: Some("scripted".into()),
        duration_secs: None,
    }
}

/// Frame `index` of every scripted video; distinct per index.
pub fn input_frame(index: u64) -> Frame {
    let rate = FrameRate::new(25, 1).unwrap();
    let shade = (index * 17 % 200) as u8;
    Frame::filled(WIDTH, HEIGHT, [shade, 60, 200 - shade], index, rate.timestamp_ms(index))
}

/// In-memory source yielding `frames` frames, optionally failing to decode
/// the frame at `fail_at`.
pub struct ScriptedSource {
    info: VideoInfo,
    frames: u64,
    next: u64,
    fail_at: Option<u64>,
    finished: bool,
    pub closes: Arc<AtomicUsize>,
}

impl ScriptedSource {
    pub fn new(frames: u64) -> Self {
        Self {
            info: video_info(frames),
            frames,
            next: 0,
            fail_at: None,
            finished: false,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn with_unknown_length(mut self) -> Self {
        self.info.frame_count = 0;
        self
    }

    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }
}

impl FrameSource for ScriptedSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.finished || self.next >= self.frames {
            self.finished = true;
            return Ok(None);
        }
        if self.fail_at == Some(self.next) {
            self.finished = true;
            return Err(SourceError::Decode {
                frame: self.next,
                reason: "corrupt packet".into(),
            });
        }
        let frame = input_frame(self.next);
        self.next += 1;
        Ok(Some(frame))
    }

    fn close(&mut self) {
        self.finished = true;
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct SinkLog {
    pub frames: Vec<Frame>,
    pub close_calls: usize,
}

/// Sink that keeps every written frame in a log shared with the test.
pub struct RecordingSink {
    spec: OutputSpec,
    path: Option<PathBuf>,
    log: Arc<Mutex<SinkLog>>,
    closed: Option<Result<SinkSummary, SinkError>>,
}

impl RecordingSink {
    pub fn new(spec: OutputSpec, log: Arc<Mutex<SinkLog>>) -> Self {
        Self {
            spec,
            path: Some(PathBuf::from("/virtual/annotated.mp4")),
            log,
            closed: None,
        }
    }
}

impl FrameSink for RecordingSink {
    fn spec(&self) -> &OutputSpec {
        &self.spec
    }

    fn write(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if self.closed.is_some() {
            return Err(SinkError::Closed);
        }
        check_dimensions(&self.spec, frame)?;
        self.log.lock().unwrap().frames.push(frame.clone());
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.log.lock().unwrap().frames.len() as u64
    }

    fn close(&mut self) -> Result<SinkSummary, SinkError> {
        let mut log = self.log.lock().unwrap();
        log.close_calls += 1;
        let frames_written = log.frames.len() as u64;
        drop(log);
        self.closed
            .get_or_insert_with(|| {
                if frames_written == 0 {
                    Err(SinkError::Empty {
                        path: PathBuf::from("/virtual/annotated.mp4"),
                    })
                } else {
                    Ok(SinkSummary {
                        path: self.path.clone(),
                        frames_written,
                        spec: self.spec,
                    })
                }
            })
            .clone()
    }
}

/// Detector returning the same boxes for every frame, with optional
/// per-frame failures and artificial latency.
#[derive(Default)]
pub struct ScriptedDetector {
    pub detections: Vec<Detection>,
    pub fail_on: Option<u64>,
    pub jitter: bool,
}

impl ScriptedDetector {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_boxes(scores: &[f32]) -> Self {
        let detections = scores
            .iter()
            .enumerate()
            .map(|(i, &score)| {
                let offset = 4.0 + 12.0 * i as f32;
                Detection::new(
                    BoundingBox::new(offset, offset / 2.0, 20.0, 16.0),
                    score,
                    i as u32,
                    format!("class{i}"),
                )
            })
            .collect();
        Self {
            detections,
            ..Self::default()
        }
    }

    pub fn failing_on(mut self, index: u64) -> Self {
        self.fail_on = Some(index);
        self
    }

    /// Sleep a frame-dependent amount so parallel workers finish out of order.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }
}

impl Detector for ScriptedDetector {
    fn detect(
        &self,
        frame: &Frame,
        _threshold: ConfidenceThreshold,
    ) -> Result<Vec<Detection>, DetectError> {
        if self.jitter {
            thread::sleep(Duration::from_millis(7 - frame.index() % 7));
        }
        if self.fail_on == Some(frame.index()) {
            return Err(DetectError::backend(frame, anyhow!("model exploded")));
        }
        Ok(self.detections.clone())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
