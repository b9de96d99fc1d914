//! Frame sources: the [`FrameSource`] contract and its ffmpeg implementation.

use std::{
    io::{self, Read},
    path::Path,
    process::{Child, Command, Stdio},
    thread::{self, JoinHandle},
};

use anyhow::anyhow;
use crossbeam_channel::{Receiver, Sender, bounded};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    probe::{self, ProbeError},
    process::{FfmpegBinaries, StderrTail, describe_stderr},
    types::{Frame, FrameFormat, VideoInfo},
};

/// Decoded frames buffered ahead of the consumer.
const DECODE_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open video source {uri:?}")]
    Open {
        uri: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to probe video source {uri:?}")]
    Probe {
        uri: String,
        #[source]
        source: ProbeError,
    },
    #[error("decode failed at frame index {frame}: {reason}")]
    Decode { frame: u64, reason: String },
}

/// Sequential reader over the frames of one video.
///
/// `next_frame` returns `Ok(None)` at end of stream and keeps returning it on
/// later calls, including after a reported decode failure or `close`.
pub trait FrameSource {
    fn info(&self) -> &VideoInfo;

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Release the underlying decoder. Safe to call more than once.
    fn close(&mut self);
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn info(&self) -> &VideoInfo {
        (**self).info()
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        (**self).next_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StreamState {
    Streaming,
    Finished,
    Closed,
}

/// Decodes a video file through an `ffmpeg` child process writing `rawvideo`
/// RGB24 frames to stdout.
pub struct FfmpegSource {
    uri: String,
    info: VideoInfo,
    child: Option<Child>,
    frames: Option<Receiver<io::Result<Vec<u8>>>>,
    reader: Option<JoinHandle<()>>,
    stderr: Option<StderrTail>,
    next_index: u64,
    state: StreamState,
}

impl FfmpegSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        Self::open_with(path, &FfmpegBinaries::default())
    }

    pub fn open_with(path: impl AsRef<Path>, binaries: &FfmpegBinaries) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let uri = path.display().to_string();

        if !path.is_file() {
            return Err(SourceError::Open {
                uri,
                source: anyhow!("no such file"),
            });
        }

        let info = probe::probe(&binaries.ffprobe, path).map_err(|source| SourceError::Probe {
            uri: uri.clone(),
            source,
        })?;

        let mut cmd = Command::new(&binaries.ffmpeg);
        cmd.arg("-hide_banner")
            .arg("-nostdin")
            .arg("-loglevel")
            .arg("error")
            // Keep coded dimensions so frames match what ffprobe reported.
            .arg("-noautorotate")
            .arg("-i")
            .arg(path)
            .arg("-map")
            .arg("0:v:0")
            .arg("-an")
            .arg("-sn")
            .arg("-vsync")
            .arg("0")
            .arg("-pix_fmt")
            .arg(FrameFormat::Rgb8.ffmpeg_pix_fmt())
            .arg("-f")
            .arg("rawvideo")
            .arg("-")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| SourceError::Open {
            uri: uri.clone(),
            source: anyhow::Error::new(err).context("failed to launch ffmpeg"),
        })?;

        let stderr = child.stderr.take().map(StderrTail::spawn);
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SourceError::Open {
                uri,
                source: anyhow!("failed to capture ffmpeg stdout"),
            });
        };

        let (tx, rx) = bounded(DECODE_QUEUE_DEPTH);
        let frame_len = info.frame_len();
        let reader = thread::Builder::new()
            .name("ffmpeg-decode".into())
            .spawn(move || decode_loop(stdout, frame_len, tx));
        let reader = match reader {
            Ok(handle) => handle,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SourceError::Open {
                    uri,
                    source: anyhow::Error::new(err).context("failed to spawn decode thread"),
                });
            }
        };

        debug!(
            source = %uri,
            width = info.width,
            height = info.height,
            rate = %info.frame_rate,
            frames = info.frame_count,
            "opened ffmpeg frame source"
        );

        Ok(Self {
            uri,
            info,
            child: Some(child),
            frames: Some(rx),
            reader: Some(reader),
            stderr,
            next_index: 0,
            state: StreamState::Streaming,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Reap the decoder after the frame channel drained and report how it exited.
    ///
    /// With `kill` the child is stopped first; after a pipe read error nothing
    /// drains its stdout any more, so it may never exit on its own.
    fn finish_stream(&mut self, kill: bool) -> Result<(), String> {
        if kill {
            if let Some(child) = self.child.as_mut() {
                let _ = child.kill();
            }
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        let status = match self.child.take() {
            Some(mut child) => child.wait().map_err(|err| err.to_string())?,
            None => return Ok(()),
        };
        let stderr = self.stderr.take().map(StderrTail::finish).unwrap_or_default();
        if status.success() {
            if !stderr.is_empty() {
                debug!(source = %self.uri, "ffmpeg decoder diagnostics: {stderr}");
            }
            Ok(())
        } else {
            Err(format!("ffmpeg exited with {status}{}", describe_stderr(&stderr)))
        }
    }
}

impl FrameSource for FfmpegSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.state != StreamState::Streaming {
            return Ok(None);
        }
        let Some(frames) = self.frames.as_ref() else {
            return Ok(None);
        };

        match frames.recv() {
            Ok(Ok(data)) => {
                let index = self.next_index;
                self.next_index += 1;
                let timestamp_ms = self.info.frame_rate.timestamp_ms(index);
                Frame::new(data, self.info.width, self.info.height, index, timestamp_ms)
                    .map(Some)
                    .map_err(|err| {
                        self.state = StreamState::Finished;
                        SourceError::Decode {
                            frame: index,
                            reason: err.to_string(),
                        }
                    })
            }
            Ok(Err(err)) => {
                self.state = StreamState::Finished;
                self.frames = None;
                let detail = match self.finish_stream(true) {
                    Ok(()) => String::new(),
                    Err(exit) => format!(" ({exit})"),
                };
                Err(SourceError::Decode {
                    frame: self.next_index,
                    reason: format!("{err}{detail}"),
                })
            }
            Err(_) => {
                self.state = StreamState::Finished;
                self.frames = None;
                match self.finish_stream(false) {
                    Ok(()) => {
                        debug!(source = %self.uri, frames = self.next_index, "end of stream");
                        Ok(None)
                    }
                    Err(reason) => Err(SourceError::Decode {
                        frame: self.next_index,
                        reason,
                    }),
                }
            }
        }
    }

    fn close(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.state = StreamState::Closed;

        // Dropping the receiver unblocks a reader stuck on a full queue.
        self.frames = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            if let Err(err) = child.wait() {
                warn!(source = %self.uri, "failed to reap ffmpeg decoder: {err}");
            }
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(stderr) = self.stderr.take() {
            let _ = stderr.finish();
        }
        debug!(source = %self.uri, frames = self.next_index, "closed frame source");
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_loop(mut stdout: impl Read, frame_len: usize, tx: Sender<io::Result<Vec<u8>>>) {
    loop {
        let mut buffer = vec![0u8; frame_len];
        match read_frame(&mut stdout, &mut buffer) {
            Ok(true) => {
                if tx.send(Ok(buffer)).is_err() {
                    break;
                }
            }
            Ok(false) => break,
            Err(err) => {
                let _ = tx.send(Err(err));
                break;
            }
        }
    }
}

/// Fill `buffer` with exactly one frame.
///
/// Returns `Ok(false)` on a clean end of stream at a frame boundary and an
/// `UnexpectedEof` error when the stream stops mid-frame.
pub(crate) fn read_frame(reader: &mut impl Read, buffer: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("truncated frame: got {filled} of {} bytes", buffer.len()),
                ));
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn reads_whole_frames_then_clean_eof() {
        let mut reader = Cursor::new(vec![1u8; 12]);
        let mut buffer = [0u8; 6];
        assert!(read_frame(&mut reader, &mut buffer).unwrap());
        assert!(read_frame(&mut reader, &mut buffer).unwrap());
        assert!(!read_frame(&mut reader, &mut buffer).unwrap());
    }

    #[test]
    fn partial_trailing_frame_is_an_error() {
        let mut reader = Cursor::new(vec![7u8; 8]);
        let mut buffer = [0u8; 6];
        assert!(read_frame(&mut reader, &mut buffer).unwrap());
        let err = read_frame(&mut reader, &mut buffer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn decode_loop_forwards_frames_in_order() {
        let bytes: Vec<u8> = (0..9u8).collect();
        let (tx, rx) = bounded(8);
        decode_loop(Cursor::new(bytes), 3, tx);
        let frames: Vec<Vec<u8>> = rx.iter().map(|f| f.unwrap()).collect();
        assert_eq!(frames, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7, 8]]);
    }

    #[cfg(unix)]
    #[test]
    fn pipe_error_stops_a_decoder_that_keeps_running() {
        use std::time::{Duration, Instant};

        use crate::types::FrameRate;

        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let (tx, rx) = bounded(1);
        tx.send(Err(io::Error::other("pipe broke"))).unwrap();
        let mut source = FfmpegSource {
            uri: "stuck.mp4".into(),
            info: VideoInfo {
                width: 2,
                height: 2,
                frame_rate: FrameRate::new(25, 1).unwrap(),
                frame_count: 0,
                codec: None,
                duration_secs: None,
            },
            child: Some(child),
            frames: Some(rx),
            reader: None,
            stderr: None,
            next_index: 3,
            state: StreamState::Streaming,
        };

        let started = Instant::now();
        let err = source.next_frame().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            SourceError::Decode { frame, reason } => {
                assert_eq!(frame, 3);
                assert!(reason.starts_with("pipe broke"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn missing_file_fails_to_open() {
        let err = FfmpegSource::open("/definitely/not/here.mp4").err().unwrap();
        assert!(matches!(err, SourceError::Open { .. }));
    }
}
