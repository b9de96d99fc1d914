//! Shared plumbing for the ffmpeg/ffprobe child processes.

use std::{
    io::Read,
    path::PathBuf,
    process::ChildStderr,
    thread::{self, JoinHandle},
};

/// Keep only the tail of stderr; ffmpeg repeats the same error per packet.
const STDERR_TAIL_BYTES: usize = 4 * 1024;

/// Locations of the ffmpeg binaries; defaults to resolving them on `PATH`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FfmpegBinaries {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl Default for FfmpegBinaries {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
        }
    }
}

/// Drains a child's stderr on a helper thread so the pipe never fills up.
pub(crate) struct StderrTail {
    handle: JoinHandle<String>,
}

impl StderrTail {
    pub(crate) fn spawn(mut stderr: ChildStderr) -> Self {
        let handle = thread::spawn(move || {
            let mut collected = Vec::new();
            let _ = stderr.read_to_end(&mut collected);
            let start = collected.len().saturating_sub(STDERR_TAIL_BYTES);
            String::from_utf8_lossy(&collected[start..]).trim().to_string()
        });
        Self { handle }
    }

    /// Wait for the pipe to close and return what was captured.
    pub(crate) fn finish(self) -> String {
        self.handle.join().unwrap_or_default()
    }
}

pub(crate) fn describe_stderr(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}
