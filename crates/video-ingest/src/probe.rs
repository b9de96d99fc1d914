//! Stream metadata via `ffprobe -of json`.

use std::{path::Path, process::Command};

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::types::{FrameRate, VideoInfo};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to launch ffprobe: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("ffprobe rejected the input ({status}){stderr}")]
    Rejected { status: String, stderr: String },
    #[error("could not parse ffprobe output")]
    Parse(#[from] serde_json::Error),
    #[error("container has no video stream")]
    NoVideoStream,
    #[error("video stream has invalid dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("video stream has no usable frame rate (avg={avg:?}, r={real:?})")]
    InvalidFrameRate {
        avg: Option<String>,
        real: Option<String>,
    },
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// Probe the first video stream of `path`.
pub fn probe(ffprobe: &Path, path: &Path) -> Result<VideoInfo, ProbeError> {
    let output = Command::new(ffprobe)
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_streams",
            "-show_format",
            "-of",
            "json",
        ])
        .arg(path)
        .output()
        .map_err(ProbeError::Spawn)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ProbeError::Rejected {
            status: output.status.to_string(),
            stderr: crate::process::describe_stderr(&stderr),
        });
    }

    let info = parse_probe_output(&output.stdout)?;
    debug!(
        path = %path.display(),
        width = info.width,
        height = info.height,
        rate = %info.frame_rate,
        frames = info.frame_count,
        "probed video"
    );
    Ok(info)
}

/// Turn raw `ffprobe` JSON into [`VideoInfo`].
pub fn parse_probe_output(json: &[u8]) -> Result<VideoInfo, ProbeError> {
    let probe: FfprobeOutput = serde_json::from_slice(json)?;

    let stream = probe
        .streams
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideoStream)?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(ProbeError::InvalidDimensions { width, height });
    }

    // avg_frame_rate is "0/0" for some streams; r_frame_rate is the fallback.
    let frame_rate = stream
        .avg_frame_rate
        .as_deref()
        .and_then(|r| r.parse::<FrameRate>().ok())
        .or_else(|| {
            stream
                .r_frame_rate
                .as_deref()
                .and_then(|r| r.parse::<FrameRate>().ok())
        })
        .ok_or_else(|| ProbeError::InvalidFrameRate {
            avg: stream.avg_frame_rate.clone(),
            real: stream.r_frame_rate.clone(),
        })?;

    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let duration_secs = stream
        .duration
        .as_deref()
        .or_else(|| probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0);

    Ok(VideoInfo {
        width,
        height,
        frame_rate,
        frame_count,
        codec: stream.codec_name,
        duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MP4_PROBE: &str = r#"{
        "streams": [
            {"index": 0, "codec_name": "h264", "codec_type": "video", "width": 1280, "height": 720,
             "r_frame_rate": "30000/1001", "avg_frame_rate": "30000/1001",
             "duration": "10.010000", "nb_frames": "300"}
        ],
        "format": {"filename": "road.mp4", "duration": "10.010000"}
    }"#;

    #[test]
    fn parses_video_stream() {
        let info = parse_probe_output(MP4_PROBE.as_bytes()).unwrap();
        assert_eq!((info.width, info.height), (1280, 720));
        assert_eq!(info.frame_rate, FrameRate::new(30000, 1001).unwrap());
        assert_eq!(info.total_frames(), Some(300));
        assert_eq!(info.codec.as_deref(), Some("h264"));
        assert_eq!(info.duration_secs, Some(10.01));
    }

    #[test]
    fn missing_frame_count_is_unknown() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 640, "height": 480,
            "avg_frame_rate": "0/0", "r_frame_rate": "25/1"}],
            "format": {"duration": "2.0"}}"#;
        let info = parse_probe_output(json.as_bytes()).unwrap();
        assert_eq!(info.frame_count, 0);
        assert_eq!(info.total_frames(), None);
        assert_eq!(info.frame_rate, FrameRate::new(25, 1).unwrap());
        assert_eq!(info.duration_secs, Some(2.0));
    }

    #[test]
    fn audio_only_container_is_rejected() {
        let json = r#"{"streams": [{"codec_type": "audio", "codec_name": "aac"}]}"#;
        assert!(matches!(
            parse_probe_output(json.as_bytes()),
            Err(ProbeError::NoVideoStream)
        ));
        assert!(matches!(
            parse_probe_output(b"{}"),
            Err(ProbeError::NoVideoStream)
        ));
    }

    #[test]
    fn zero_sized_stream_is_rejected() {
        let json = r#"{"streams": [{"codec_type": "video", "width": 0, "height": 480,
            "avg_frame_rate": "25/1"}]}"#;
        assert!(matches!(
            parse_probe_output(json.as_bytes()),
            Err(ProbeError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            parse_probe_output(b"not json"),
            Err(ProbeError::Parse(_))
        ));
    }
}
