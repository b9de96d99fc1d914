use std::{fmt, str::FromStr};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

/// Decoded frame handed through the pipeline.
///
/// The pixel buffer always holds `width * height * bytes_per_pixel` bytes; the
/// constructors enforce this so downstream stages can index without checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    index: u64,
    timestamp_ms: i64,
    format: FrameFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FrameFormat {
    Rgb8,
}

impl FrameFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            FrameFormat::Rgb8 => 3,
        }
    }

    /// Pixel format name understood by ffmpeg's `rawvideo` muxer/demuxer.
    pub fn ffmpeg_pix_fmt(self) -> &'static str {
        match self {
            FrameFormat::Rgb8 => "rgb24",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame dimensions must be positive, got {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },
    #[error("unexpected frame buffer size: got {actual} bytes, expected {expected}")]
    BufferSize { expected: usize, actual: usize },
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        index: u64,
        timestamp_ms: i64,
    ) -> Result<Self, FrameError> {
        if width == 0 || height == 0 {
            return Err(FrameError::EmptyDimensions { width, height });
        }
        let expected = frame_len(width, height, FrameFormat::Rgb8);
        if data.len() != expected {
            return Err(FrameError::BufferSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            index,
            timestamp_ms,
            format: FrameFormat::Rgb8,
        })
    }

    /// Solid-colour frame, mostly useful for synthetic sources.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3], index: u64, timestamp_ms: i64) -> Self {
        let image = RgbImage::from_pixel(width.max(1), height.max(1), image::Rgb(rgb));
        Self::from_image(image, index, timestamp_ms)
    }

    pub fn from_image(image: RgbImage, index: u64, timestamp_ms: i64) -> Self {
        let (width, height) = image.dimensions();
        Self {
            data: image.into_raw(),
            width,
            height,
            index,
            timestamp_ms,
            format: FrameFormat::Rgb8,
        }
    }

    /// Copy the pixels into a fresh [`RgbImage`]; the frame itself is untouched.
    pub fn to_image(&self) -> RgbImage {
        let mut image = RgbImage::new(self.width, self.height);
        image.copy_from_slice(&self.data);
        image
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Zero-based position of the frame in its source stream.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn format(&self) -> FrameFormat {
        self.format
    }
}

pub fn frame_len(width: u32, height: u32, format: FrameFormat) -> usize {
    (width as usize) * (height as usize) * format.bytes_per_pixel()
}

/// Exact rational frame rate, e.g. `30000/1001` for NTSC material.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub fn new(num: u32, den: u32) -> Option<Self> {
        if num == 0 || den == 0 {
            return None;
        }
        let divisor = gcd(num, den);
        Some(Self {
            num: num / divisor,
            den: den / divisor,
        })
    }

    pub fn as_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    /// Presentation timestamp of the `index`-th frame in milliseconds.
    pub fn timestamp_ms(self, index: u64) -> i64 {
        let millis = (index as u128 * 1_000 * self.den as u128) / self.num as u128;
        i64::try_from(millis).unwrap_or(i64::MAX)
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

impl FromStr for FrameRate {
    type Err = String;

    /// Accepts `num/den`, integers and decimals (`29.97` becomes `2997/100`).
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let invalid = || format!("invalid frame rate {value:?}");

        if let Some((num, den)) = value.split_once('/') {
            let num = num.trim().parse::<u32>().map_err(|_| invalid())?;
            let den = den.trim().parse::<u32>().map_err(|_| invalid())?;
            return FrameRate::new(num, den).ok_or_else(invalid);
        }

        if let Ok(whole) = value.parse::<u32>() {
            return FrameRate::new(whole, 1).ok_or_else(invalid);
        }

        let decimal = value.parse::<f64>().map_err(|_| invalid())?;
        if !decimal.is_finite() || decimal <= 0.0 || decimal > u32::MAX as f64 / 1_000.0 {
            return Err(invalid());
        }
        FrameRate::new((decimal * 1_000.0).round() as u32, 1_000).ok_or_else(invalid)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Stream metadata for an opened video.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: FrameRate,
    /// Number of frames reported by the container; `0` when unknown.
    pub frame_count: u64,
    pub codec: Option<String>,
    pub duration_secs: Option<f64>,
}

impl VideoInfo {
    pub fn total_frames(&self) -> Option<u64> {
        (self.frame_count > 0).then_some(self.frame_count)
    }

    pub fn frame_len(&self) -> usize {
        frame_len(self.width, self.height, FrameFormat::Rgb8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_mismatched_buffer() {
        let err = Frame::new(vec![0; 10], 2, 2, 0, 0).unwrap_err();
        assert_eq!(
            err,
            FrameError::BufferSize {
                expected: 12,
                actual: 10
            }
        );
        assert!(matches!(
            Frame::new(Vec::new(), 0, 4, 0, 0),
            Err(FrameError::EmptyDimensions { .. })
        ));
    }

    #[test]
    fn to_image_leaves_frame_untouched() {
        let frame = Frame::filled(3, 2, [10, 20, 30], 4, 133);
        let mut image = frame.to_image();
        image.put_pixel(0, 0, image::Rgb([0, 0, 0]));
        assert_eq!(&frame.data()[..3], &[10, 20, 30]);
        assert_eq!(frame.index(), 4);
        assert_eq!(frame.timestamp_ms(), 133);
    }

    #[test]
    fn frame_rate_parses_ffprobe_forms() {
        assert_eq!(
            "30000/1001".parse::<FrameRate>().unwrap(),
            FrameRate {
                num: 30000,
                den: 1001
            }
        );
        assert_eq!(
            "50/2".parse::<FrameRate>().unwrap(),
            FrameRate { num: 25, den: 1 }
        );
        assert_eq!(
            "24".parse::<FrameRate>().unwrap(),
            FrameRate { num: 24, den: 1 }
        );
        assert_eq!(
            "29.97".parse::<FrameRate>().unwrap(),
            FrameRate {
                num: 2997,
                den: 100
            }
        );
        assert!("0/0".parse::<FrameRate>().is_err());
        assert!("fast".parse::<FrameRate>().is_err());
    }

    #[test]
    fn timestamps_follow_rational_rate() {
        let ntsc = FrameRate::new(30000, 1001).unwrap();
        assert_eq!(ntsc.timestamp_ms(0), 0);
        assert_eq!(ntsc.timestamp_ms(30), 1001);
        assert_eq!(ntsc.to_string(), "30000/1001");
    }

    #[test]
    fn unknown_frame_count_is_none() {
        let info = VideoInfo {
            width: 4,
            height: 2,
            frame_rate: FrameRate::new(25, 1).unwrap(),
            frame_count: 0,
            codec: None,
            duration_secs: None,
        };
        assert_eq!(info.total_frames(), None);
        assert_eq!(info.frame_len(), 24);
    }
}
