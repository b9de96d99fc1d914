use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Axis-aligned box in pixel coordinates, top-left origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from corner coordinates `(left, top, right, bottom)`.
    pub fn from_corners(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self::new(left, top, right - left, bottom - top)
    }

    /// Build from a centre point and size, the layout YOLO heads emit.
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self::new(cx - width / 2.0, cy - height / 2.0, width, height)
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union > 0.0 { intersection / union } else { 0.0 }
    }

    /// Clip the box to a `width`x`height` frame. Returns `None` when nothing
    /// of the box remains inside the frame or a coordinate is not finite.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<BoundingBox> {
        if ![self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
        {
            return None;
        }
        let (w, h) = (width as f32, height as f32);
        let left = self.x.clamp(0.0, w);
        let top = self.y.clamp(0.0, h);
        let right = self.right().clamp(0.0, w);
        let bottom = self.bottom().clamp(0.0, h);
        if right - left <= 0.0 || bottom - top <= 0.0 {
            return None;
        }
        Some(BoundingBox::from_corners(left, top, right, bottom))
    }
}

/// One detector finding for a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
    pub class_id: u32,
    pub label: String,
}

impl Detection {
    pub fn new(bbox: BoundingBox, score: f32, class_id: u32, label: impl Into<String>) -> Self {
        Self {
            bbox,
            score,
            class_id,
            label: label.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("confidence threshold must be within [0, 1], got {0}")]
pub struct ThresholdError(pub f32);

/// Minimum score a detection needs to be emitted; fixed for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct ConfidenceThreshold(f32);

impl ConfidenceThreshold {
    pub const DEFAULT: ConfidenceThreshold = ConfidenceThreshold(0.25);

    pub fn new(value: f32) -> Result<Self, ThresholdError> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ThresholdError(value))
        }
    }

    pub fn value(self) -> f32 {
        self.0
    }

    pub fn admits(self, score: f32) -> bool {
        score.is_finite() && (0.0..=1.0).contains(&score) && score >= self.0
    }
}

impl Default for ConfidenceThreshold {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ConfidenceThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

/// Detections admitted for one frame, in detector order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionSet {
    detections: Vec<Detection>,
}

impl DetectionSet {
    /// Apply the run's threshold and the frame bounds to raw detector output.
    ///
    /// Scores outside `[0, 1]` or below the threshold are dropped, boxes are
    /// clipped to the frame and boxes with no area left are dropped. Order of
    /// the surviving detections is preserved.
    pub fn admit(
        raw: Vec<Detection>,
        threshold: ConfidenceThreshold,
        width: u32,
        height: u32,
    ) -> Self {
        let detections = raw
            .into_iter()
            .filter(|det| threshold.admits(det.score))
            .filter_map(|det| {
                let bbox = det.bbox.clamp_to(width, height)?;
                Some(Detection { bbox, ..det })
            })
            .collect();
        Self { detections }
    }

    pub fn as_slice(&self) -> &[Detection] {
        &self.detections
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn into_vec(self) -> Vec<Detection> {
        self.detections
    }
}

/// Greedy per-class non-maximum suppression.
///
/// Survivors are returned highest score first.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }
    keep
}
