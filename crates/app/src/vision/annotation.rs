//! Overlay compositing: boxes, labels and an optional HUD drawn with a
//! built-in 5x7 bitmap font.

use image::{Rgb, RgbImage};
use ml_core::Detection;
use serde::Serialize;
use thiserror::Error;
use video_ingest::Frame;

const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = GLYPH_WIDTH + 1;

/// Per-class box colours (Ultralytics palette).
const PALETTE: [[u8; 3]; 20] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
    [0x2C, 0x99, 0xA8],
    [0x00, 0xC2, 0xFF],
    [0x34, 0x45, 0x93],
    [0x64, 0x73, 0xFF],
    [0x00, 0x18, 0xEC],
    [0x84, 0x38, 0xFF],
    [0x52, 0x00, 0x85],
    [0xCB, 0x38, 0xFF],
    [0xFF, 0x95, 0xC8],
    [0xFF, 0x37, 0xC7],
];

#[derive(Debug, Error)]
#[error("failed to annotate frame {frame}: {reason}")]
pub struct AnnotateError {
    pub frame: u64,
    pub reason: String,
}

/// Draws a frame's detections into a copy of the frame.
///
/// Implementations must be deterministic, must not modify the input and must
/// return a frame of the same size, index and timestamp.
pub trait Annotator: Send + Sync {
    fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame, AnnotateError>;
}

impl<A: Annotator + ?Sized> Annotator for &A {
    fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame, AnnotateError> {
        (**self).annotate(frame, detections)
    }
}

impl<A: Annotator + ?Sized> Annotator for std::sync::Arc<A> {
    fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame, AnnotateError> {
        (**self).annotate(frame, detections)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AnnotationStyle {
    /// Box outline width in pixels; derived from the frame size when unset.
    pub line_width: Option<u32>,
    pub show_labels: bool,
    pub show_scores: bool,
    /// Frame counter in the bottom-right corner. Off by default so frames
    /// without detections pass through untouched.
    pub hud: bool,
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self {
            line_width: None,
            show_labels: true,
            show_scores: true,
            hud: false,
        }
    }
}

/// CPU box-and-label renderer.
#[derive(Clone, Copy, Debug, Default)]
pub struct BoxAnnotator {
    style: AnnotationStyle,
}

impl BoxAnnotator {
    pub fn new(style: AnnotationStyle) -> Self {
        Self { style }
    }

    pub fn style(&self) -> &AnnotationStyle {
        &self.style
    }

    fn line_width(&self, width: u32, height: u32) -> i32 {
        match self.style.line_width {
            Some(lw) => lw.max(1) as i32,
            None => ((width + height) as f32 / 2.0 * 0.003).round().max(2.0) as i32,
        }
    }

    fn label_text(&self, det: &Detection) -> Option<String> {
        match (self.style.show_labels, self.style.show_scores) {
            (true, true) => Some(format!("{} {:.0}%", det.label, det.score * 100.0)),
            (true, false) => Some(det.label.clone()),
            (false, true) => Some(format!("{:.0}%", det.score * 100.0)),
            (false, false) => None,
        }
    }
}

impl Annotator for BoxAnnotator {
    fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame, AnnotateError> {
        let mut image = frame.to_image();
        let (width, height) = image.dimensions();
        let line_width = self.line_width(width, height);
        let scale = (line_width / 2).max(1);

        // Box and label together per detection, so later detections sit on top.
        for det in detections {
            let color = Rgb(class_color(det.class_id));
            let left = det.bbox.x.round() as i32;
            let top = det.bbox.y.round() as i32;
            let right = det.bbox.right().round() as i32 - 1;
            let bottom = det.bbox.bottom().round() as i32 - 1;
            for inset in 0..line_width {
                draw_rectangle(
                    &mut image,
                    left + inset,
                    top + inset,
                    right - inset,
                    bottom - inset,
                    color,
                );
            }

            if let Some(text) = self.label_text(det) {
                let text_width = text_width(&text, scale);
                let text_height = GLYPH_HEIGHT * scale;
                let pad = scale;
                let label_h = text_height + 2 * pad;
                let label_y = if top - label_h >= 0 { top - label_h } else { top };
                fill_rect(
                    &mut image,
                    left,
                    label_y,
                    left + text_width + 2 * pad - 1,
                    label_y + label_h - 1,
                    color,
                );
                draw_label(
                    &mut image,
                    left + pad,
                    label_y + pad,
                    &text,
                    scale,
                    contrast_text(color),
                );
            }
        }

        if self.style.hud {
            let info = format!("FRAME {:06}  {} DET", frame.index(), detections.len());
            let info_width = text_width(&info, 1).min(width as i32);
            let info_x = (width as i32 - info_width - 4).max(0);
            let info_y = (height as i32 - 12).max(0);
            fill_rect(
                &mut image,
                info_x,
                info_y,
                info_x + info_width + 3,
                info_y + GLYPH_HEIGHT + 1,
                Rgb([0, 0, 0]),
            );
            draw_label(&mut image, info_x + 2, info_y + 1, &info, 1, Rgb([255, 255, 255]));
        }

        Ok(Frame::from_image(image, frame.index(), frame.timestamp_ms()))
    }
}

pub(crate) fn class_color(class_id: u32) -> [u8; 3] {
    PALETTE[class_id as usize % PALETTE.len()]
}

fn contrast_text(background: Rgb<u8>) -> Rgb<u8> {
    let [r, g, b] = background.0;
    let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
    if luma > 150.0 {
        Rgb([0, 0, 0])
    } else {
        Rgb([255, 255, 255])
    }
}

fn text_width(text: &str, scale: i32) -> i32 {
    let chars = text.chars().count() as i32;
    (chars * GLYPH_ADVANCE - 1).max(0) * scale
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    if right < left || bottom < top {
        return;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;
    let x0 = left.clamp(0, width - 1);
    let x1 = right.clamp(0, width - 1);
    let y0 = top.clamp(0, height - 1);
    let y1 = bottom.clamp(0, height - 1);

    for x in x0..=x1 {
        if (0..height).contains(&top) {
            image.put_pixel(x as u32, top as u32, color);
        }
        if (0..height).contains(&bottom) {
            image.put_pixel(x as u32, bottom as u32, color);
        }
    }
    for y in y0..=y1 {
        if (0..width).contains(&left) {
            image.put_pixel(left as u32, y as u32, color);
        }
        if (0..width).contains(&right) {
            image.put_pixel(right as u32, y as u32, color);
        }
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let x0 = left.max(0);
    let x1 = right.min(width - 1);
    let y0 = top.max(0);
    let y1 = bottom.min(height - 1);
    if x1 < x0 || y1 < y0 {
        return;
    }
    for y in y0..=y1 {
        for x in x0..=x1 {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, scale: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = x + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if (0..width).contains(&px) && (0..height).contains(&py) {
                                image.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0b00000],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '_' => [0, 0, 0, 0, 0, 0, 0b11111],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use ml_core::BoundingBox;

    use super::*;

    fn gray(width: u32, height: u32) -> Frame {
        Frame::filled(width, height, [90, 90, 90], 3, 120)
    }

    fn det(x: f32, y: f32, w: f32, h: f32, class_id: u32) -> Detection {
        Detection::new(BoundingBox::new(x, y, w, h), 0.8, class_id, "pothole")
    }

    #[test]
    fn no_detections_leaves_pixels_untouched() {
        let frame = gray(32, 24);
        let out = BoxAnnotator::default().annotate(&frame, &[]).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    fn output_is_a_new_frame_with_same_identity() {
        let frame = gray(64, 48);
        let before = frame.clone();
        let out = BoxAnnotator::default()
            .annotate(&frame, &[det(10.0, 20.0, 20.0, 20.0, 0)])
            .unwrap();
        assert_eq!(frame, before);
        assert_eq!(out.dimensions(), frame.dimensions());
        assert_eq!(out.index(), 3);
        assert_eq!(out.timestamp_ms(), 120);
        assert_ne!(out.data(), frame.data());
    }

    #[test]
    fn outline_uses_the_class_colour() {
        let style = AnnotationStyle {
            line_width: Some(1),
            show_labels: false,
            show_scores: false,
            hud: false,
        };
        let out = BoxAnnotator::new(style)
            .annotate(&gray(40, 40), &[det(10.0, 10.0, 10.0, 10.0, 2)])
            .unwrap()
            .to_image();
        assert_eq!(out.get_pixel(10, 10).0, class_color(2));
        assert_eq!(out.get_pixel(19, 19).0, class_color(2));
        assert_eq!(out.get_pixel(15, 15).0, [90, 90, 90]);
        assert_eq!(out.get_pixel(20, 20).0, [90, 90, 90]);
    }

    #[test]
    fn later_detections_draw_on_top() {
        let style = AnnotationStyle {
            line_width: Some(1),
            show_labels: false,
            show_scores: false,
            hud: false,
        };
        let annotator = BoxAnnotator::new(style);
        let first = det(5.0, 5.0, 10.0, 10.0, 0);
        let second = det(5.0, 5.0, 10.0, 10.0, 1);
        let out = annotator
            .annotate(&gray(32, 32), &[first.clone(), second.clone()])
            .unwrap()
            .to_image();
        assert_eq!(out.get_pixel(5, 5).0, class_color(1));
        let out = annotator
            .annotate(&gray(32, 32), &[second, first])
            .unwrap()
            .to_image();
        assert_eq!(out.get_pixel(5, 5).0, class_color(0));
    }

    #[test]
    fn annotation_is_deterministic() {
        let frame = gray(96, 64);
        let dets = [det(-4.0, 30.0, 50.0, 40.0, 5), det(60.0, 2.0, 30.0, 10.0, 7)];
        let annotator = BoxAnnotator::new(AnnotationStyle {
            hud: true,
            ..AnnotationStyle::default()
        });
        let a = annotator.annotate(&frame, &dets).unwrap();
        let b = annotator.annotate(&frame, &dets).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn every_letter_and_digit_has_a_glyph() {
        for ch in ('A'..='Z').chain('0'..='9') {
            assert!(glyph_bits(ch).is_some(), "missing glyph for {ch}");
        }
        assert!(glyph_bits('~').is_none());
    }

    #[test]
    fn text_width_counts_advance() {
        assert_eq!(text_width("", 1), 0);
        assert_eq!(text_width("AB", 1), 11);
        assert_eq!(text_width("AB", 2), 22);
    }
}
