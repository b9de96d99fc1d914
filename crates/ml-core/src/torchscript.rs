//! TorchScript-backed YOLOv8 detector (`with-tch` feature).

use std::{convert::TryFrom, path::Path, sync::Mutex};

use anyhow::{Context, Result, anyhow, bail};
use image::imageops::{self, FilterType};
use tch::{CModule, Device, Kind, Tensor};
use tracing::debug;
use video_ingest::Frame;

use crate::{
    detection::{BoundingBox, ConfidenceThreshold, Detection, non_max_suppression},
    detector::{DetectError, Detector},
    labels::LabelMap,
};

const DEFAULT_INPUT_SIZE: (i64, i64) = (640, 640);
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;
const MAX_DETECTIONS: usize = 300;

/// Runs an exported YOLOv8 TorchScript module on each frame.
///
/// Frames are resized to the network input, so boxes are scaled back to the
/// frame's own pixel grid before they are returned.
pub struct TorchScriptDetector {
    module: Mutex<CModule>,
    device: Device,
    input_size: (i64, i64),
    iou_threshold: f32,
    labels: LabelMap,
    name: String,
}

impl TorchScriptDetector {
    pub fn load<P: AsRef<Path>>(model_path: P, device: Device, labels: LabelMap) -> Result<Self> {
        let model_path = model_path.as_ref();
        let module = CModule::load_on_device(model_path, device)
            .with_context(|| format!("failed to load TorchScript model {}", model_path.display()))?;
        let name = model_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "torchscript".to_string());
        debug!(model = %model_path.display(), ?device, "loaded detector");
        Ok(Self {
            module: Mutex::new(module),
            device,
            input_size: DEFAULT_INPUT_SIZE,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            labels,
            name,
        })
    }

    /// Pick CUDA when available, CPU otherwise.
    pub fn default_device() -> Device {
        Device::cuda_if_available()
    }

    pub fn with_input_size(mut self, width: i64, height: i64) -> Self {
        self.input_size = (width, height);
        self
    }

    pub fn with_iou_threshold(mut self, iou: f32) -> Self {
        self.iou_threshold = iou;
        self
    }

    /// Converts an RGB frame into a normalized `[1, 3, H, W]` tensor.
    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor> {
        let (in_w, in_h) = self.input_size;
        let resized;
        let pixels: &[u8] = if frame.dimensions() == (in_w as u32, in_h as u32) {
            frame.data()
        } else {
            resized = imageops::resize(
                &frame.to_image(),
                in_w as u32,
                in_h as u32,
                FilterType::Triangle,
            );
            resized.as_raw()
        };

        let tensor = Tensor::from_slice(pixels)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .permute([0, 3, 1, 2])
            / 255.0;
        Ok(tensor)
    }

    /// Decode a `[1, 4 + classes, anchors]` YOLOv8 head into detections in
    /// frame coordinates.
    fn decode(&self, output: &Tensor, frame: &Frame, threshold: ConfidenceThreshold) -> Result<Vec<Detection>> {
        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (x,y,w,h,class), got {}",
                shape[1]
            );
        }

        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(
            &output
                .to_device(Device::Cpu)
                .squeeze_dim(0)
                .permute([1, 0])
                .contiguous(),
        )?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame.width() as f32 / in_w as f32;
        let scale_y = frame.height() as f32 / in_h as f32;

        let mut candidates = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if !threshold.admits(score) {
                continue;
            }
            let bbox = BoundingBox::from_center(
                row[0] * scale_x,
                row[1] * scale_y,
                row[2] * scale_x,
                row[3] * scale_y,
            );
            let class_id = class_id as u32;
            candidates.push(Detection::new(
                bbox,
                score,
                class_id,
                self.labels.name(class_id),
            ));
        }

        let mut kept = non_max_suppression(candidates, self.iou_threshold);
        kept.truncate(MAX_DETECTIONS);
        Ok(kept)
    }

    fn infer(&self, frame: &Frame, threshold: ConfidenceThreshold) -> Result<Vec<Detection>> {
        let input = self.frame_to_tensor(frame)?;
        let module = self
            .module
            .lock()
            .map_err(|_| anyhow!("detector module lock poisoned"))?;
        let output = tch::no_grad(|| module.forward_ts(&[input]))?;
        drop(module);
        self.decode(&output, frame, threshold)
    }
}

impl Detector for TorchScriptDetector {
    fn detect(
        &self,
        frame: &Frame,
        threshold: ConfidenceThreshold,
    ) -> Result<Vec<Detection>, DetectError> {
        self.infer(frame, threshold)
            .map_err(|err| DetectError::backend(frame, err))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
