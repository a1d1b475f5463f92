//! Burn inference backend for vehicle detection.
//!
//! This module provides a `BurnEngine` that implements `InferenceEngine`
//! for running detection models built with the Burn framework.
//!
//! # Example
//!
//! ```ignore
//! use vehicle_count_rs::detector::{BurnEngine, BurnModel, ModelOutput};
//! use burn::backend::NdArray;
//!
//! struct MyYoloModel { /* ... */ }
//!
//! impl BurnModel<NdArray> for MyYoloModel {
//!     fn forward(&self, input: burn::tensor::Tensor<NdArray, 4>) -> Vec<ModelOutput> {
//!         // Run inference
//!     }
//! }
//!
//! let engine = BurnEngine::new(MyYoloModel::load("model.bin"), Default::default());
//! ```

use burn::prelude::*;
use burn::tensor::Tensor;
use image::{RgbImage, imageops::FilterType};

use super::DetectionBuilder;
use super::engine::{EngineError, InferenceEngine, InferenceSettings, RawDetection};
use crate::config::{Device as ComputeDevice, Precision};
use crate::source::Frame;

/// One box as produced by the model, in model input coordinates.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// [x1, y1, x2, y2] or [cx, cy, w, h] depending on the model.
    pub bbox: [f32; 4],
    pub score: f32,
    /// COCO class id.
    pub class_id: usize,
}

/// Trait for Burn-based detection models.
pub trait BurnModel<B: Backend>: Send + Sync {
    /// Forward pass on a `[1, 3, height, width]` tensor scaled to [0, 1].
    fn forward(&self, input: Tensor<B, 4>) -> Vec<ModelOutput>;

    /// Whether bbox output is in XYWH format (vs TLBR).
    fn bbox_is_xywh(&self) -> bool {
        true
    }

    /// Whether the backend device is an accelerator.
    fn on_gpu(&self) -> bool {
        false
    }

    fn supports_half(&self) -> bool {
        false
    }
}

/// Burn-based detector implementing `InferenceEngine`.
pub struct BurnEngine<B: Backend, M: BurnModel<B>> {
    model: M,
    device: B::Device,
}

impl<B: Backend, M: BurnModel<B>> BurnEngine<B, M> {
    pub fn new(model: M, device: B::Device) -> Self {
        Self { model, device }
    }

    /// Resize the frame to the model input and lay it out as NCHW floats.
    fn preprocess(&self, frame: &Frame, input_shape: [u32; 2]) -> Result<Tensor<B, 4>, EngineError> {
        let [target_w, target_h] = input_shape;
        let image = RgbImage::from_raw(frame.width(), frame.height(), frame.pixels().to_vec())
            .ok_or_else(|| {
                EngineError::Inference(format!(
                    "frame {} has {} bytes, expected {}x{}x3",
                    frame.seq(),
                    frame.pixels().len(),
                    frame.width(),
                    frame.height()
                ))
            })?;
        let resized = image::imageops::resize(&image, target_w, target_h, FilterType::Triangle);

        let plane = (target_w * target_h) as usize;
        let mut data = vec![0.0f32; plane * 3];
        for (i, pixel) in resized.pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] = pixel[c] as f32 / 255.0;
            }
        }

        Ok(Tensor::<B, 1>::from_floats(data.as_slice(), &self.device).reshape([
            1,
            3,
            target_h as usize,
            target_w as usize,
        ]))
    }

    /// Map model boxes back to frame pixels.
    fn postprocess(&self, outputs: Vec<ModelOutput>, frame: &Frame, input_shape: [u32; 2]) -> Vec<RawDetection> {
        let sx = frame.width() as f32 / input_shape[0] as f32;
        let sy = frame.height() as f32 / input_shape[1] as f32;
        outputs
            .into_iter()
            .map(|o| {
                let [a, b, c, d] = o.bbox;
                let builder = DetectionBuilder::new().score(o.score);
                let det = if self.model.bbox_is_xywh() {
                    builder.xywh(a * sx, b * sy, c * sx, d * sy).build()
                } else {
                    builder.tlbr(a * sx, b * sy, c * sx, d * sy).build()
                };
                RawDetection::new(det.bbox, o.score, o.class_id)
            })
            .collect()
    }
}

impl<B: Backend, M: BurnModel<B>> InferenceEngine for BurnEngine<B, M> {
    fn name(&self) -> &str {
        "burn"
    }

    fn supports(&self, device: ComputeDevice, precision: Precision) -> bool {
        let device_ok = match device {
            ComputeDevice::Cpu => !self.model.on_gpu(),
            ComputeDevice::Gpu => self.model.on_gpu(),
        };
        device_ok && (precision == Precision::Full || self.model.supports_half())
    }

    fn infer(
        &mut self,
        frame: &Frame,
        settings: &InferenceSettings,
    ) -> Result<Vec<RawDetection>, EngineError> {
        let tensor = self.preprocess(frame, settings.input_shape)?;
        let outputs = self.model.forward(tensor);
        Ok(self.postprocess(outputs, frame, settings.input_shape))
    }
}
