//! Trait for object detection inference backends.

use std::sync::Arc;

use thiserror::Error;

use crate::config::{Device, Precision};
use crate::source::Frame;
use crate::tracker::Rect;

/// Parameters for one inference call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceSettings {
    pub device: Device,
    pub precision: Precision,
    /// Model input size, (width, height).
    pub input_shape: [u32; 2],
    /// Engines may drop boxes below this score early; the adapter filters again.
    pub conf_threshold: f32,
}

/// Unfiltered engine output in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub bbox: Rect,
    pub score: f32,
    /// COCO class id.
    pub class_id: usize,
}

impl RawDetection {
    pub fn new(bbox: Rect, score: f32, class_id: usize) -> Self {
        Self {
            bbox,
            score,
            class_id,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The engine (or its hardware) cannot be used at all.
    #[error("inference engine unavailable: {0}")]
    Unavailable(String),

    #[error("{device} does not support {precision:?} inference")]
    Unsupported { device: Device, precision: Precision },

    #[error("inference failed: {0}")]
    Inference(String),
}

/// An object detection model behind a uniform call.
///
/// Implement this trait to connect any detection backend to the pipeline.
/// The adapter owns confidence, class, ROI and NMS filtering; engines only
/// need to report what the model produced.
///
/// # Example
///
/// ```ignore
/// use vehicle_count_rs::detector::{EngineError, InferenceEngine, InferenceSettings, RawDetection};
/// use vehicle_count_rs::source::Frame;
///
/// struct MyEngine {
///     // Your model here
/// }
///
/// impl InferenceEngine for MyEngine {
///     fn name(&self) -> &str {
///         "my-engine"
///     }
///
///     fn infer(&mut self, frame: &Frame, settings: &InferenceSettings) -> Result<Vec<RawDetection>, EngineError> {
///         Ok(vec![])
///     }
/// }
/// ```
pub trait InferenceEngine: Send {
    fn name(&self) -> &str;

    /// Whether the engine can run on `device` at `precision`.
    fn supports(&self, device: Device, precision: Precision) -> bool {
        let _ = (device, precision);
        true
    }

    fn infer(
        &mut self,
        frame: &Frame,
        settings: &InferenceSettings,
    ) -> Result<Vec<RawDetection>, EngineError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn supports(&self, device: Device, precision: Precision) -> bool {
        (**self).supports(device, precision)
    }

    fn infer(
        &mut self,
        frame: &Frame,
        settings: &InferenceSettings,
    ) -> Result<Vec<RawDetection>, EngineError> {
        (**self).infer(frame, settings)
    }
}

/// Builds one engine instance per inference worker.
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn InferenceEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn InferenceEngine>, EngineError> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn InferenceEngine>, EngineError> {
        self()
    }
}

/// Shared handle to a factory.
pub type SharedEngineFactory = Arc<dyn EngineFactory>;

/// Factory for deployments without a model: every worker runs the null
/// detector.
pub fn no_engine() -> SharedEngineFactory {
    Arc::new(|| -> Result<Box<dyn InferenceEngine>, EngineError> {
        Err(EngineError::Unavailable("no inference engine configured".into()))
    })
}
