//! Detector adapter: an engine plus post-processing, or the null fallback.

use tracing::{debug, info, warn};

use super::engine::{EngineError, EngineFactory, InferenceEngine, InferenceSettings, RawDetection};
use super::nms::non_max_suppression;
use super::{Detection, VehicleClass};
use crate::config::{DetectionConfig, Device, Precision};
use crate::source::Frame;

/// Whether a detector is producing real results.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DetectorHealth {
    #[default]
    Healthy,
    /// Detection is not running; empty sets are returned.
    Unavailable(String),
}

impl DetectorHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// An engine bound to a device, with the post-processing chain.
pub struct RealDetector {
    engine: Box<dyn InferenceEngine>,
    device: Device,
    config: DetectionConfig,
}

impl RealDetector {
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn detect(
        &mut self,
        frame: &Frame,
        precision: Precision,
    ) -> Result<Vec<Detection>, EngineError> {
        let precision = if self.engine.supports(self.device, precision) {
            precision
        } else {
            self.config.precision
        };
        let settings = InferenceSettings {
            device: self.device,
            precision,
            input_shape: self.config.input_shape,
            conf_threshold: self.config.conf_threshold,
        };
        let raw = self.engine.infer(frame, &settings)?;
        Ok(postprocess(raw, frame.width(), frame.height(), &self.config))
    }
}

/// Stand-in used when no engine can run. Always returns an empty set.
#[derive(Debug, Clone)]
pub struct NullDetector {
    reason: String,
}

impl NullDetector {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// The detection capability: a real engine or the null fallback, chosen once
/// at construction.
pub enum Detector {
    Real(RealDetector),
    Null(NullDetector),
}

impl Detector {
    /// Build a detector from `factory`, preferring the configured device,
    /// then CPU, then the null fallback.
    pub fn from_factory(factory: &dyn EngineFactory, config: &DetectionConfig) -> Self {
        match factory.create() {
            Ok(engine) => Self::with_engine(engine, config),
            Err(err) => {
                warn!(error = %err, "inference engine unavailable, using null detector");
                Self::Null(NullDetector::new(err.to_string()))
            }
        }
    }

    pub fn with_engine(engine: Box<dyn InferenceEngine>, config: &DetectionConfig) -> Self {
        let device = if engine.supports(config.device, config.precision) {
            config.device
        } else if config.device != Device::Cpu && engine.supports(Device::Cpu, config.precision) {
            warn!(
                engine = engine.name(),
                requested = %config.device,
                "device unsupported, falling back to cpu"
            );
            Device::Cpu
        } else {
            let reason = EngineError::Unsupported {
                device: config.device,
                precision: config.precision,
            };
            warn!(engine = engine.name(), error = %reason, "using null detector");
            return Self::Null(NullDetector::new(reason.to_string()));
        };

        info!(engine = engine.name(), %device, "detector ready");
        Self::Real(RealDetector {
            engine,
            device,
            config: config.clone(),
        })
    }

    pub fn null(reason: impl Into<String>) -> Self {
        Self::Null(NullDetector::new(reason))
    }

    /// Run detection. Engine failures are absorbed: they yield an empty set
    /// and an unhealthy status instead of an error.
    pub fn detect(&mut self, frame: &Frame, precision: Precision) -> (Vec<Detection>, DetectorHealth) {
        match self {
            Self::Real(real) => match real.detect(frame, precision) {
                Ok(detections) => (detections, DetectorHealth::Healthy),
                Err(err) => {
                    warn!(seq = frame.seq(), error = %err, "detection failed");
                    (Vec::new(), DetectorHealth::Unavailable(err.to_string()))
                }
            },
            Self::Null(null) => (Vec::new(), DetectorHealth::Unavailable(null.reason.clone())),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null(_))
    }
}

/// Filter raw engine output: confidence, vehicle class, frame clamp and
/// minimum area, ROI, then NMS.
pub fn postprocess(
    raw: Vec<RawDetection>,
    frame_width: u32,
    frame_height: u32,
    config: &DetectionConfig,
) -> Vec<Detection> {
    let total = raw.len();
    let candidates: Vec<Detection> = raw
        .into_iter()
        .filter(|r| r.score >= config.conf_threshold)
        .filter_map(|r| {
            let class = VehicleClass::from_coco_id(r.class_id)?;
            let bbox = if frame_width > 0 && frame_height > 0 {
                r.bbox.clamp_to(frame_width, frame_height)
            } else {
                r.bbox
            };
            Some(Detection::from_rect(bbox, r.score, class))
        })
        .filter(|d| d.bbox.area() >= config.min_box_area)
        .filter(|d| config.roi.as_ref().is_none_or(|roi| roi.contains(d.centroid())))
        .collect();

    let kept = non_max_suppression(candidates, config.nms_threshold);
    debug!(raw = total, kept = kept.len(), "detections filtered");
    kept
}
