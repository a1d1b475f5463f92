//! Detection: engines, post-processing and the inference worker pool.
//!
//! Any model can be plugged in by implementing [`InferenceEngine`]; the
//! [`Detector`] adapter applies confidence, class, ROI and NMS filtering and
//! falls back to an empty-result detector when no engine can run.

mod adapter;
mod builder;
mod detection;
mod engine;
mod nms;
mod pool;
mod roi;

pub use adapter::{Detector, DetectorHealth, NullDetector, RealDetector, postprocess};
pub use builder::DetectionBuilder;
pub use detection::{Detection, VehicleClass};
pub use engine::{
    EngineError, EngineFactory, InferenceEngine, InferenceSettings, RawDetection,
    SharedEngineFactory, no_engine,
};
pub use nms::non_max_suppression;
pub use pool::{DetectResult, InferencePool, SubmitOutcome};
pub use roi::Roi;

#[cfg(feature = "burn-backend")]
mod burn_engine;

#[cfg(feature = "burn-backend")]
pub use burn_engine::{BurnEngine, BurnModel, ModelOutput};
