//! Pipeline configuration.
//!
//! A [`PipelineConfig`] is built once at start-up (from a profile or a
//! document), validated, and then shared read-only with every component.
//! Missing keys fall back to the defaults below and unknown keys are ignored,
//! so a document only has to name what it changes.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::detector::Roi;
use crate::error::{PipelineError, Result};
use crate::tracker::CountingLine;

/// Compute device requested for inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    #[serde(alias = "CPU")]
    Cpu,
    #[serde(alias = "GPU", alias = "cuda", alias = "CUDA")]
    Gpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

/// Numeric precision used by the inference engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[serde(alias = "fp16", alias = "FP16")]
    Half,
    #[default]
    #[serde(alias = "fp32", alias = "FP32")]
    Full,
}

impl Precision {
    /// The next cheaper precision, if any.
    pub fn lowered(self) -> Option<Self> {
        match self {
            Self::Full => Some(Self::Half),
            Self::Half => None,
        }
    }
}

/// Record output format handed to the storage collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Csv,
    Both,
}

impl OutputFormat {
    pub fn writes_json(self) -> bool {
        matches!(self, Self::Json | Self::Both)
    }

    pub fn writes_csv(self) -> bool {
        matches!(self, Self::Csv | Self::Both)
    }
}

/// Bipartite assignment strategy used by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStrategy {
    /// Cheapest pair first; ties go to the lower track id.
    #[default]
    Greedy,
    /// Minimum total cost (Jonker-Volgenant).
    Optimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub device: Device,
    pub precision: Precision,
    /// Model input size, (width, height).
    pub input_shape: [u32; 2],
    pub conf_threshold: f32,
    /// IoU at or above which the weaker of two boxes is suppressed.
    pub nms_threshold: f32,
    /// Boxes smaller than this (px²) are discarded.
    pub min_box_area: f32,
    pub roi: Option<Roi>,
    pub model_path: Option<PathBuf>,
    pub max_worker_threads: usize,
    /// Extra detection jobs allowed in flight beyond one per active worker.
    pub queue_depth: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            precision: Precision::Full,
            input_shape: [416, 416],
            conf_threshold: 0.25,
            nms_threshold: 0.5,
            min_box_area: 500.0,
            roi: None,
            model_path: None,
            max_worker_threads: 2,
            queue_depth: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub trail_length: usize,
    /// Unmatched frames tolerated before a track is retired.
    pub max_staleness: u32,
    /// Consecutive matches needed to promote a tentative track.
    pub min_hits: u32,
    /// Association pairs costing more than this are never matched.
    pub max_cost: f32,
    pub iou_weight: f32,
    pub distance_weight: f32,
    /// Centroid distance (px) at which the distance term saturates.
    pub max_distance: f32,
    pub assignment: AssignmentStrategy,
    pub counting_lines: Vec<CountingLine>,
    /// Bypass the tracker and publish raw detections only.
    pub skip_tracking: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            trail_length: 30,
            max_staleness: 10,
            min_hits: 2,
            max_cost: 0.8,
            iou_weight: 0.7,
            distance_weight: 0.3,
            max_distance: 100.0,
            assignment: AssignmentStrategy::Greedy,
            counting_lines: Vec::new(),
            skip_tracking: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSkipConfig {
    /// Initial skip interval `k`: detection runs on every k-th frame.
    pub frame_skip: u32,
    /// Ceiling the adaptive controller may raise `k` to.
    pub max_frame_skip: u32,
}

impl Default for FrameSkipConfig {
    fn default() -> Self {
        Self {
            frame_skip: 2,
            max_frame_skip: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    pub adaptive: bool,
    pub target_fps: f32,
    /// Fraction below target that counts as falling behind.
    pub fps_tolerance: f32,
    /// Fraction above target that counts as headroom.
    pub fps_headroom: f32,
    /// Consecutive headroom windows required before easing off.
    pub recovery_windows: u32,
    pub max_memory_percent: f32,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    /// Frames kept in the rolling timing window.
    pub window_size: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            target_fps: 15.0,
            fps_tolerance: 0.1,
            fps_headroom: 0.25,
            recovery_windows: 2,
            max_memory_percent: 80.0,
            cleanup_interval: Duration::from_secs(5),
            window_size: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    #[serde(with = "duration_secs")]
    pub save_interval: Duration,
    /// Buffered records that force a flush before the interval elapses.
    pub flush_threshold: usize,
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    pub async_save: bool,
    pub compression: bool,
    pub io_threads: usize,
    /// Remote endpoint receiving the same records, independent of `enabled`.
    pub api: ApiConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            save_interval: Duration::from_secs(300),
            flush_threshold: 100,
            output_dir: PathBuf::from("data/counts"),
            format: OutputFormat::Json,
            async_save: false,
            compression: false,
            io_threads: 1,
            api: ApiConfig::default(),
        }
    }
}

/// HTTP endpoint that count batches are POSTed to as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub endpoint: String,
    /// Sent as a bearer token when not empty.
    pub api_key: String,
    #[serde(with = "duration_secs")]
    pub send_interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            api_key: String::new(),
            send_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }
}

impl ApiConfig {
    /// Scheduling for the API target: interval driven only, with a single
    /// background sender so requests never block the frame loop.
    pub fn schedule(&self) -> StorageConfig {
        StorageConfig {
            save_interval: self.send_interval,
            flush_threshold: usize::MAX,
            format: OutputFormat::Json,
            async_save: true,
            compression: false,
            io_threads: 1,
            ..StorageConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub reconnect_attempts: u32,
    #[serde(with = "duration_secs")]
    pub reconnect_backoff: Duration,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 3,
            reconnect_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Upper bound on how long shutdown waits for workers and writers.
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,
    /// How long ingestion blocks on a saturated worker pool before skipping.
    #[serde(with = "duration_secs")]
    pub backpressure_wait: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(2),
            backpressure_wait: Duration::from_millis(20),
        }
    }
}

/// Complete, immutable pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection: DetectionConfig,
    pub tracking: TrackingConfig,
    pub frame_skip: FrameSkipConfig,
    pub performance: PerformanceConfig,
    pub storage: StorageConfig,
    pub source: SourceConfig,
    pub runtime: RuntimeConfig,
}

impl PipelineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(document: &str) -> Result<Self> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(document: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `.toml` or `.json` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("json") => Self::from_json_str(&content)?,
            other => {
                return Err(PipelineError::config(format!(
                    "unsupported configuration extension {other:?} for {}",
                    path.display()
                )));
            }
        };
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Reject inconsistent settings before anything is built.
    pub fn validate(&self) -> Result<()> {
        let d = &self.detection;
        check_unit("detection.conf_threshold", d.conf_threshold)?;
        check_unit("detection.nms_threshold", d.nms_threshold)?;
        if d.input_shape.contains(&0) {
            return Err(PipelineError::config("detection.input_shape must be non-zero"));
        }
        check_non_negative("detection.min_box_area", d.min_box_area)?;
        if d.max_worker_threads == 0 {
            return Err(PipelineError::config("detection.max_worker_threads must be >= 1"));
        }
        if let Some(roi) = &d.roi {
            roi.validate()?;
        }

        let t = &self.tracking;
        if t.trail_length == 0 {
            return Err(PipelineError::config("tracking.trail_length must be >= 1"));
        }
        if t.min_hits == 0 {
            return Err(PipelineError::config("tracking.min_hits must be >= 1"));
        }
        if !(t.max_cost > 0.0 && t.max_cost <= 1.0) {
            return Err(PipelineError::config("tracking.max_cost must be in (0, 1]"));
        }
        check_non_negative("tracking.iou_weight", t.iou_weight)?;
        check_non_negative("tracking.distance_weight", t.distance_weight)?;
        if t.iou_weight + t.distance_weight <= 0.0 {
            return Err(PipelineError::config(
                "tracking cost weights must be non-negative and not both zero",
            ));
        }
        check_positive("tracking.max_distance", t.max_distance)?;
        for line in &t.counting_lines {
            line.validate()?;
        }

        let s = &self.frame_skip;
        if s.frame_skip == 0 {
            return Err(PipelineError::config("frame_skip.frame_skip must be >= 1"));
        }
        if s.max_frame_skip < s.frame_skip {
            return Err(PipelineError::config(
                "frame_skip.max_frame_skip must be >= frame_skip.frame_skip",
            ));
        }

        let p = &self.performance;
        check_positive("performance.target_fps", p.target_fps)?;
        check_unit("performance.fps_tolerance", p.fps_tolerance)?;
        check_non_negative("performance.fps_headroom", p.fps_headroom)?;
        if !(p.max_memory_percent > 0.0 && p.max_memory_percent <= 100.0) {
            return Err(PipelineError::config(
                "performance.max_memory_percent must be in (0, 100]",
            ));
        }
        if p.cleanup_interval.is_zero() {
            return Err(PipelineError::config("performance.cleanup_interval must be > 0"));
        }
        if p.window_size < 2 {
            return Err(PipelineError::config("performance.window_size must be >= 2"));
        }

        let st = &self.storage;
        if st.enabled {
            if st.save_interval.is_zero() {
                return Err(PipelineError::config("storage.save_interval must be > 0"));
            }
            if st.flush_threshold == 0 {
                return Err(PipelineError::config("storage.flush_threshold must be >= 1"));
            }
            if st.io_threads == 0 {
                return Err(PipelineError::config("storage.io_threads must be >= 1"));
            }
        }

        let api = &self.storage.api;
        if api.enabled {
            if !(api.endpoint.starts_with("http://") || api.endpoint.starts_with("https://")) {
                return Err(PipelineError::config(
                    "storage.api.endpoint must be an http:// or https:// URL",
                ));
            }
            if api.send_interval.is_zero() {
                return Err(PipelineError::config("storage.api.send_interval must be > 0"));
            }
            if api.timeout.is_zero() {
                return Err(PipelineError::config("storage.api.timeout must be > 0"));
            }
        }

        debug!("configuration validated");
        Ok(())
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(PipelineError::config(format!("{name} must be in [0, 1], got {value}")))
    }
}

fn check_positive(name: &str, value: f32) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(PipelineError::config(format!("{name} must be finite and > 0, got {value}")))
    }
}

fn check_non_negative(name: &str, value: f32) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(PipelineError::config(format!("{name} must be finite and >= 0, got {value}")))
    }
}

/// Named deployment profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Accuracy first: full precision on GPU, detection on every frame.
    Production,
    /// CPU friendly defaults with short save intervals.
    Development,
    /// Latency first: half precision, frame skipping, tighter memory ceiling.
    Optimized,
}

impl Profile {
    pub fn config(self) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        match self {
            Self::Production => {
                config.detection.device = Device::Gpu;
                config.detection.input_shape = [640, 640];
                config.detection.conf_threshold = 0.4;
                config.detection.nms_threshold = 0.45;
                config.detection.max_worker_threads = 4;
                config.frame_skip.frame_skip = 1;
                config.frame_skip.max_frame_skip = 4;
                config.performance.target_fps = 30.0;
                config.storage.async_save = true;
                config.storage.compression = true;
                config.storage.format = OutputFormat::Both;
                config.storage.io_threads = 2;
            }
            Self::Development => {
                config.tracking.trail_length = 20;
                config.storage.save_interval = Duration::from_secs(60);
                config.performance.max_memory_percent = 90.0;
                config.detection.max_worker_threads = 1;
            }
            Self::Optimized => {
                config.detection.device = Device::Gpu;
                config.detection.precision = Precision::Half;
                config.detection.conf_threshold = 0.35;
                config.detection.nms_threshold = 0.45;
                config.detection.max_worker_threads = 4;
                config.tracking.trail_length = 15;
                config.frame_skip.frame_skip = 2;
                config.frame_skip.max_frame_skip = 6;
                config.performance.target_fps = 30.0;
                config.performance.max_memory_percent = 75.0;
                config.performance.cleanup_interval = Duration::from_secs(3);
                config.storage.async_save = true;
                config.storage.compression = true;
                config.storage.io_threads = 2;
            }
        }
        config
    }
}

impl FromStr for Profile {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Self::Production),
            "development" | "dev" => Ok(Self::Development),
            "optimized" | "optimised" => Ok(Self::Optimized),
            other => Err(PipelineError::config(format!("unknown profile '{other}'"))),
        }
    }
}

/// (De)serialize a `Duration` as a number of seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(D::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
