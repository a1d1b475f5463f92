//! Real-time vehicle detection, tracking and counting.
//!
//! Frames flow from a [`FrameSource`] through the [`FrameSkipController`] to a
//! pool of [`Detector`]s, then in sequence order into the [`Tracker`], which
//! follows each vehicle with a Kalman filter and emits a [`CountRecord`] when
//! it crosses a counting line. Records are buffered and written by the
//! [`PersistenceScheduler`]; the [`AdaptiveController`] trades detection
//! frequency, precision and workers against the target frame rate.
//!
//! ```ignore
//! use vehicle_count_rs::{Pipeline, Profile, ReplaySource};
//!
//! let config = Profile::Development.config();
//! let source = ReplaySource::new(frames, 25.0);
//! let summary = Pipeline::builder(config).source(source).build()?.run()?;
//! println!("{} vehicles", summary.tally.total);
//! ```

pub mod config;
pub mod detector;
pub mod error;
pub mod performance;
pub mod persistence;
pub mod pipeline;
pub mod skip;
pub mod source;
pub mod telemetry;
pub mod tracker;

pub use config::{
    AssignmentStrategy, Device, OutputFormat, PipelineConfig, Precision, Profile,
};
pub use detector::{Detection, DetectionBuilder, Detector, InferenceEngine, VehicleClass};
pub use error::{PipelineError, Result};
pub use performance::{AdaptiveController, PerformanceSample};
pub use persistence::{CountRecord, CountStore, FileStore, PersistenceScheduler};
pub use pipeline::{ControlHandle, Pipeline, PipelineSnapshot, RunState, RunSummary, StopReason};
pub use skip::FrameSkipController;
pub use source::{Frame, FrameSource, ImageSequenceSource, ReplaySource};
pub use tracker::{CountingLine, Direction, Point, Rect, Track, TrackState, Tracker};
