//! Frame loop orchestration, lifecycle control and UI snapshots.

mod control;
mod orchestrator;
mod snapshot;

pub use control::{CancelToken, ControlHandle, RunState};
pub use orchestrator::{Pipeline, PipelineBuilder, RunSummary, StopReason};
pub use snapshot::{FrameObserver, Notice, PipelineSnapshot, SnapshotFeed, TrackSnapshot, UiEvent};
