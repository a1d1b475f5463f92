//! Frame-rate and memory monitoring with the adaptive feedback controller.

mod controller;
mod memory;
mod monitor;

pub use controller::{AdaptiveController, Adjustment};
pub use memory::{MemoryProbe, SystemMemory};
pub use monitor::{FrameTiming, PerformanceMonitor, PerformanceSample};
