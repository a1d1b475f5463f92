use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::PerformanceSample;
use crate::config::{PerformanceConfig, PipelineConfig, Precision};

/// A change the frame loop should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Adjustment {
    SkipInterval { from: u32, to: u32 },
    Precision { from: Precision, to: Precision },
    ActiveWorkers { from: usize, to: usize },
    /// Memory is over the ceiling: retire long-stale tracks, drop caches.
    Cleanup,
}

/// Where the last evaluated window fell relative to the target rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Behind,
    Steady,
    Headroom,
}

/// Hysteresis controller over skip interval, precision and worker count.
///
/// Falling behind `target_fps · (1 − fps_tolerance)` degrades one step per
/// window: `k` first, then precision, then workers. Only after
/// `recovery_windows` consecutive windows above `target_fps · (1 + fps_headroom)`
/// is one step undone, in reverse order. Anything in between holds.
#[derive(Debug, Clone)]
pub struct AdaptiveController {
    config: PerformanceConfig,
    interval: Duration,
    max_skip: u32,
    base_precision: Precision,
    max_workers: usize,
    skip: u32,
    precision: Precision,
    workers: usize,
    headroom_streak: u32,
    last_evaluation: Option<Instant>,
}

impl AdaptiveController {
    pub fn new(config: &PipelineConfig) -> Self {
        let max_skip = config.frame_skip.max_frame_skip.max(1);
        let max_workers = config.detection.max_worker_threads.max(1);
        Self {
            config: config.performance.clone(),
            interval: config.performance.cleanup_interval,
            max_skip,
            base_precision: config.detection.precision,
            max_workers,
            skip: config.frame_skip.frame_skip.clamp(1, max_skip),
            precision: config.detection.precision,
            workers: max_workers,
            headroom_streak: 0,
            last_evaluation: None,
        }
    }

    pub fn skip_interval(&self) -> u32 {
        self.skip
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn active_workers(&self) -> usize {
        self.workers
    }

    /// Whether [`AdaptiveController::evaluate`] would act at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.last_evaluation
            .is_none_or(|last| now.duration_since(last) >= self.interval)
    }

    /// Evaluate `sample` if a full `cleanup_interval` has passed since the
    /// last evaluation. The first call only starts the clock.
    pub fn evaluate(&mut self, now: Instant, sample: &PerformanceSample) -> Vec<Adjustment> {
        if !self.is_due(now) {
            return Vec::new();
        }
        let first = self.last_evaluation.is_none();
        self.last_evaluation = Some(now);
        if first { Vec::new() } else { self.decide(sample) }
    }

    /// One control step for one window, without the interval gate.
    pub fn decide(&mut self, sample: &PerformanceSample) -> Vec<Adjustment> {
        let mut adjustments = Vec::new();

        if sample.memory_percent > self.config.max_memory_percent {
            warn!(
                memory = sample.memory_percent,
                ceiling = self.config.max_memory_percent,
                "memory over ceiling, requesting cleanup"
            );
            adjustments.push(Adjustment::Cleanup);
        }

        if !self.config.adaptive || sample.frames == 0 {
            return adjustments;
        }

        match self.band(sample.fps) {
            Band::Behind => {
                self.headroom_streak = 0;
                if let Some(adjustment) = self.degrade() {
                    info!(fps = sample.fps, ?adjustment, "falling behind target rate");
                    adjustments.push(adjustment);
                } else {
                    debug!(fps = sample.fps, "behind target with nothing left to shed");
                }
            }
            Band::Headroom => {
                self.headroom_streak += 1;
                if self.headroom_streak >= self.config.recovery_windows.max(1) {
                    self.headroom_streak = 0;
                    if let Some(adjustment) = self.recover() {
                        info!(fps = sample.fps, ?adjustment, "headroom sustained, restoring quality");
                        adjustments.push(adjustment);
                    }
                }
            }
            Band::Steady => self.headroom_streak = 0,
        }
        adjustments
    }

    fn band(&self, fps: f32) -> Band {
        let target = self.config.target_fps;
        if fps < target * (1.0 - self.config.fps_tolerance) {
            Band::Behind
        } else if fps > target * (1.0 + self.config.fps_headroom) {
            Band::Headroom
        } else {
            Band::Steady
        }
    }

    fn degrade(&mut self) -> Option<Adjustment> {
        if self.skip < self.max_skip {
            let from = self.skip;
            self.skip += 1;
            return Some(Adjustment::SkipInterval { from, to: self.skip });
        }
        if let Some(lower) = self.precision.lowered() {
            let from = self.precision;
            self.precision = lower;
            return Some(Adjustment::Precision { from, to: lower });
        }
        if self.workers > 1 {
            let from = self.workers;
            self.workers -= 1;
            return Some(Adjustment::ActiveWorkers { from, to: self.workers });
        }
        None
    }

    fn recover(&mut self) -> Option<Adjustment> {
        if self.workers < self.max_workers {
            let from = self.workers;
            self.workers += 1;
            return Some(Adjustment::ActiveWorkers { from, to: self.workers });
        }
        if self.precision != self.base_precision {
            let from = self.precision;
            self.precision = self.base_precision;
            return Some(Adjustment::Precision {
                from,
                to: self.base_precision,
            });
        }
        if self.skip > 1 {
            let from = self.skip;
            self.skip -= 1;
            return Some(Adjustment::SkipInterval { from, to: self.skip });
        }
        None
    }
}
