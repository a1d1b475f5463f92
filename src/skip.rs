//! Frame-skip decisions.

use tracing::debug;

use crate::config::FrameSkipConfig;

/// What to do with one incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    Detect,
    /// Reuse the previous detections; tracks coast.
    Skip,
}

/// Runs detection on frame `i` iff `i mod k == 0`.
///
/// `i` counts frames seen by this controller, starting at 0. `k` is kept in
/// `1..=max_interval` and may be changed between frames.
#[derive(Debug, Clone)]
pub struct FrameSkipController {
    interval: u32,
    max_interval: u32,
    frame_index: u64,
}

impl FrameSkipController {
    pub fn new(config: &FrameSkipConfig) -> Self {
        let max_interval = config.max_frame_skip.max(1);
        Self {
            interval: config.frame_skip.clamp(1, max_interval),
            max_interval,
            frame_index: 0,
        }
    }

    pub fn decide(&mut self) -> SkipDecision {
        let index = self.frame_index;
        self.frame_index += 1;
        if index % self.interval as u64 == 0 {
            SkipDecision::Detect
        } else {
            SkipDecision::Skip
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    pub fn max_interval(&self) -> u32 {
        self.max_interval
    }

    /// Frames decided so far.
    pub fn frames_seen(&self) -> u64 {
        self.frame_index
    }

    /// Set `k`, clamped to the configured range. Returns the value applied.
    pub fn set_interval(&mut self, k: u32) -> u32 {
        let k = k.clamp(1, self.max_interval);
        if k != self.interval {
            debug!(from = self.interval, to = k, "frame skip interval changed");
            self.interval = k;
        }
        k
    }

    pub fn reset(&mut self) {
        self.frame_index = 0;
    }
}
