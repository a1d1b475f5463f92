use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Stage timings for one processed frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTiming {
    /// Time spent waiting on detection; `None` for skipped frames.
    pub detect: Option<Duration>,
    pub track: Duration,
    /// Whole iteration, excluding the wait for the next capture.
    pub total: Duration,
}

/// Rolling summary of recent frame timings plus the last memory reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PerformanceSample {
    /// Frames the loop can sustain per second at the current frame cost.
    pub fps: f32,
    pub memory_percent: f32,
    /// Mean over frames that ran detection.
    pub detect_ms: f32,
    pub track_ms: f32,
    pub frame_ms: f32,
    /// Frames in the window.
    pub frames: usize,
}

#[derive(Debug)]
struct Window {
    capacity: usize,
    timings: VecDeque<FrameTiming>,
    memory_percent: f32,
}

/// Mutex-guarded rolling window, written by the frame loop and read by the
/// adaptive controller. Readers always see a whole window.
#[derive(Debug)]
pub struct PerformanceMonitor {
    window: Mutex<Window>,
}

impl PerformanceMonitor {
    pub fn new(window_size: usize) -> Self {
        let capacity = window_size.max(1);
        Self {
            window: Mutex::new(Window {
                capacity,
                timings: VecDeque::with_capacity(capacity),
                memory_percent: 0.0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, timing: FrameTiming) {
        let mut window = self.lock();
        if window.timings.len() == window.capacity {
            window.timings.pop_front();
        }
        window.timings.push_back(timing);
    }

    pub fn set_memory_percent(&self, percent: f32) {
        self.lock().memory_percent = percent;
    }

    pub fn sample(&self) -> PerformanceSample {
        let window = self.lock();
        let frames = window.timings.len();
        if frames == 0 {
            return PerformanceSample {
                memory_percent: window.memory_percent,
                ..PerformanceSample::default()
            };
        }

        let ms = |d: Duration| d.as_secs_f32() * 1000.0;
        let mut detect_total = 0.0;
        let mut detect_frames = 0;
        let mut track_total = 0.0;
        let mut frame_total = 0.0;
        for timing in &window.timings {
            if let Some(detect) = timing.detect {
                detect_total += ms(detect);
                detect_frames += 1;
            }
            track_total += ms(timing.track);
            frame_total += ms(timing.total);
        }

        let frame_ms = frame_total / frames as f32;
        PerformanceSample {
            fps: if frame_ms > 0.0 { 1000.0 / frame_ms } else { 0.0 },
            memory_percent: window.memory_percent,
            detect_ms: if detect_frames > 0 {
                detect_total / detect_frames as f32
            } else {
                0.0
            },
            track_ms: track_total / frames as f32,
            frame_ms,
            frames,
        }
    }

    /// Forget collected timings, e.g. after the controller changed settings.
    pub fn clear(&self) {
        self.lock().timings.clear();
    }
}
