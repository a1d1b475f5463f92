use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};

use super::frame::{Frame, FrameSource, SourceError, SourceEvent};
use crate::pipeline::CancelToken;

/// Plays back an in-memory sequence of frames.
///
/// Used for pre-decoded clips and for driving the pipeline in tests. With
/// pacing enabled, frames are released at the nominal rate.
pub struct ReplaySource {
    frames: VecDeque<Frame>,
    nominal_fps: f32,
    paced: bool,
    last_emit: Option<Instant>,
}

impl ReplaySource {
    pub fn new(frames: Vec<Frame>, nominal_fps: f32) -> Self {
        Self {
            frames: frames.into(),
            nominal_fps,
            paced: false,
            last_emit: None,
        }
    }

    /// `count` blank frames with sequence numbers from 0 and timestamps
    /// spaced at `fps`, starting at `start`.
    pub fn synthetic(count: usize, width: u32, height: u32, fps: f32, start: DateTime<Utc>) -> Self {
        let step = TimeDelta::microseconds((1_000_000.0 / fps.max(f32::EPSILON)) as i64);
        let frames = (0..count)
            .map(|i| Frame::blank(i as u64, start + step * i as i32, width, height))
            .collect();
        Self::new(frames, fps)
    }

    /// Release frames no faster than the nominal rate.
    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplaySource {
    fn next_frame(&mut self, cancel: &CancelToken) -> Result<SourceEvent, SourceError> {
        if cancel.is_cancelled() {
            return Ok(SourceEvent::Cancelled);
        }
        if self.paced && self.nominal_fps > 0.0 {
            if let Some(last) = self.last_emit {
                let period = Duration::from_secs_f32(1.0 / self.nominal_fps);
                let due = last + period;
                let now = Instant::now();
                if due > now && !cancel.sleep(due - now) {
                    return Ok(SourceEvent::Cancelled);
                }
            }
            self.last_emit = Some(Instant::now());
        }
        Ok(match self.frames.pop_front() {
            Some(frame) => SourceEvent::Frame(frame),
            None => SourceEvent::EndOfStream,
        })
    }

    fn nominal_fps(&self) -> f32 {
        self.nominal_fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_sequence() {
        let start = DateTime::<Utc>::default();
        let mut source = ReplaySource::synthetic(3, 64, 48, 10.0, start);
        let cancel = CancelToken::new();

        let mut seqs = Vec::new();
        while let SourceEvent::Frame(frame) = source.next_frame(&cancel).unwrap() {
            assert_eq!(frame.width(), 64);
            seqs.push(frame.seq());
            if frame.seq() == 2 {
                assert_eq!(frame.captured_at() - start, TimeDelta::milliseconds(200));
            }
        }
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(matches!(source.next_frame(&cancel).unwrap(), SourceEvent::EndOfStream));
    }

    #[test]
    fn test_cancelled_read() {
        let mut source = ReplaySource::synthetic(3, 8, 8, 10.0, DateTime::<Utc>::default());
        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(source.next_frame(&cancel).unwrap(), SourceEvent::Cancelled));
        assert_eq!(source.remaining(), 3);
    }
}
