//! Read-only views handed to the UI after every frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::Serialize;

use crate::config::Precision;
use crate::detector::{Detection, VehicleClass};
use crate::performance::{Adjustment, PerformanceSample};
use crate::tracker::{CountTally, Point, Rect, Track, TrackState};

/// One track as the UI sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackSnapshot {
    pub id: u64,
    pub state: TrackState,
    pub class: VehicleClass,
    pub score: f32,
    pub bbox: Rect,
    pub trail: Vec<Point>,
    pub staleness: u32,
    pub velocity: Option<(f32, f32)>,
}

impl From<&Track> for TrackSnapshot {
    fn from(track: &Track) -> Self {
        Self {
            id: track.id(),
            state: track.state(),
            class: track.class(),
            score: track.score(),
            bbox: track.bbox(),
            trail: track.trail().iter().copied().collect(),
            staleness: track.staleness(),
            velocity: track.velocity(),
        }
    }
}

/// Everything the renderer needs for one frame. A copy; mutating it has no
/// effect on the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineSnapshot {
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    /// `false` when the frame was skipped and `detections` is the last
    /// detection set reused for display.
    pub detected: bool,
    pub detections: Vec<Detection>,
    pub tracks: Vec<TrackSnapshot>,
    pub tally: CountTally,
    pub skip_interval: u32,
    pub precision: Precision,
    pub detector_healthy: bool,
    pub performance: PerformanceSample,
}

/// Out-of-band state changes worth showing to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Notice {
    /// Detection is not running; last known tracks are shown.
    DetectorUnavailable { reason: String },
    DetectorRecovered,
    SourceReconnecting { attempt: u32, reason: String },
    Adjusted { adjustment: Adjustment },
    MemoryCleanup { retired: usize },
}

/// Receives per-frame snapshots and notices from the frame loop.
///
/// Called on the loop thread; implementations must not block for long.
pub trait FrameObserver: Send {
    fn on_frame(&mut self, snapshot: &PipelineSnapshot);

    fn on_notice(&mut self, _notice: &Notice) {}
}

impl<F> FrameObserver for F
where
    F: FnMut(&PipelineSnapshot) + Send,
{
    fn on_frame(&mut self, snapshot: &PipelineSnapshot) {
        self(snapshot)
    }
}

/// Message delivered to a UI thread through a [`SnapshotFeed`].
#[derive(Debug, Clone)]
pub enum UiEvent {
    Frame(Arc<PipelineSnapshot>),
    Notice(Notice),
}

/// Observer that forwards snapshots over a bounded channel. When the UI lags
/// and the channel is full, snapshots are dropped rather than queued.
pub struct SnapshotFeed {
    tx: Sender<UiEvent>,
    dropped: Arc<AtomicU64>,
}

impl SnapshotFeed {
    pub fn new(capacity: usize) -> (Self, Receiver<UiEvent>) {
        let (tx, rx) = bounded(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Shared counter of snapshots dropped so far.
    pub fn dropped(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    fn send(&self, event: UiEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl FrameObserver for SnapshotFeed {
    fn on_frame(&mut self, snapshot: &PipelineSnapshot) {
        self.send(UiEvent::Frame(Arc::new(snapshot.clone())));
    }

    fn on_notice(&mut self, notice: &Notice) {
        self.send(UiEvent::Notice(notice.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(seq: u64) -> PipelineSnapshot {
        PipelineSnapshot {
            seq,
            captured_at: DateTime::<Utc>::default(),
            detected: true,
            detections: Vec::new(),
            tracks: Vec::new(),
            tally: CountTally::default(),
            skip_interval: 1,
            precision: Precision::Full,
            detector_healthy: true,
            performance: PerformanceSample::default(),
        }
    }

    #[test]
    fn test_feed_drops_when_full() {
        let (mut feed, rx) = SnapshotFeed::new(2);
        let dropped = feed.dropped();
        for seq in 0..5 {
            feed.on_frame(&snapshot(seq));
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 3);

        let seqs: Vec<u64> = rx
            .try_iter()
            .filter_map(|event| match event {
                UiEvent::Frame(s) => Some(s.seq),
                UiEvent::Notice(_) => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn test_feed_survives_closed_ui() {
        let (mut feed, rx) = SnapshotFeed::new(1);
        drop(rx);
        feed.on_frame(&snapshot(0));
        feed.on_notice(&Notice::DetectorRecovered);
        assert_eq!(feed.dropped().load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_closure_observer() {
        let mut seen = Vec::new();
        {
            let mut observer = |s: &PipelineSnapshot| seen.push(s.seq);
            observer.on_frame(&snapshot(7));
            observer.on_notice(&Notice::DetectorRecovered);
        }
        assert_eq!(seen, vec![7]);
    }

    #[test]
    fn test_notice_serializes_tagged() {
        let json = serde_json::to_value(Notice::MemoryCleanup { retired: 2 }).unwrap();
        assert_eq!(json["kind"], "memory_cleanup");
        assert_eq!(json["retired"], 2);
    }
}
