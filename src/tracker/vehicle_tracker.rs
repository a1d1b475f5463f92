//! Track association, lifecycle and counting.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::TrackingConfig;
use crate::detector::Detection;
use crate::persistence::CountRecord;
use crate::tracker::counting::CountTally;
use crate::tracker::kalman_filter::KalmanFilter;
use crate::tracker::matching::{self, AssignmentResult, CostWeights};
use crate::tracker::rect::Rect;
use crate::tracker::track::Track;
use crate::tracker::track_state::TrackState;

/// Per-frame inputs the tracker needs besides detections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameContext {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Frame-skip interval in force for this frame.
    pub skip_interval: u32,
}

impl FrameContext {
    pub fn new(seq: u64, timestamp: DateTime<Utc>, skip_interval: u32) -> Self {
        Self {
            seq,
            timestamp,
            skip_interval: skip_interval.max(1),
        }
    }
}

/// Associates detections with tracks and emits count records.
///
/// Tracks are kept in ascending id order, which is also the row order of the
/// cost matrix, so assignment ties resolve to the lower id. Ids come from a
/// per-tracker counter and are never reused until [`Tracker::reset`].
pub struct Tracker {
    config: TrackingConfig,
    weights: CostWeights,
    kalman_filter: KalmanFilter,
    tracks: Vec<Track>,
    next_id: u64,
    tally: CountTally,
    frames: u64,
}

impl Tracker {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            weights: CostWeights::from_config(config),
            config: config.clone(),
            kalman_filter: KalmanFilter::default(),
            tracks: Vec::new(),
            next_id: 1,
            tally: CountTally::default(),
            frames: 0,
        }
    }

    /// Live (non-retired) tracks in id order.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: u64) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    pub fn tally(&self) -> &CountTally {
        &self.tally
    }

    /// Frames seen since construction or the last reset.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Process a frame that ran detection.
    pub fn update(&mut self, ctx: &FrameContext, detections: &[Detection]) -> Vec<CountRecord> {
        self.frames += 1;
        for track in &mut self.tracks {
            track.predict(&self.kalman_filter);
        }

        let track_boxes: Vec<Rect> = self.tracks.iter().map(Track::bbox).collect();
        let det_boxes: Vec<Rect> = detections.iter().map(|d| d.bbox).collect();
        let cost = matching::cost_matrix(&track_boxes, &det_boxes, &self.weights);
        let AssignmentResult {
            matches,
            unmatched_tracks,
            unmatched_detections,
        } = matching::assign(self.config.assignment, &cost, self.config.max_cost);

        let mut records = Vec::new();
        for (row, col) in matches {
            let track = &mut self.tracks[row];
            if track.update(&detections[col], &self.kalman_filter, self.config.min_hits, ctx.timestamp) {
                debug!(track = track.id(), seq = ctx.seq, "track confirmed");
            }
            if let Some(record) = crossing_record(&self.config, track, ctx) {
                track.mark_counted();
                records.push(record);
            }
        }
        for row in unmatched_tracks {
            self.tracks[row].mark_missed();
        }

        // Skipped frames add up to k - 1 staleness between detection frames.
        let limit = self.config.max_staleness + ctx.skip_interval.saturating_sub(1);
        records.extend(self.retire_where(|t| t.staleness() > limit));

        for col in unmatched_detections {
            let id = self.next_id;
            self.next_id += 1;
            let mut track = Track::new(
                id,
                &detections[col],
                &self.kalman_filter,
                self.config.trail_length,
                ctx.timestamp,
            );
            track.promote_if_confirmed(self.config.min_hits);
            debug!(track = id, seq = ctx.seq, class = %track.class(), "track created");
            self.tracks.push(track);
        }

        self.tally_all(&records);
        records
    }

    /// Process a skipped frame: every track predicts forward and ages by one,
    /// but nothing is matched, created or retired.
    pub fn coast(&mut self, _ctx: &FrameContext) {
        self.frames += 1;
        for track in &mut self.tracks {
            track.predict(&self.kalman_filter);
            track.mark_coasted();
        }
    }

    /// Retire every track at end of stream.
    pub fn finish(&mut self) -> Vec<CountRecord> {
        let records = self.retire_where(|_| true);
        self.tally_all(&records);
        info!(records = records.len(), total = self.tally.total, "tracker finished");
        records
    }

    /// Force-retire long-stale tracks under memory pressure.
    pub fn cleanup(&mut self) -> Vec<CountRecord> {
        let threshold = (self.config.max_staleness / 2).max(1);
        let before = self.tracks.len();
        let records = self.retire_where(|t| t.staleness() >= threshold);
        self.tally_all(&records);
        self.tracks.shrink_to_fit();
        info!(retired = before - self.tracks.len(), "tracker cleanup");
        records
    }

    /// Drop all tracks and counts and restart ids from 1.
    pub fn reset(&mut self) {
        self.tracks.clear();
        self.next_id = 1;
        self.tally = CountTally::default();
        self.frames = 0;
    }

    fn retire_where(
        &mut self,
        mut predicate: impl FnMut(&Track) -> bool,
    ) -> Vec<CountRecord> {
        let mut records = Vec::new();
        let counting_lines = !self.config.counting_lines.is_empty();
        self.tracks.retain_mut(|track| {
            if !predicate(track) {
                return true;
            }
            // Without counting lines, a confirmed vehicle counts when it leaves.
            if !counting_lines && track.state() == TrackState::Active {
                records.push(CountRecord::from_track(track, None, None, track.last_seen()));
            }
            debug!(track = track.id(), state = ?track.state(), staleness = track.staleness(), "track retired");
            track.mark_retired();
            false
        });
        records
    }

    fn tally_all(&mut self, records: &[CountRecord]) {
        for record in records {
            info!(
                track = record.track_id,
                class = %record.class,
                direction = ?record.direction,
                "vehicle counted"
            );
            self.tally.record(record);
        }
    }
}

/// A record for the first line crossed by the latest trail segment of an
/// active, not yet counted track.
fn crossing_record(config: &TrackingConfig, track: &Track, ctx: &FrameContext) -> Option<CountRecord> {
    if track.state() != TrackState::Active {
        return None;
    }
    let (from, to) = track.last_segment()?;
    config
        .counting_lines
        .iter()
        .enumerate()
        .find_map(|(index, line)| {
            line.crossing(from, to)
                .map(|direction| CountRecord::from_track(track, Some(direction), Some(index), ctx.timestamp))
        })
}
