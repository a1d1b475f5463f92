//! Single vehicle track.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::detector::{Detection, VehicleClass};
use crate::tracker::kalman_filter::{KalmanFilter, KalmanState};
use crate::tracker::rect::{Point, Rect};
use crate::tracker::track_state::TrackState;

/// One followed vehicle. Owned and mutated only by the tracker.
#[derive(Debug, Clone)]
pub struct Track {
    id: u64,
    state: TrackState,
    class: VehicleClass,
    class_votes: BTreeMap<VehicleClass, u32>,
    score: f32,
    kalman: KalmanState,
    trail: VecDeque<Point>,
    trail_capacity: usize,
    staleness: u32,
    /// Consecutive matches.
    hits: u32,
    observations: u32,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl Track {
    pub(crate) fn new(
        id: u64,
        detection: &Detection,
        kalman_filter: &KalmanFilter,
        trail_capacity: usize,
        seen_at: DateTime<Utc>,
    ) -> Self {
        let trail_capacity = trail_capacity.max(1);
        let mut trail = VecDeque::with_capacity(trail_capacity);
        trail.push_back(detection.centroid());
        Self {
            id,
            state: TrackState::Tentative,
            class: detection.class,
            class_votes: BTreeMap::from([(detection.class, 1)]),
            score: detection.score,
            kalman: kalman_filter.initiate(&detection.bbox),
            trail,
            trail_capacity,
            staleness: 0,
            hits: 1,
            observations: 1,
            first_seen: seen_at,
            last_seen: seen_at,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    /// Majority class over all matched detections.
    pub fn class(&self) -> VehicleClass {
        self.class
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    /// Current box: the filter estimate after this frame's predict/update.
    pub fn bbox(&self) -> Rect {
        self.kalman.rect()
    }

    /// Centroids of matched detections, oldest first.
    pub fn trail(&self) -> &VecDeque<Point> {
        &self.trail
    }

    pub fn staleness(&self) -> u32 {
        self.staleness
    }

    pub fn hits(&self) -> u32 {
        self.hits
    }

    pub fn observations(&self) -> u32 {
        self.observations
    }

    /// Estimated velocity in px/frame, `None` until there are two observations.
    pub fn velocity(&self) -> Option<(f32, f32)> {
        (self.observations >= 2).then(|| self.kalman.velocity())
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Latest trail segment, if the trail has two points.
    pub fn last_segment(&self) -> Option<(Point, Point)> {
        let n = self.trail.len();
        (n >= 2).then(|| (self.trail[n - 2], self.trail[n - 1]))
    }

    pub(crate) fn predict(&mut self, kalman_filter: &KalmanFilter) {
        kalman_filter.predict(&mut self.kalman, self.staleness > 0);
    }

    /// Apply a matched detection. Returns `true` when this match promoted the
    /// track from tentative to active.
    pub(crate) fn update(
        &mut self,
        detection: &Detection,
        kalman_filter: &KalmanFilter,
        min_hits: u32,
        seen_at: DateTime<Utc>,
    ) -> bool {
        if !kalman_filter.update(&mut self.kalman, &detection.bbox) {
            tracing::debug!(track = self.id, "singular innovation, re-initialising filter");
            self.kalman = kalman_filter.initiate(&detection.bbox);
        }

        if self.trail.len() == self.trail_capacity {
            self.trail.pop_front();
        }
        self.trail.push_back(detection.centroid());

        self.staleness = 0;
        self.hits += 1;
        self.observations += 1;
        self.score = detection.score;
        self.last_seen = seen_at;
        self.vote(detection.class);

        self.promote_if_confirmed(min_hits)
    }

    pub(crate) fn promote_if_confirmed(&mut self, min_hits: u32) -> bool {
        if self.state == TrackState::Tentative && self.hits >= min_hits {
            self.state = TrackState::Active;
            return true;
        }
        false
    }

    /// Unmatched on a frame that ran detection.
    pub(crate) fn mark_missed(&mut self) {
        self.staleness += 1;
        self.hits = 0;
    }

    /// Skipped frame: the track ages but its match history is untouched.
    pub(crate) fn mark_coasted(&mut self) {
        self.staleness += 1;
    }

    pub(crate) fn mark_counted(&mut self) {
        self.state = TrackState::Counted;
    }

    pub(crate) fn mark_retired(&mut self) {
        self.state = TrackState::Retired;
    }

    fn vote(&mut self, class: VehicleClass) {
        let votes = self.class_votes.entry(class).or_default();
        *votes += 1;
        let votes = *votes;
        let current = self.class_votes.get(&self.class).copied().unwrap_or(0);
        if votes > current {
            self.class = class;
        }
    }
}
