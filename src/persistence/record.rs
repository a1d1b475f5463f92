use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::detector::VehicleClass;
use crate::tracker::{Direction, Track};

/// Immutable summary of one counted vehicle.
///
/// `direction` and `line` are set for line crossings and empty for records
/// emitted when a track completes without any counting line configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountRecord {
    pub track_id: u64,
    pub class: VehicleClass,
    pub direction: Option<Direction>,
    /// Index of the counting line crossed.
    pub line: Option<usize>,
    pub entered_at: DateTime<Utc>,
    pub exited_at: DateTime<Utc>,
    pub trail_length: usize,
}

impl CountRecord {
    pub fn from_track(
        track: &Track,
        direction: Option<Direction>,
        line: Option<usize>,
        exited_at: DateTime<Utc>,
    ) -> Self {
        Self {
            track_id: track.id(),
            class: track.class(),
            direction,
            line,
            entered_at: track.first_seen(),
            exited_at,
            trail_length: track.trail().len(),
        }
    }
}
