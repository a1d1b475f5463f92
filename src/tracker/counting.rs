//! Counting lines and running tallies.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::detector::VehicleClass;
use crate::error::{PipelineError, Result};
use crate::persistence::CountRecord;
use crate::tracker::rect::Point;

/// Lines shorter than this (px) are rejected.
pub const MIN_LINE_LENGTH: f32 = 5.0;

/// Side of a counting line a vehicle crossed towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Negative side to positive side.
    Up,
    /// Positive side to negative side.
    Down,
}

/// A boundary segment in frame pixels.
///
/// The side of a point `p` is the sign of `(p - start) x (end - start)`: for a
/// line drawn left to right, points above it on screen are positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountingLine {
    pub start: Point,
    pub end: Point,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CountingLine {
    pub fn new(start: Point, end: Point) -> Self {
        Self {
            start,
            end,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn length(&self) -> f32 {
        self.start.distance(&self.end)
    }

    pub fn validate(&self) -> Result<()> {
        if self.length() < MIN_LINE_LENGTH {
            return Err(PipelineError::config(format!(
                "counting line ({}, {})-({}, {}) is shorter than {MIN_LINE_LENGTH} px",
                self.start.x, self.start.y, self.end.x, self.end.y
            )));
        }
        Ok(())
    }

    pub fn side(&self, p: Point) -> f32 {
        cross(sub(p, self.start), sub(self.end, self.start))
    }

    /// Direction of the crossing made by moving from `from` to `to`, if that
    /// movement crosses the segment.
    ///
    /// Starting exactly on the line is not a crossing; ending on it is.
    pub fn crossing(&self, from: Point, to: Point) -> Option<Direction> {
        let s_from = self.side(from);
        let s_to = self.side(to);
        let direction = if s_from < 0.0 && s_to >= 0.0 {
            Direction::Up
        } else if s_from > 0.0 && s_to <= 0.0 {
            Direction::Down
        } else {
            return None;
        };

        // The line's endpoints must straddle the movement for the
        // intersection to fall within the segment.
        let motion = sub(to, from);
        let a = cross(motion, sub(self.start, from));
        let b = cross(motion, sub(self.end, from));
        if a * b > 0.0 {
            return None;
        }
        Some(direction)
    }
}

fn sub(a: Point, b: Point) -> Point {
    Point::new(a.x - b.x, a.y - b.y)
}

fn cross(a: Point, b: Point) -> f32 {
    a.x * b.y - a.y * b.x
}

/// Running totals of emitted count records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountTally {
    pub total: u64,
    pub by_class: BTreeMap<VehicleClass, u64>,
    pub by_direction: BTreeMap<Direction, u64>,
}

impl CountTally {
    pub fn record(&mut self, record: &CountRecord) {
        self.total += 1;
        *self.by_class.entry(record.class).or_default() += 1;
        if let Some(direction) = record.direction {
            *self.by_direction.entry(direction).or_default() += 1;
        }
    }

    pub fn class(&self, class: VehicleClass) -> u64 {
        self.by_class.get(&class).copied().unwrap_or(0)
    }

    pub fn direction(&self, direction: Direction) -> u64 {
        self.by_direction.get(&direction).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn horizontal() -> CountingLine {
        CountingLine::new(Point::new(0.0, 100.0), Point::new(640.0, 100.0))
    }

    #[test]
    fn test_side_convention() {
        let line = horizontal();
        assert!(line.side(Point::new(10.0, 50.0)) > 0.0);
        assert!(line.side(Point::new(10.0, 150.0)) < 0.0);
    }

    #[test]
    fn test_crossing_directions() {
        let line = horizontal();
        let above = Point::new(320.0, 80.0);
        let below = Point::new(320.0, 120.0);
        assert_eq!(line.crossing(below, above), Some(Direction::Up));
        assert_eq!(line.crossing(above, below), Some(Direction::Down));
        assert_eq!(line.crossing(above, Point::new(300.0, 90.0)), None);
    }

    #[test]
    fn test_crossing_outside_segment_ignored() {
        let line = CountingLine::new(Point::new(0.0, 100.0), Point::new(200.0, 100.0));
        assert_eq!(line.crossing(Point::new(300.0, 80.0), Point::new(300.0, 120.0)), None);
        assert_eq!(
            line.crossing(Point::new(150.0, 80.0), Point::new(150.0, 120.0)),
            Some(Direction::Down)
        );
    }

    #[test]
    fn test_touching_counts_once() {
        let line = horizontal();
        let on = Point::new(320.0, 100.0);
        assert_eq!(line.crossing(Point::new(320.0, 80.0), on), Some(Direction::Down));
        // Leaving the line is not a second crossing.
        assert_eq!(line.crossing(on, Point::new(320.0, 120.0)), None);
    }

    #[test]
    fn test_short_line_rejected() {
        assert!(CountingLine::new(Point::new(0.0, 0.0), Point::new(3.0, 3.0)).validate().is_err());
        assert!(horizontal().validate().is_ok());
    }

    #[test]
    fn test_tally() {
        let now = Utc::now();
        let mut tally = CountTally::default();
        let mut record = CountRecord {
            track_id: 1,
            class: VehicleClass::Car,
            direction: Some(Direction::Up),
            line: Some(0),
            entered_at: now,
            exited_at: now,
            trail_length: 4,
        };
        tally.record(&record);
        record.track_id = 2;
        record.class = VehicleClass::Truck;
        record.direction = None;
        tally.record(&record);

        assert_eq!(tally.total, 2);
        assert_eq!(tally.class(VehicleClass::Car), 1);
        assert_eq!(tally.class(VehicleClass::Bus), 0);
        assert_eq!(tally.direction(Direction::Up), 1);
        assert_eq!(tally.direction(Direction::Down), 0);
    }
}
