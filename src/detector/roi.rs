use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::tracker::Point;

/// Region of interest: a closed polygon in frame pixels.
///
/// Serialized as a plain list of points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roi {
    points: Vec<Point>,
}

impl Roi {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Axis-aligned rectangular region.
    pub fn rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new(vec![
            Point::new(x, y),
            Point::new(x + width, y),
            Point::new(x + width, y + height),
            Point::new(x, y + height),
        ])
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn validate(&self) -> Result<()> {
        if self.points.len() < 3 {
            return Err(PipelineError::config(format!(
                "roi needs at least 3 points, got {}",
                self.points.len()
            )));
        }
        if self.signed_area().abs() < f32::EPSILON {
            return Err(PipelineError::config("roi polygon has zero area"));
        }
        Ok(())
    }

    /// Even-odd ray casting test.
    pub fn contains(&self, p: Point) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (a, b) = (self.points[i], self.points[j]);
            if (a.y > p.y) != (b.y > p.y) {
                let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
                if p.x < x_cross {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }

    fn signed_area(&self) -> f32 {
        let n = self.points.len();
        (0..n)
            .map(|i| {
                let (a, b) = (self.points[i], self.points[(i + 1) % n]);
                a.x * b.y - b.x * a.y
            })
            .sum::<f32>()
            / 2.0
    }
}
