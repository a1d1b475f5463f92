//! Association cost and assignment for the tracker.

use std::cmp::Ordering;

use ndarray::Array2;

use crate::config::{AssignmentStrategy, TrackingConfig};
use crate::tracker::rect::Rect;

/// Weights of the association cost, normalised to sum to one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostWeights {
    pub iou: f32,
    pub distance: f32,
    /// Centroid distance (px) at which the distance term saturates.
    pub max_distance: f32,
}

impl CostWeights {
    pub fn new(iou: f32, distance: f32, max_distance: f32) -> Self {
        let sum = iou + distance;
        let (iou, distance) = if sum > 0.0 {
            (iou / sum, distance / sum)
        } else {
            (1.0, 0.0)
        };
        Self {
            iou,
            distance,
            max_distance: max_distance.max(f32::EPSILON),
        }
    }

    pub fn from_config(config: &TrackingConfig) -> Self {
        Self::new(config.iou_weight, config.distance_weight, config.max_distance)
    }
}

impl Default for CostWeights {
    fn default() -> Self {
        Self::new(0.7, 0.3, 100.0)
    }
}

/// `w_iou * (1 - IoU) + w_dist * min(d / max_distance, 1)`, in [0, 1].
pub fn association_cost(track: &Rect, detection: &Rect, weights: &CostWeights) -> f32 {
    let iou_term = 1.0 - track.iou(detection);
    let distance = track.centroid().distance(&detection.centroid());
    let distance_term = (distance / weights.max_distance).min(1.0);
    weights.iou * iou_term + weights.distance * distance_term
}

/// Cost matrix with one row per track and one column per detection.
pub fn cost_matrix(tracks: &[Rect], detections: &[Rect], weights: &CostWeights) -> Array2<f32> {
    Array2::from_shape_fn((tracks.len(), detections.len()), |(i, j)| {
        association_cost(&tracks[i], &detections[j], weights)
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentResult {
    /// (row, column) pairs.
    pub matches: Vec<(usize, usize)>,
    pub unmatched_tracks: Vec<usize>,
    pub unmatched_detections: Vec<usize>,
}

impl AssignmentResult {
    fn from_matches(matches: Vec<(usize, usize)>, rows: usize, cols: usize) -> Self {
        let mut row_used = vec![false; rows];
        let mut col_used = vec![false; cols];
        for &(r, c) in &matches {
            row_used[r] = true;
            col_used[c] = true;
        }
        Self {
            matches,
            unmatched_tracks: (0..rows).filter(|&r| !row_used[r]).collect(),
            unmatched_detections: (0..cols).filter(|&c| !col_used[c]).collect(),
        }
    }
}

/// Solve the assignment with `strategy`. Rows must be ordered by ascending
/// track id so that ties resolve to the lower id.
pub fn assign(strategy: AssignmentStrategy, cost: &Array2<f32>, max_cost: f32) -> AssignmentResult {
    match strategy {
        AssignmentStrategy::Greedy => greedy_assignment(cost, max_cost),
        AssignmentStrategy::Optimal => linear_assignment(cost, max_cost),
    }
}

/// Repeatedly take the cheapest remaining pair at or under `max_cost`.
/// Equal costs go to the lower row, then the lower column.
pub fn greedy_assignment(cost: &Array2<f32>, max_cost: f32) -> AssignmentResult {
    let (rows, cols) = cost.dim();
    let mut pairs: Vec<(f32, usize, usize)> = cost
        .indexed_iter()
        .filter(|&(_, &c)| c <= max_cost)
        .map(|((r, c), &v)| (v, r, c))
        .collect();
    pairs.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });

    let mut row_used = vec![false; rows];
    let mut col_used = vec![false; cols];
    let mut matches = Vec::new();
    for (_, r, c) in pairs {
        if !row_used[r] && !col_used[c] {
            row_used[r] = true;
            col_used[c] = true;
            matches.push((r, c));
        }
    }
    matches.sort_unstable();
    AssignmentResult::from_matches(matches, rows, cols)
}

/// Row bias separating equal costs; far below the f32 resolution of a cost.
const TIE_BIAS: f64 = 1e-9;

/// Minimum-cost assignment (Jonker-Volgenant). Pairs over `max_cost` are
/// never matched.
///
/// The matrix is padded to square with a forbidden cost larger than any
/// full assignment of permitted pairs, so the solver first maximises the
/// number of permitted matches and then minimises their total cost. Each
/// permitted cell carries `row * TIE_BIAS` so that equal costs go to the
/// lower row (the lower track id).
pub fn linear_assignment(cost: &Array2<f32>, max_cost: f32) -> AssignmentResult {
    let (rows, cols) = cost.dim();
    if rows == 0 || cols == 0 {
        return AssignmentResult::from_matches(Vec::new(), rows, cols);
    }

    let size = rows.max(cols);
    let ceiling = cost
        .iter()
        .filter(|&&v| v <= max_cost)
        .fold(0.0_f64, |acc, &v| acc.max(v as f64));
    let forbidden = (ceiling + 1.0) * size as f64 + 1.0;
    let mut padded = Array2::<f64>::from_elem((size, size), forbidden);
    for ((r, c), &v) in cost.indexed_iter() {
        if v <= max_cost {
            padded[[r, c]] = v as f64 + r as f64 * TIE_BIAS;
        }
    }

    let matches = match lapjv::lapjv(&padded) {
        Ok((row_to_col, _)) => row_to_col
            .into_iter()
            .enumerate()
            .filter(|&(r, c)| r < rows && c < cols && cost[[r, c]] <= max_cost)
            .collect(),
        Err(err) => {
            tracing::warn!(error = ?err, "assignment solver failed, falling back to greedy");
            return greedy_assignment(cost, max_cost);
        }
    };
    AssignmentResult::from_matches(matches, rows, cols)
}
