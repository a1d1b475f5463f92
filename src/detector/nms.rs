use std::cmp::Ordering;

use super::Detection;

/// Class-agnostic greedy non-max suppression.
///
/// Boxes are visited by descending score (stable, so equal scores keep their
/// input order). A box is suppressed when its IoU with an already kept box is
/// at or above `iou_threshold`.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let mut kept: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if kept.iter().all(|k| k.bbox.iou(&det.bbox) < iou_threshold) {
            kept.push(det);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::VehicleClass;

    fn det(x: f32, score: f32) -> Detection {
        Detection::new(x, 0.0, x + 100.0, 100.0, score, VehicleClass::Car)
    }

    #[test]
    fn test_suppresses_overlapping_weaker_box() {
        let kept = non_max_suppression(vec![det(10.0, 0.6), det(0.0, 0.9), det(500.0, 0.5)], 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.9);
        assert_eq!(kept[1].score, 0.5);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        // IoU of these two boxes is exactly 1/3.
        let a = Detection::new(0.0, 0.0, 100.0, 100.0, 0.9, VehicleClass::Car);
        let b = Detection::new(50.0, 0.0, 150.0, 100.0, 0.8, VehicleClass::Truck);
        let iou = a.bbox.iou(&b.bbox);
        assert_eq!(non_max_suppression(vec![a, b], iou).len(), 1);
        assert_eq!(non_max_suppression(vec![a, b], iou + 1e-4).len(), 2);
    }

    #[test]
    fn test_equal_scores_keep_input_order() {
        let kept = non_max_suppression(vec![det(0.0, 0.7), det(5.0, 0.7)], 0.5);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].bbox.x, 0.0);
    }

    #[test]
    fn test_empty_input() {
        assert!(non_max_suppression(Vec::new(), 0.5).is_empty());
    }
}
