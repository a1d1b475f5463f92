use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::tracker::{Point, Rect};

/// Vehicle categories kept from the detector's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleClass {
    Car,
    Motorcycle,
    Bus,
    Truck,
}

impl VehicleClass {
    pub const ALL: [VehicleClass; 4] = [Self::Car, Self::Motorcycle, Self::Bus, Self::Truck];

    /// Map a COCO class id to a vehicle class. Non-vehicle ids yield `None`.
    pub fn from_coco_id(id: usize) -> Option<Self> {
        match id {
            2 => Some(Self::Car),
            3 => Some(Self::Motorcycle),
            5 => Some(Self::Bus),
            7 => Some(Self::Truck),
            _ => None,
        }
    }

    pub fn coco_id(self) -> usize {
        match self {
            Self::Car => 2,
            Self::Motorcycle => 3,
            Self::Bus => 5,
            Self::Truck => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Car => "car",
            Self::Motorcycle => "motorcycle",
            Self::Bus => "bus",
            Self::Truck => "truck",
        }
    }
}

impl fmt::Display for VehicleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VehicleClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown vehicle class '{s}'"))
    }
}

/// One filtered inference result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Bounding box in frame pixels.
    pub bbox: Rect,
    /// Confidence in [0, 1].
    pub score: f32,
    pub class: VehicleClass,
}

impl Detection {
    /// Create a detection from TLBR corners.
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, score: f32, class: VehicleClass) -> Self {
        Self {
            bbox: Rect::from_tlbr(x1, y1, x2, y2),
            score,
            class,
        }
    }

    pub fn from_rect(bbox: Rect, score: f32, class: VehicleClass) -> Self {
        Self { bbox, score, class }
    }

    pub fn centroid(&self) -> Point {
        self.bbox.centroid()
    }
}
