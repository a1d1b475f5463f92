mod counting;
mod kalman_filter;
mod matching;
mod rect;
mod track;
mod track_state;
mod vehicle_tracker;

pub use counting::{CountTally, CountingLine, Direction, MIN_LINE_LENGTH};
pub use kalman_filter::{KalmanFilter, KalmanState};
pub use matching::{
    AssignmentResult, CostWeights, assign, association_cost, cost_matrix, greedy_assignment,
    linear_assignment,
};
pub use rect::{Point, Rect};
pub use track::Track;
pub use track_state::TrackState;
pub use vehicle_tracker::{FrameContext, Tracker};
