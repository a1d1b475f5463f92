//! Constant-velocity Kalman filter over (cx, cy, aspect, height), using
//! ndarray and a nalgebra-based 4x4 inverse.

use ndarray::{Array1, Array2};

use crate::tracker::rect::Rect;

const NDIM: usize = 4;

/// Filter state of one track: 8-dim mean (xyah plus velocities) and covariance.
#[derive(Debug, Clone)]
pub struct KalmanState {
    mean: Array1<f64>,
    covariance: Array2<f64>,
}

impl KalmanState {
    /// Box at the current estimate.
    pub fn rect(&self) -> Rect {
        let m = &self.mean;
        Rect::from_xyah(m[0] as f32, m[1] as f32, m[2] as f32, m[3] as f32)
    }

    /// Centroid velocity in pixels per frame.
    pub fn velocity(&self) -> (f32, f32) {
        (self.mean[NDIM] as f32, self.mean[NDIM + 1] as f32)
    }
}

#[derive(Debug, Clone)]
pub struct KalmanFilter {
    motion_mat: Array2<f64>,
    update_mat: Array2<f64>,
    std_weight_position: f64,
    std_weight_velocity: f64,
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl KalmanFilter {
    pub fn new() -> Self {
        let mut motion_mat = Array2::eye(2 * NDIM);
        for i in 0..NDIM {
            motion_mat[[i, NDIM + i]] = 1.0;
        }

        let mut update_mat = Array2::zeros((NDIM, 2 * NDIM));
        for i in 0..NDIM {
            update_mat[[i, i]] = 1.0;
        }

        Self {
            motion_mat,
            update_mat,
            std_weight_position: 1.0 / 20.0,
            std_weight_velocity: 1.0 / 160.0,
        }
    }

    /// Start a track at `rect` with zero velocity.
    pub fn initiate(&self, rect: &Rect) -> KalmanState {
        let z = measurement(rect);
        let mut mean = Array1::zeros(2 * NDIM);
        for i in 0..NDIM {
            mean[i] = z[i];
        }

        let h = z[3];
        let pos = 2.0 * self.std_weight_position * h;
        let vel = 10.0 * self.std_weight_velocity * h;
        KalmanState {
            mean,
            covariance: diagonal(&[pos, pos, 1e-2, pos, vel, vel, 1e-5, vel]),
        }
    }

    /// Advance one frame. `freeze_height` stops the height drifting while
    /// the track is unmatched.
    pub fn predict(&self, state: &mut KalmanState, freeze_height: bool) {
        if freeze_height {
            state.mean[2 * NDIM - 1] = 0.0;
        }
        let h = state.mean[3];
        let pos = self.std_weight_position * h;
        let vel = self.std_weight_velocity * h;
        let motion_cov = diagonal(&[pos, pos, 1e-2, pos, vel, vel, 1e-5, vel]);

        state.mean = self.motion_mat.dot(&state.mean);
        state.covariance =
            self.motion_mat.dot(&state.covariance).dot(&self.motion_mat.t()) + motion_cov;
    }

    fn project(&self, state: &KalmanState) -> (Array1<f64>, Array2<f64>) {
        let pos = self.std_weight_position * state.mean[3];
        let innovation_cov = diagonal(&[pos, pos, 1e-1, pos]);

        let mean = self.update_mat.dot(&state.mean);
        let covariance =
            self.update_mat.dot(&state.covariance).dot(&self.update_mat.t()) + innovation_cov;
        (mean, covariance)
    }

    /// Correct the state with an observed box. Returns `false`, leaving the
    /// state untouched, when the innovation covariance is singular.
    pub fn update(&self, state: &mut KalmanState, rect: &Rect) -> bool {
        let (projected_mean, projected_cov) = self.project(state);
        let Some(s_inv) = invert_4x4(&projected_cov) else {
            return false;
        };

        let innovation = Array1::from_vec(measurement(rect).to_vec()) - projected_mean;

        // K = P * H^T * S^-1; with H = [I 0], P * H^T is the first 4 columns of P.
        let pht = state.covariance.dot(&self.update_mat.t());
        let kalman_gain = pht.dot(&s_inv);

        state.mean = &state.mean + &kalman_gain.dot(&innovation);
        state.covariance =
            &state.covariance - &kalman_gain.dot(&projected_cov).dot(&kalman_gain.t());
        true
    }
}

fn measurement(rect: &Rect) -> [f64; 4] {
    rect.to_xyah().map(f64::from)
}

fn diagonal(std: &[f64]) -> Array2<f64> {
    Array2::from_diag(&Array1::from_iter(std.iter().map(|s| s * s)))
}

fn invert_4x4(m: &Array2<f64>) -> Option<Array2<f64>> {
    let nm = nalgebra::Matrix4::from_fn(|i, j| m[[i, j]]);
    let inv = nm.try_inverse()?;
    Some(Array2::from_shape_fn((NDIM, NDIM), |(i, j)| inv[(i, j)]))
}
