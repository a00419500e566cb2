//! Quadrotor motion and observation model
//!
//! State layout (16 entries, contiguous):
//! - 0..3   position [m], world frame
//! - 3..7   orientation quaternion (x, y, z, w)
//! - 7..10  velocity [m/s], world frame
//! - 10..13 body angular velocity [rad/s]
//! - 13..16 acceleration [m/s²]
//!
//! The measurement is the first 10 entries (position, quaternion, velocity).

use nalgebra::{DVector, Matrix3, Matrix4, Quaternion, UnitQuaternion, Vector3, Vector4};

use super::ukf::{ObservationModel, ProcessModel};
use crate::types::linalg::{PoseMeasVec, StateVec16, MEASURE_DIM_POSE};
use crate::types::{Quat, Vec3};

pub const IDX_POSITION: usize = 0;
pub const IDX_QUATERNION: usize = 3;
pub const IDX_VELOCITY: usize = 7;
pub const IDX_ANGULAR_VELOCITY: usize = 10;
pub const IDX_ACCELERATION: usize = 13;

/// Standard gravity magnitude [m/s²]
pub const GRAVITY: f64 = 9.81;

/// Gravity in the world frame, z up.
pub fn gravity_world() -> Vector3<f64> {
    Vector3::new(0.0, 0.0, -GRAVITY)
}

/// Named view over the 16-entry state buffer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuadState(pub StateVec16);

impl Default for QuadState {
    fn default() -> Self {
        let mut state = QuadState(StateVec16::zeros());
        state.set_orientation(Quaternion::identity());
        state
    }
}

impl QuadState {
    /// Rest state at `position` with identity orientation.
    pub fn at_rest(position: Vector3<f64>) -> Self {
        let mut state = Self::default();
        state.set_position(position);
        state
    }

    /// Read a state out of a dynamic column. Missing entries come back as NaN.
    pub fn from_column(x: &DVector<f64>) -> Self {
        QuadState(StateVec16::from_fn(|i, _| {
            x.get(i).copied().unwrap_or(f64::NAN)
        }))
    }

    pub fn to_column(&self) -> DVector<f64> {
        DVector::from_column_slice(self.0.as_slice())
    }

    pub fn position(&self) -> Vector3<f64> {
        self.0.fixed_rows::<3>(IDX_POSITION).into_owned()
    }

    pub fn set_position(&mut self, p: Vector3<f64>) {
        self.0.fixed_rows_mut::<3>(IDX_POSITION).copy_from(&p);
    }

    /// Orientation as stored; not renormalized.
    pub fn orientation(&self) -> Quaternion<f64> {
        Quaternion::from_vector(self.0.fixed_rows::<4>(IDX_QUATERNION).into_owned())
    }

    pub fn set_orientation(&mut self, q: Quaternion<f64>) {
        self.0.fixed_rows_mut::<4>(IDX_QUATERNION).copy_from(&q.coords);
    }

    pub fn velocity(&self) -> Vector3<f64> {
        self.0.fixed_rows::<3>(IDX_VELOCITY).into_owned()
    }

    pub fn set_velocity(&mut self, v: Vector3<f64>) {
        self.0.fixed_rows_mut::<3>(IDX_VELOCITY).copy_from(&v);
    }

    pub fn angular_velocity(&self) -> Vector3<f64> {
        self.0.fixed_rows::<3>(IDX_ANGULAR_VELOCITY).into_owned()
    }

    pub fn set_angular_velocity(&mut self, w: Vector3<f64>) {
        self.0.fixed_rows_mut::<3>(IDX_ANGULAR_VELOCITY).copy_from(&w);
    }

    pub fn acceleration(&self) -> Vector3<f64> {
        self.0.fixed_rows::<3>(IDX_ACCELERATION).into_owned()
    }

    pub fn set_acceleration(&mut self, a: Vector3<f64>) {
        self.0.fixed_rows_mut::<3>(IDX_ACCELERATION).copy_from(&a);
    }

    pub fn normalize_orientation(&mut self) {
        let q = normalize_quat(self.orientation());
        self.set_orientation(q);
    }

    /// Position, quaternion and velocity: what a pose fix observes.
    pub fn measurement(&self) -> PoseMeasVec {
        self.0.fixed_rows::<MEASURE_DIM_POSE>(0).into_owned()
    }

    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}

/// Unit quaternion, or identity when the input has collapsed to zero.
pub fn normalize_quat(q: Quaternion<f64>) -> Quaternion<f64> {
    let norm = q.norm();
    if norm < 1e-12 || !norm.is_finite() {
        return Quaternion::identity();
    }
    q / norm
}

/// Body-to-world rotation of q.
pub fn rotation_matrix(q: &Quaternion<f64>) -> Matrix3<f64> {
    UnitQuaternion::new_normalize(normalize_quat(*q))
        .to_rotation_matrix()
        .into_inner()
}

/// Ω(ω) with q̇ = ½·Ω(ω)·q for q laid out as (x, y, z, w).
pub fn big_omega(w: &Vector3<f64>) -> Matrix4<f64> {
    #[rustfmt::skip]
    let omega = Matrix4::new(
        0.0,   w.z,  -w.y,  w.x,
        -w.z,  0.0,   w.x,  w.y,
        w.y,  -w.x,   0.0,  w.z,
        -w.x, -w.y,  -w.z,  0.0,
    );
    omega
}

/// First-order quaternion integration followed by renormalization.
pub fn integrate_orientation(q: &Quaternion<f64>, w: &Vector3<f64>, dt: f64) -> Quaternion<f64> {
    let q = normalize_quat(*q);
    let coords: Vector4<f64> = q.coords + big_omega(w) * q.coords * (0.5 * dt);
    normalize_quat(Quaternion::from_vector(coords))
}

/// Resolve the double-cover sign of `new` against `prev`.
///
/// Both are normalized first. `new` is kept when it lies closer to `prev`
/// than its negation does; otherwise the negation is returned. A tie
/// negates.
pub fn check_quat(prev: &Quaternion<f64>, new: &Quaternion<f64>) -> Quaternion<f64> {
    let prev = normalize_quat(*prev);
    let new = normalize_quat(*new);
    if (prev + new).norm() > (prev - new).norm() {
        new
    } else {
        -new
    }
}

/// Net acceleration in body frame: specific force plus gravity seen from the body.
pub fn remove_gravity(specific_force: &Vector3<f64>, q: &Quaternion<f64>) -> Vector3<f64> {
    specific_force + rotation_matrix(q).transpose() * gravity_world()
}

/// Deterministic extrapolation used ahead of a pose correction.
///
/// Velocity integrates the stored acceleration, position integrates
/// trapezoidally, orientation integrates Ω(ω). Acceleration and angular
/// velocity carry over.
pub fn propagate_kinematics(state: &QuadState, dt: f64) -> QuadState {
    let mut next = *state;

    let v = state.velocity();
    let v_next = v + state.acceleration() * dt;
    next.set_velocity(v_next);
    next.set_position(state.position() + (v + v_next) * (0.5 * dt));
    next.set_orientation(integrate_orientation(
        &state.orientation(),
        &state.angular_velocity(),
        dt,
    ));

    next
}

// ===== Sensor frame remaps =====

/// Gyro axes to filter axes: y flipped.
pub fn imu_angular_velocity(raw: &Vec3) -> Vector3<f64> {
    Vector3::new(raw.x, -raw.y, raw.z)
}

/// Accelerometer axes to filter axes: x flipped.
pub fn imu_specific_force(raw: &Vec3) -> Vector3<f64> {
    Vector3::new(-raw.x, raw.y, raw.z)
}

/// Localizer position to filter frame: x flipped.
pub fn pose_position(raw: &Vec3) -> Vector3<f64> {
    Vector3::new(-raw.x, raw.y, raw.z)
}

/// Localizer orientation to filter frame: (x, y, z, w) := (w, −z, y, x).
pub fn pose_orientation(raw: &Quat) -> Quaternion<f64> {
    // Quaternion::new takes (w, i, j, k)
    Quaternion::new(raw.x, raw.w, -raw.z, raw.y)
}

/// Process and observation functions for the quadrotor.
///
/// `prev_accel_world` is the world-frame acceleration left in the belief by
/// the previous update; it is the left end of the trapezoid for velocity.
#[derive(Clone, Copy, Debug, Default)]
pub struct QuadModel {
    pub prev_accel_world: Vector3<f64>,
}

impl QuadModel {
    pub fn new(prev_accel_world: Vector3<f64>) -> Self {
        Self { prev_accel_world }
    }

    pub fn step(&self, state: &QuadState, dt: f64) -> QuadState {
        let mut next = *state;

        let q = normalize_quat(state.orientation());
        let w = state.angular_velocity();
        next.set_orientation(integrate_orientation(&q, &w, dt));

        let a_world = rotation_matrix(&q) * state.acceleration();
        next.set_acceleration(a_world);

        let v = state.velocity();
        let v_next = v + (self.prev_accel_world + a_world) * (0.5 * dt);
        next.set_velocity(v_next);
        next.set_position(state.position() + (v + v_next) * (0.5 * dt));

        next
    }
}

impl ProcessModel for QuadModel {
    fn process(&self, x: &DVector<f64>, dt: f64) -> DVector<f64> {
        self.step(&QuadState::from_column(x), dt).to_column()
    }
}

impl ObservationModel for QuadModel {
    fn measurement_dim(&self) -> usize {
        MEASURE_DIM_POSE
    }

    fn observe(&self, x: &DVector<f64>) -> DVector<f64> {
        x.rows(0, MEASURE_DIM_POSE.min(x.len())).into_owned()
    }
}
