pub mod linalg;

pub use linalg::*;

use nalgebra::{Quaternion, Vector3};
use serde::{Deserialize, Serialize, Serializer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

impl From<Vector3<f64>> for Vec3 {
    fn from(v: Vector3<f64>) -> Self {
        Self::new(v.x, v.y, v.z)
    }
}

/// Quaternion in message layout (x, y, z, w).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quat {
    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 0.0, 1.0)
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Neg for Quat {
    type Output = Quat;

    fn neg(self) -> Quat {
        Quat::new(-self.x, -self.y, -self.z, -self.w)
    }
}

impl From<Quaternion<f64>> for Quat {
    fn from(q: Quaternion<f64>) -> Self {
        Self::new(q.i, q.j, q.k, q.w)
    }
}

// ===== Inputs =====

/// Inertial sample: body angular velocity [rad/s] and specific force [m/s²].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImuEvent {
    pub timestamp: f64,
    pub angular_velocity: Vec3,
    pub linear_acceleration: Vec3,
}

/// Absolute pose from the external localizer (SLAM).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoseEvent {
    pub timestamp: f64,
    pub position: Vec3,
    pub orientation: Quat,
    /// Reported 6x6 covariance; carried through but not used by the filter.
    #[serde(default)]
    pub covariance: Option<Vec<f64>>,
}

// ===== Outputs =====

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Stamp {
    pub sec: i64,
    pub nanosec: u32,
}

impl Stamp {
    /// Split seconds into whole seconds and the nanosecond remainder.
    pub fn from_secs_f64(t: f64) -> Self {
        let sec = t.floor();
        let nanosec = ((t - sec) * 1e9) as u32;
        Self {
            sec: sec as i64,
            nanosec,
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nanosec as f64 * 1e-9
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Header {
    pub stamp: Stamp,
    pub frame_id: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Pose {
    pub position: Vec3,
    pub orientation: Quat,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoseStamped {
    pub header: Header,
    pub pose: Pose,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoseWithCovarianceStamped {
    pub header: Header,
    pub pose: Pose,
    /// Upper-left 6x6 block of the state covariance, row-major.
    #[serde(serialize_with = "serialize_covariance")]
    pub covariance: [f64; 36],
}

/// Rolling pose history, newest first.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PoseArray {
    pub header: Header,
    pub poses: std::collections::VecDeque<Pose>,
}

fn serialize_covariance<S: Serializer>(cov: &[f64; 36], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(cov.iter())
}
