//! Shared belief record
//!
//! One record (state, covariance, timestamp) plus the last accepted pose fix,
//! behind a single timed mutex. IMU and pose handlers take the lock, compute
//! the new belief from a snapshot, and commit it with `replace`.

use std::time::Duration;

use nalgebra::{DMatrix, Vector3};
use parking_lot::{Mutex, MutexGuard};

use crate::error::{EstimatorError, EstimatorResult};
use crate::filters::quad_model::QuadState;
use crate::sensor_fusion::EstimatorConfig;
use crate::types::linalg::STATE_DIM;

/// State estimate and covariance at `timestamp`.
#[derive(Clone, Debug, PartialEq)]
pub struct QuadBelief {
    pub state: QuadState,
    pub covariance: DMatrix<f64>,
    /// Seconds
    pub timestamp: f64,
    /// Gap covered by the update that produced this belief
    pub dt: f64,
}

impl QuadBelief {
    /// Belief at rest: configured position, identity attitude, diagonal covariance.
    pub fn initial(config: &EstimatorConfig, t0: f64) -> Self {
        let [x, y, z] = config.initial_position;
        Self {
            state: QuadState::at_rest(Vector3::new(x, y, z)),
            covariance: DMatrix::<f64>::identity(STATE_DIM, STATE_DIM) * config.initial_covariance,
            timestamp: t0,
            dt: config.initial_dt,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.state.is_finite() && self.covariance.iter().all(|v| v.is_finite())
    }
}

/// Last pose fix, in filter-frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseFix {
    pub timestamp: f64,
    pub position: Vector3<f64>,
}

#[derive(Clone, Debug)]
pub struct BeliefRecord {
    pub belief: QuadBelief,
    pub last_pose: Option<PoseFix>,
}

pub struct BeliefStore {
    record: Mutex<BeliefRecord>,
    timeout: Duration,
}

impl BeliefStore {
    pub fn new(belief: QuadBelief, timeout: Duration) -> Self {
        Self {
            record: Mutex::new(BeliefRecord {
                belief,
                last_pose: None,
            }),
            timeout,
        }
    }

    /// Exclusive access, waiting at most the configured timeout.
    pub fn acquire(&self) -> EstimatorResult<BeliefGuard<'_>> {
        self.acquire_within(self.timeout)
    }

    pub fn acquire_within(&self, timeout: Duration) -> EstimatorResult<BeliefGuard<'_>> {
        self.record
            .try_lock_for(timeout)
            .map(|guard| BeliefGuard { guard })
            .ok_or(EstimatorError::Timeout(timeout.as_millis() as u64))
    }

    /// Copy of the current belief.
    pub fn snapshot(&self) -> EstimatorResult<QuadBelief> {
        Ok(self.acquire()?.snapshot())
    }
}

/// Held lock on the belief record.
pub struct BeliefGuard<'a> {
    guard: MutexGuard<'a, BeliefRecord>,
}

impl BeliefGuard<'_> {
    pub fn snapshot(&self) -> QuadBelief {
        self.guard.belief.clone()
    }

    pub fn belief(&self) -> &QuadBelief {
        &self.guard.belief
    }

    pub fn replace(&mut self, belief: QuadBelief) {
        self.guard.belief = belief;
    }

    pub fn last_pose(&self) -> Option<PoseFix> {
        self.guard.last_pose
    }

    pub fn set_last_pose(&mut self, fix: PoseFix) {
        self.guard.last_pose = Some(fix);
    }
}
