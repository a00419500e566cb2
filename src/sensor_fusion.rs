// sensor_fusion.rs: IMU/pose ingest for the quadrotor UKF
//
// Nothing in here knows about files, threads or the CLI. Callers hand in IMU
// and pose events (possibly from two threads at once) and get the updated
// belief published through whatever PoseSink they supplied.
//
// Each handler takes the belief lock, computes a new belief from a snapshot
// and commits it in one step. A failed update leaves the belief untouched.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, trace, warn};
use nalgebra::{DMatrix, DVector, Vector3};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::belief::{BeliefStore, PoseFix, QuadBelief};
use crate::error::{EstimatorError, EstimatorResult};
use crate::filters::quad_model::{
    check_quat, imu_angular_velocity, imu_specific_force, normalize_quat, pose_orientation,
    pose_position, propagate_kinematics, remove_gravity, QuadModel, QuadState, IDX_VELOCITY,
};
use crate::filters::ukf::{UkfEngine, UkfParams};
use crate::publisher::{PoseSink, Publisher, POSE_ARRAY_SIZE};
use crate::types::linalg::{MEASURE_DIM_POSE, STATE_DIM};
use crate::types::{ImuEvent, PoseArray, PoseEvent};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    // ── Noise (variances on the diagonal) ──
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub initial_covariance: f64,

    // ── Initial belief ──
    pub initial_position: [f64; 3],
    pub initial_dt: f64,

    // ── Output / concurrency ──
    pub pose_history_size: usize,
    pub lock_timeout_ms: u64,

    pub ukf: UkfParams,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            process_noise: 0.01,
            measurement_noise: 0.01,
            initial_covariance: 0.01,
            initial_position: [0.0, 0.0, 1.0],
            initial_dt: 1e-4,
            pose_history_size: POSE_ARRAY_SIZE,
            lock_timeout_ms: 100,
            ukf: UkfParams::default(),
        }
    }
}

impl EstimatorConfig {
    /// Read a JSON config; missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Additive noise matrices, fixed at construction.
#[derive(Clone, Debug)]
pub struct NoiseModel {
    pub process: DMatrix<f64>,
    pub measurement: DMatrix<f64>,
}

impl NoiseModel {
    pub fn from_config(config: &EstimatorConfig) -> Self {
        Self {
            process: DMatrix::<f64>::identity(STATE_DIM, STATE_DIM) * config.process_noise,
            measurement: DMatrix::<f64>::identity(MEASURE_DIM_POSE, MEASURE_DIM_POSE)
                * config.measurement_noise,
        }
    }
}

// ─── Estimator ───────────────────────────────────────────────────────────────

pub struct QuadEstimator<S: PoseSink> {
    config: EstimatorConfig,
    engine: UkfEngine,
    noise: NoiseModel,
    store: BeliefStore,
    // Taken after the belief lock, never before it.
    publisher: Mutex<Publisher<S>>,
}

impl<S: PoseSink> QuadEstimator<S> {
    /// Estimator at rest at the configured position, timestamped `t0`.
    pub fn new(config: EstimatorConfig, t0: f64, sink: S) -> Self {
        let belief = QuadBelief::initial(&config, t0);
        let store = BeliefStore::new(belief, config.lock_timeout());
        let publisher = Publisher::with_capacity(sink, config.pose_history_size);

        Self {
            engine: UkfEngine::new(STATE_DIM, config.ukf),
            noise: NoiseModel::from_config(&config),
            store,
            publisher: Mutex::new(publisher),
            config,
        }
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn store(&self) -> &BeliefStore {
        &self.store
    }

    /// Current belief (waits for the belief lock like any other caller).
    pub fn belief(&self) -> EstimatorResult<QuadBelief> {
        self.store.snapshot()
    }

    /// Copy of the rolling pose history, newest first.
    pub fn pose_history(&self) -> PoseArray {
        self.publisher.lock().history().clone()
    }

    pub fn published(&self) -> usize {
        self.publisher.lock().published()
    }

    pub fn flush_sinks(&self) -> std::io::Result<()> {
        self.publisher.lock().sink_mut().flush()
    }

    /// Unscented predict driven by one IMU sample.
    pub fn handle_imu(&self, event: &ImuEvent) -> EstimatorResult<()> {
        let mut guard = self.store.acquire().map_err(|e| {
            warn!("IMU event at t={:.6} dropped: {}", event.timestamp, e);
            e
        })?;
        let prior = guard.snapshot();

        match self.imu_update(&prior, event) {
            Ok(belief) => {
                trace!("IMU predict t={:.6} dt={:.6}", belief.timestamp, belief.dt);
                self.publisher.lock().publish(&belief);
                guard.replace(belief);
                Ok(())
            }
            Err(e) => {
                warn!("IMU event at t={:.6} dropped ({}): {}", event.timestamp, e.kind(), e);
                Err(e)
            }
        }
    }

    /// Extrapolate, predict and correct against one external pose fix.
    pub fn handle_pose(&self, event: &PoseEvent) -> EstimatorResult<()> {
        let mut guard = self.store.acquire().map_err(|e| {
            warn!("Pose event at t={:.6} dropped: {}", event.timestamp, e);
            e
        })?;
        let prior = guard.snapshot();
        let last_fix = guard.last_pose();

        match self.pose_update(&prior, last_fix, event) {
            Ok((belief, fix)) => {
                debug!(
                    "Pose correct t={:.6} p=({:.3}, {:.3}, {:.3})",
                    belief.timestamp,
                    belief.state.position().x,
                    belief.state.position().y,
                    belief.state.position().z
                );
                self.publisher.lock().publish(&belief);
                guard.replace(belief);
                guard.set_last_pose(fix);
                Ok(())
            }
            Err(e) => {
                warn!("Pose event at t={:.6} dropped ({}): {}", event.timestamp, e.kind(), e);
                Err(e)
            }
        }
    }

    fn imu_update(&self, prior: &QuadBelief, event: &ImuEvent) -> EstimatorResult<QuadBelief> {
        let mut working = prior.state;
        let q = normalize_quat(working.orientation());

        working.set_angular_velocity(imu_angular_velocity(&event.angular_velocity));
        let force = imu_specific_force(&event.linear_acceleration);
        working.set_acceleration(remove_gravity(&force, &q));

        let dt = event.timestamp - prior.timestamp;
        let model = QuadModel::new(prior.state.acceleration());
        let predicted = self.engine.predict(
            &model,
            &working.to_column(),
            &prior.covariance,
            &self.noise.process,
            dt,
        )?;

        let state = repair_orientation(QuadState::from_column(predicted.mean()), &prior.state);
        finish(state, predicted.covariance, event.timestamp, dt)
    }

    fn pose_update(
        &self,
        prior: &QuadBelief,
        last_fix: Option<PoseFix>,
        event: &PoseEvent,
    ) -> EstimatorResult<(QuadBelief, PoseFix)> {
        let t = event.timestamp;
        let dt = t - prior.timestamp;

        let extrapolated = propagate_kinematics(&prior.state, dt);
        let model = QuadModel::new(prior.state.acceleration());
        let predicted = self.engine.predict(
            &model,
            &extrapolated.to_column(),
            &prior.covariance,
            &self.noise.process,
            dt,
        )?;

        let position = pose_position(&event.position);
        let predicted_velocity = predicted.mean().fixed_rows::<3>(IDX_VELOCITY).into_owned();
        let z = pose_measurement(
            position,
            pose_orientation(&event.orientation),
            t,
            &prior.state,
            last_fix,
            predicted_velocity,
        );

        let corrected = self
            .engine
            .correct(&model, &predicted, &z, &self.noise.measurement)?;

        let state = repair_orientation(QuadState::from_column(&corrected.mean), &prior.state);
        let belief = finish(state, corrected.covariance, t, dt)?;
        Ok((belief, PoseFix { timestamp: t, position }))
    }
}

/// 10-entry measurement: position, sign-repaired quaternion, velocity.
///
/// Velocity is the finite difference against the previous fix. Without a
/// usable previous fix it is the predicted velocity, so it carries no
/// innovation.
pub(crate) fn pose_measurement(
    position: Vector3<f64>,
    orientation: nalgebra::Quaternion<f64>,
    t: f64,
    prior: &QuadState,
    last_fix: Option<PoseFix>,
    predicted_velocity: Vector3<f64>,
) -> DVector<f64> {
    let q = check_quat(&prior.orientation(), &orientation);

    let velocity = match last_fix {
        Some(fix) if t - fix.timestamp > 0.0 => (position - fix.position) / (t - fix.timestamp),
        _ => predicted_velocity,
    };

    let mut z = DVector::<f64>::zeros(MEASURE_DIM_POSE);
    z.fixed_rows_mut::<3>(0).copy_from(&position);
    z.fixed_rows_mut::<4>(3).copy_from(&q.coords);
    z.fixed_rows_mut::<3>(7).copy_from(&velocity);
    z
}

fn repair_orientation(mut state: QuadState, prior: &QuadState) -> QuadState {
    let q = check_quat(&prior.orientation(), &state.orientation());
    state.set_orientation(q);
    state
}

fn finish(
    state: QuadState,
    covariance: DMatrix<f64>,
    timestamp: f64,
    dt: f64,
) -> EstimatorResult<QuadBelief> {
    let belief = QuadBelief {
        state,
        covariance,
        timestamp,
        dt,
    };
    if !belief.is_finite() {
        return Err(EstimatorError::NumericNonFinite("belief"));
    }
    Ok(belief)
}
