//! Unscented Kalman filter for quadrotor pose estimation.
//!
//! IMU samples drive an unscented predict of a 16-entry state (position,
//! attitude, velocity, body rates, acceleration); pose fixes from an external
//! localizer correct it. Results go out through a [`publisher::PoseSink`].

pub mod belief;
pub mod error;
pub mod filters;
pub mod publisher;
pub mod rerun_logger;
pub mod sensor_fusion;
pub mod types;

pub use belief::{BeliefStore, PoseFix, QuadBelief};
pub use error::{EstimatorError, EstimatorResult};
pub use filters::quad_model::{QuadModel, QuadState};
pub use filters::ukf::{ObservationModel, ProcessModel, UkfEngine, UkfParams};
pub use publisher::{PoseSink, Publisher};
pub use sensor_fusion::{EstimatorConfig, QuadEstimator};
