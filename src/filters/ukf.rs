//! Generic unscented Kalman filter engine
//!
//! State vector of dimension n, measurement of dimension m. The engine knows
//! nothing about quadrotors: the process and observation functions are
//! supplied through [`ProcessModel`] and [`ObservationModel`].
//!
//! The prediction keeps its transformed sigma points and deviations, and the
//! correction reuses them (no re-sampling) to form the cross-covariance.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{EstimatorError, EstimatorResult};
use crate::types::linalg::{
    is_finite_matrix, is_finite_vector, ldl_lower_factor, repeat_columns, symmetrize,
};

/// Relative singular-value floor below which the innovation covariance is
/// treated as singular.
const SINGULAR_TOLERANCE: f64 = 1e-12;

/// x(t + dt) = f(x(t), dt)
pub trait ProcessModel {
    fn process(&self, x: &DVector<f64>, dt: f64) -> DVector<f64>;
}

/// z = h(x)
pub trait ObservationModel {
    fn measurement_dim(&self) -> usize;
    fn observe(&self, x: &DVector<f64>) -> DVector<f64>;
}

/// Unscented transform parameters
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UkfParams {
    pub alpha: f64, // Spread of sigma points
    pub beta: f64,  // Prior knowledge (2.0 for Gaussian)
    pub kappa: f64, // Secondary scaling
}

impl Default for UkfParams {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 2.0,
            kappa: 0.0,
        }
    }
}

impl UkfParams {
    /// λ = α²(n + κ) − n
    pub fn lambda(&self, n: usize) -> f64 {
        self.alpha * self.alpha * (n as f64 + self.kappa) - n as f64
    }
}

/// Mean and covariance of a Gaussian belief.
#[derive(Clone, Debug)]
pub struct Estimate {
    pub mean: DVector<f64>,
    pub covariance: DMatrix<f64>,
}

/// 2n+1 sigma columns and their weighted mean.
#[derive(Clone, Debug)]
pub struct SigmaPointSet {
    pub points: DMatrix<f64>,
    pub mean: DVector<f64>,
}

/// Result of pushing sigma points through a function.
#[derive(Clone, Debug)]
pub struct Transform {
    pub sigma: SigmaPointSet,
    /// Each sigma column minus the weighted mean.
    pub deviations: DMatrix<f64>,
    /// Weighted deviation covariance plus the additive noise.
    pub covariance: DMatrix<f64>,
}

impl Transform {
    pub fn mean(&self) -> &DVector<f64> {
        &self.sigma.mean
    }
}

pub struct UkfEngine {
    params: UkfParams,
    state_dim: usize,
    lambda: f64,

    /// Weights for sigma points
    weights_mean: DVector<f64>,
    weights_cov: DVector<f64>,
}

impl UkfEngine {
    /// Create an engine for an n-dimensional state; weights are cached here.
    pub fn new(state_dim: usize, params: UkfParams) -> Self {
        let n = state_dim as f64;
        let lambda = params.lambda(state_dim);
        let sigma_count = 2 * state_dim + 1;

        let mut weights_mean = DVector::<f64>::zeros(sigma_count);
        let mut weights_cov = DVector::<f64>::zeros(sigma_count);

        weights_mean[0] = lambda / (n + lambda);
        weights_cov[0] = lambda / (n + lambda) + (1.0 - params.alpha * params.alpha + params.beta);

        for i in 1..sigma_count {
            weights_mean[i] = 1.0 / (2.0 * (n + lambda));
            weights_cov[i] = 1.0 / (2.0 * (n + lambda));
        }

        Self {
            params,
            state_dim,
            lambda,
            weights_mean,
            weights_cov,
        }
    }

    pub fn params(&self) -> &UkfParams {
        &self.params
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn sigma_count(&self) -> usize {
        2 * self.state_dim + 1
    }

    pub fn weights_mean(&self) -> &DVector<f64> {
        &self.weights_mean
    }

    pub fn weights_cov(&self) -> &DVector<f64> {
        &self.weights_cov
    }

    /// Sigma points [x, x + A_i, x − A_i] with A = sqrt(n+λ) · F, P = F Fᵀ.
    pub fn sigma_points(&self, x: &DVector<f64>, p: &DMatrix<f64>) -> EstimatorResult<SigmaPointSet> {
        let n = self.state_dim;
        self.check_state(x, p)?;

        let factor = ldl_lower_factor(p).ok_or(EstimatorError::StateDegenerate)?;
        let a = factor * (n as f64 + self.lambda).sqrt();

        let mut points = DMatrix::<f64>::zeros(n, 2 * n + 1);
        points.set_column(0, x);
        for i in 0..n {
            let offset = a.column(i);
            points.set_column(i + 1, &(x + &offset));
            points.set_column(i + 1 + n, &(x - &offset));
        }

        let mean = self.weighted_mean(&points);
        Ok(SigmaPointSet { points, mean })
    }

    /// Push sigma columns through the process function and recombine.
    pub fn state_transform<F: ProcessModel + ?Sized>(
        &self,
        model: &F,
        sigma_points: &DMatrix<f64>,
        noise_cov: &DMatrix<f64>,
        dt: f64,
    ) -> EstimatorResult<Transform> {
        let n = sigma_points.nrows();
        let mut transformed = DMatrix::<f64>::zeros(n, sigma_points.ncols());
        for (i, column) in sigma_points.column_iter().enumerate() {
            let y = model.process(&column.into_owned(), dt);
            if y.len() != n {
                return Err(EstimatorError::DimensionMismatch(format!(
                    "process function returned {} entries, expected {}",
                    y.len(),
                    n
                )));
            }
            transformed.set_column(i, &y);
        }
        self.recombine(transformed, noise_cov)
    }

    /// Push sigma columns through the observation function and recombine.
    pub fn sensor_transform<H: ObservationModel + ?Sized>(
        &self,
        model: &H,
        sigma_points: &DMatrix<f64>,
        noise_cov: &DMatrix<f64>,
    ) -> EstimatorResult<Transform> {
        let m = model.measurement_dim();
        let mut transformed = DMatrix::<f64>::zeros(m, sigma_points.ncols());
        for (i, column) in sigma_points.column_iter().enumerate() {
            let z = model.observe(&column.into_owned());
            if z.len() != m {
                return Err(EstimatorError::DimensionMismatch(format!(
                    "observation function returned {} entries, expected {}",
                    z.len(),
                    m
                )));
            }
            transformed.set_column(i, &z);
        }
        self.recombine(transformed, noise_cov)
    }

    /// Predict step: sigma points of (x, P) through the process model.
    pub fn predict<F: ProcessModel + ?Sized>(
        &self,
        model: &F,
        x: &DVector<f64>,
        p: &DMatrix<f64>,
        q: &DMatrix<f64>,
        dt: f64,
    ) -> EstimatorResult<Transform> {
        if q.shape() != (self.state_dim, self.state_dim) {
            return Err(EstimatorError::DimensionMismatch(format!(
                "process noise is {:?}, expected {n}x{n}",
                q.shape(),
                n = self.state_dim
            )));
        }
        let sigma = self.sigma_points(x, p)?;
        let transform = self.state_transform(model, &sigma.points, q, dt)?;

        if !is_finite_vector(transform.mean()) {
            return Err(EstimatorError::NumericNonFinite("predicted state"));
        }
        if !is_finite_matrix(&transform.covariance) {
            return Err(EstimatorError::NumericNonFinite("predicted covariance"));
        }
        Ok(transform)
    }

    /// Correct step against measurement z using the prediction's sigma points.
    pub fn correct<H: ObservationModel + ?Sized>(
        &self,
        model: &H,
        state_tf: &Transform,
        z: &DVector<f64>,
        r: &DMatrix<f64>,
    ) -> EstimatorResult<Estimate> {
        let m = model.measurement_dim();
        if z.len() != m || r.shape() != (m, m) {
            return Err(EstimatorError::DimensionMismatch(format!(
                "measurement has {} entries and noise {:?}, expected {m} and {m}x{m}",
                z.len(),
                r.shape()
            )));
        }
        if !is_finite_vector(z) {
            return Err(EstimatorError::NumericNonFinite("measurement"));
        }

        let sensor_tf = self.sensor_transform(model, &state_tf.sigma.points, r)?;
        let z_pred = sensor_tf.mean();
        let p_zz = &sensor_tf.covariance;

        // Cross-covariance Pxz = Dx · diag(wc) · Dzᵀ
        let p_xz = self.weighted_outer(&state_tf.deviations, &sensor_tf.deviations);

        let p_zz_inv = invert_innovation(p_zz)?;
        let k = &p_xz * p_zz_inv;

        let mean = state_tf.mean() + &k * (z - z_pred);
        let covariance = symmetrize(&(&state_tf.covariance - &k * p_xz.transpose()));

        if !is_finite_vector(&mean) {
            return Err(EstimatorError::NumericNonFinite("corrected state"));
        }
        if !is_finite_matrix(&covariance) {
            return Err(EstimatorError::NumericNonFinite("corrected covariance"));
        }
        Ok(Estimate { mean, covariance })
    }

    /// Predict immediately followed by correct.
    #[allow(clippy::too_many_arguments)]
    pub fn run<M: ProcessModel + ObservationModel + ?Sized>(
        &self,
        model: &M,
        x: &DVector<f64>,
        p: &DMatrix<f64>,
        z: &DVector<f64>,
        q: &DMatrix<f64>,
        r: &DMatrix<f64>,
        dt: f64,
    ) -> EstimatorResult<Estimate> {
        let state_tf = self.predict(model, x, p, q, dt)?;
        self.correct(model, &state_tf, z, r)
    }

    fn check_state(&self, x: &DVector<f64>, p: &DMatrix<f64>) -> EstimatorResult<()> {
        let n = self.state_dim;
        if x.len() != n || p.shape() != (n, n) {
            return Err(EstimatorError::DimensionMismatch(format!(
                "state has {} entries and covariance {:?}, expected {n} and {n}x{n}",
                x.len(),
                p.shape()
            )));
        }
        if !is_finite_vector(x) {
            return Err(EstimatorError::NumericNonFinite("state"));
        }
        if !is_finite_matrix(p) {
            return Err(EstimatorError::NumericNonFinite("covariance"));
        }
        Ok(())
    }

    fn weighted_mean(&self, points: &DMatrix<f64>) -> DVector<f64> {
        let mut mean = DVector::<f64>::zeros(points.nrows());
        for (i, column) in points.column_iter().enumerate() {
            mean += column * self.weights_mean[i];
        }
        mean
    }

    /// A · diag(wc) · Bᵀ
    fn weighted_outer(&self, a: &DMatrix<f64>, b: &DMatrix<f64>) -> DMatrix<f64> {
        let mut scaled = a.clone();
        for (i, mut column) in scaled.column_iter_mut().enumerate() {
            column *= self.weights_cov[i];
        }
        scaled * b.transpose()
    }

    fn recombine(&self, points: DMatrix<f64>, noise_cov: &DMatrix<f64>) -> EstimatorResult<Transform> {
        let dim = points.nrows();
        if points.ncols() != self.sigma_count() {
            return Err(EstimatorError::DimensionMismatch(format!(
                "{} sigma points, expected {}",
                points.ncols(),
                self.sigma_count()
            )));
        }
        if noise_cov.shape() != (dim, dim) {
            return Err(EstimatorError::DimensionMismatch(format!(
                "noise covariance is {:?}, expected {dim}x{dim}",
                noise_cov.shape()
            )));
        }

        let mean = self.weighted_mean(&points);
        let deviations = &points - repeat_columns(&mean, points.ncols());
        let covariance = symmetrize(&(self.weighted_outer(&deviations, &deviations) + noise_cov));

        Ok(Transform {
            sigma: SigmaPointSet { points, mean },
            deviations,
            covariance,
        })
    }
}

fn invert_innovation(p_zz: &DMatrix<f64>) -> EstimatorResult<DMatrix<f64>> {
    if !is_finite_matrix(p_zz) {
        return Err(EstimatorError::NumericNonFinite("innovation covariance"));
    }
    let singular_values = p_zz.clone().svd(false, false).singular_values;
    let max_sv = singular_values.max();
    let min_sv = singular_values.min();
    if max_sv <= 0.0 || min_sv <= SINGULAR_TOLERANCE * max_sv {
        return Err(EstimatorError::ObservationDegenerate);
    }
    p_zz.clone()
        .try_inverse()
        .ok_or(EstimatorError::ObservationDegenerate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::linalg::{SIGMA_COUNT_16, STATE_DIM};
    use approx::assert_abs_diff_eq;

    /// [px, py, vx, vy] constant-velocity model observed through its position.
    struct ConstantVelocity;

    impl ProcessModel for ConstantVelocity {
        fn process(&self, x: &DVector<f64>, dt: f64) -> DVector<f64> {
            DVector::from_vec(vec![x[0] + x[2] * dt, x[1] + x[3] * dt, x[2], x[3]])
        }
    }

    impl ObservationModel for ConstantVelocity {
        fn measurement_dim(&self) -> usize {
            2
        }

        fn observe(&self, x: &DVector<f64>) -> DVector<f64> {
            x.rows(0, 2).into_owned()
        }
    }

    fn sample_state() -> (DVector<f64>, DMatrix<f64>) {
        let x = DVector::from_vec(vec![1.0, -2.0, 0.5, 0.25]);
        let p = DMatrix::from_row_slice(
            4,
            4,
            &[
                0.5, 0.1, 0.05, 0.0, //
                0.1, 0.4, 0.0, 0.02, //
                0.05, 0.0, 0.3, 0.01, //
                0.0, 0.02, 0.01, 0.2,
            ],
        );
        (x, p)
    }

    fn assert_matrix_close(a: &DMatrix<f64>, b: &DMatrix<f64>, eps: f64) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = eps);
        }
    }

    #[test]
    fn test_weights() {
        let params = UkfParams { alpha: 0.5, beta: 2.0, kappa: 1.0 };
        let engine = UkfEngine::new(4, params);
        let lambda = 0.25 * 5.0 - 4.0;

        assert_eq!(engine.weights_mean().len(), 9);
        assert_abs_diff_eq!(engine.weights_mean()[0], lambda / (4.0 + lambda), epsilon = 1e-12);
        assert_abs_diff_eq!(
            engine.weights_cov()[0],
            lambda / (4.0 + lambda) + (1.0 - 0.25 + 2.0),
            epsilon = 1e-12
        );
        for i in 1..9 {
            assert_abs_diff_eq!(engine.weights_mean()[i], 1.0 / (2.0 * (4.0 + lambda)), epsilon = 1e-12);
            assert_eq!(engine.weights_mean()[i], engine.weights_cov()[i]);
        }
        assert_abs_diff_eq!(engine.weights_mean().sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_quadrotor_sized_engine() {
        let engine = UkfEngine::new(STATE_DIM, UkfParams::default());
        assert_eq!(engine.sigma_count(), SIGMA_COUNT_16);
        assert_eq!(engine.weights_mean()[0], 0.0);
        assert_abs_diff_eq!(engine.weights_cov()[0], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sigma_points_symmetric_about_mean() {
        let (x, p) = sample_state();
        let engine = UkfEngine::new(4, UkfParams::default());
        let sigma = engine.sigma_points(&x, &p).expect("PSD covariance");

        assert_eq!(sigma.points.ncols(), 9);
        assert_eq!(sigma.points.column(0).into_owned(), x);
        for i in 0..4 {
            let plus = sigma.points.column(i + 1) - &x;
            let minus = sigma.points.column(i + 5) - &x;
            assert_abs_diff_eq!((plus + minus).norm(), 0.0, epsilon = 1e-12);
        }
        assert_abs_diff_eq!((&sigma.mean - &x).norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_sigma_points_recover_covariance() {
        let (x, p) = sample_state();
        let engine = UkfEngine::new(4, UkfParams::default());
        let sigma = engine.sigma_points(&x, &p).expect("PSD covariance");

        let deviations = &sigma.points - repeat_columns(&x, 9);
        let rebuilt = engine.weighted_outer(&deviations, &deviations);
        assert_matrix_close(&rebuilt, &p, 1e-12);
    }

    #[test]
    fn test_identity_prediction() {
        let (x, p) = sample_state();
        let engine = UkfEngine::new(4, UkfParams::default());
        let q = DMatrix::<f64>::zeros(4, 4);

        let tf = engine.predict(&ConstantVelocity, &x, &p, &q, 0.0).expect("predict");
        assert_abs_diff_eq!((tf.mean() - &x).norm(), 0.0, epsilon = 1e-12);
        assert_matrix_close(&tf.covariance, &p, 1e-12);
    }

    #[test]
    fn test_prediction_matches_linear_propagation() {
        let (x, p) = sample_state();
        let engine = UkfEngine::new(4, UkfParams::default());
        let q = DMatrix::<f64>::identity(4, 4) * 0.01;
        let dt = 0.5;

        let f = DMatrix::from_row_slice(
            4,
            4,
            &[1.0, 0.0, dt, 0.0, 0.0, 1.0, 0.0, dt, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0],
        );
        let expected_p = &f * &p * f.transpose() + &q;
        let expected_x = &f * &x;

        let tf = engine.predict(&ConstantVelocity, &x, &p, &q, dt).expect("predict");
        assert_abs_diff_eq!((tf.mean() - expected_x).norm(), 0.0, epsilon = 1e-12);
        assert_matrix_close(&tf.covariance, &expected_p, 1e-12);
    }

    #[test]
    fn test_zero_gain_correction() {
        let (x, p) = sample_state();
        let engine = UkfEngine::new(4, UkfParams::default());
        let q = DMatrix::<f64>::identity(4, 4) * 0.01;
        let r = DMatrix::<f64>::identity(2, 2) * 1e12;
        let z = DVector::from_vec(vec![50.0, -50.0]);

        let tf = engine.predict(&ConstantVelocity, &x, &p, &q, 0.1).expect("predict");
        let corrected = engine.correct(&ConstantVelocity, &tf, &z, &r).expect("correct");

        assert_abs_diff_eq!((&corrected.mean - tf.mean()).norm(), 0.0, epsilon = 1e-8);
        assert_matrix_close(&corrected.covariance, &tf.covariance, 1e-8);
    }

    #[test]
    fn test_perfect_measurement_correction() {
        let (x, p) = sample_state();
        let engine = UkfEngine::new(4, UkfParams::default());
        let q = DMatrix::<f64>::identity(4, 4) * 0.01;
        let r = DMatrix::<f64>::zeros(2, 2);
        let z = DVector::from_vec(vec![1.3, -1.7]);

        let tf = engine.predict(&ConstantVelocity, &x, &p, &q, 0.1).expect("predict");
        let corrected = engine.correct(&ConstantVelocity, &tf, &z, &r).expect("correct");

        assert_abs_diff_eq!(corrected.mean[0], 1.3, epsilon = 1e-9);
        assert_abs_diff_eq!(corrected.mean[1], -1.7, epsilon = 1e-9);
    }

    #[test]
    fn test_correction_keeps_covariance_symmetric_psd() {
        let (x, p) = sample_state();
        let engine = UkfEngine::new(4, UkfParams::default());
        let q = DMatrix::<f64>::identity(4, 4) * 0.01;
        let r = DMatrix::<f64>::identity(2, 2) * 0.01;
        let z = DVector::from_vec(vec![1.1, -2.2]);

        let tf = engine.predict(&ConstantVelocity, &x, &p, &q, 0.1).expect("predict");
        let corrected = engine.correct(&ConstantVelocity, &tf, &z, &r).expect("correct");

        let asym = (&corrected.covariance - corrected.covariance.transpose()).norm();
        assert!(asym < 1e-9);
        let eig = corrected.covariance.clone().symmetric_eigen();
        assert!(eig.eigenvalues.min() >= -1e-9);
        // Measuring position can only shrink its variance.
        assert!(corrected.covariance[(0, 0)] < tf.covariance[(0, 0)]);
    }

    #[test]
    fn test_run_equals_predict_then_correct() {
        let (x, p) = sample_state();
        let engine = UkfEngine::new(4, UkfParams::default());
        let q = DMatrix::<f64>::identity(4, 4) * 0.01;
        let r = DMatrix::<f64>::identity(2, 2) * 0.05;
        let z = DVector::from_vec(vec![1.2, -1.9]);

        let tf = engine.predict(&ConstantVelocity, &x, &p, &q, 0.2).expect("predict");
        let two_step = engine.correct(&ConstantVelocity, &tf, &z, &r).expect("correct");
        let one_step = engine
            .run(&ConstantVelocity, &x, &p, &z, &q, &r, 0.2)
            .expect("run");

        assert_eq!(one_step.mean, two_step.mean);
        assert_eq!(one_step.covariance, two_step.covariance);
    }

    #[test]
    fn test_indefinite_covariance_is_state_degenerate() {
        let x = DVector::from_vec(vec![0.0, 0.0, 0.0, 0.0]);
        let p = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, -1.0, 1.0, 1.0]));
        let engine = UkfEngine::new(4, UkfParams::default());
        let q = DMatrix::<f64>::zeros(4, 4);

        let err = engine.predict(&ConstantVelocity, &x, &p, &q, 0.1).unwrap_err();
        assert_eq!(err, EstimatorError::StateDegenerate);
    }

    #[test]
    fn test_zero_variance_with_cross_term_is_state_degenerate() {
        let x = DVector::from_vec(vec![0.0, 0.0, 0.0, 0.0]);
        #[rustfmt::skip]
        let p = DMatrix::from_row_slice(4, 4, &[
            0.0, 1.0, 0.0, 0.0,
            1.0, 0.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        ]);
        let engine = UkfEngine::new(4, UkfParams::default());
        let q = DMatrix::<f64>::zeros(4, 4);

        assert_eq!(
            engine.sigma_points(&x, &p).unwrap_err(),
            EstimatorError::StateDegenerate
        );
        let err = engine.predict(&ConstantVelocity, &x, &p, &q, 0.1).unwrap_err();
        assert_eq!(err, EstimatorError::StateDegenerate);
    }

    #[test]
    fn test_singular_innovation_is_observation_degenerate() {
        let x = DVector::from_vec(vec![0.0, 0.0, 1.0, 1.0]);
        let p = DMatrix::<f64>::zeros(4, 4);
        let q = DMatrix::<f64>::zeros(4, 4);
        let r = DMatrix::<f64>::zeros(2, 2);
        let engine = UkfEngine::new(4, UkfParams::default());

        let tf = engine.predict(&ConstantVelocity, &x, &p, &q, 0.1).expect("zero covariance is PSD");
        let z = DVector::from_vec(vec![0.0, 0.0]);
        let err = engine.correct(&ConstantVelocity, &tf, &z, &r).unwrap_err();
        assert_eq!(err, EstimatorError::ObservationDegenerate);
    }

    #[test]
    fn test_nan_state_is_rejected() {
        let (mut x, p) = sample_state();
        x[2] = f64::NAN;
        let engine = UkfEngine::new(4, UkfParams::default());
        let q = DMatrix::<f64>::zeros(4, 4);

        let err = engine.predict(&ConstantVelocity, &x, &p, &q, 0.1).unwrap_err();
        assert!(matches!(err, EstimatorError::NumericNonFinite(_)));
    }

    #[test]
    fn test_wrong_noise_shape_is_rejected() {
        let (x, p) = sample_state();
        let engine = UkfEngine::new(4, UkfParams::default());
        let q = DMatrix::<f64>::zeros(3, 3);

        let err = engine.predict(&ConstantVelocity, &x, &p, &q, 0.1).unwrap_err();
        assert!(matches!(err, EstimatorError::DimensionMismatch(_)));
    }
}
