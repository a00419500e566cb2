//! Linear algebra type system for the quadrotor filter
//!
//! Fixed-size aliases for the quadrotor state and measurement, plus the
//! handful of dense operations the unscented engine needs on top of nalgebra.

use nalgebra::{DMatrix, DVector, SVector};

// ===== State Dimensions =====
pub const STATE_DIM: usize = 16;

// ===== Measurement Dimensions =====
pub const MEASURE_DIM_POSE: usize = 10; // position, quaternion, velocity

// ===== Quadrotor Filter Types =====
pub type StateVec16 = SVector<f64, STATE_DIM>;
pub type PoseMeasVec = SVector<f64, MEASURE_DIM_POSE>;

// ===== Sigma Point Types (for UKF) =====
pub const SIGMA_COUNT_16: usize = 2 * STATE_DIM + 1; // 33

/// Relative pivot tolerance used when factoring covariances.
pub const PIVOT_TOLERANCE: f64 = 1e-12;

/// Lower factor `F = L * sqrt(D)` of `P = L D L^T`, so that `P = F F^T`.
///
/// Unlike a plain Cholesky this accepts positive *semi*definite input: a pivot
/// within tolerance of zero drops its column, provided the rest of that column
/// is zero as well. Returns `None` when the matrix is not PSD (a clearly
/// negative pivot, or a zero pivot with a nonzero remainder) or is not square.
pub fn ldl_lower_factor(p: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let n = p.nrows();
    if p.ncols() != n {
        return None;
    }

    let scale = (0..n).map(|i| p[(i, i)].abs()).fold(1.0_f64, f64::max);
    let tol = PIVOT_TOLERANCE * scale;

    let mut l = DMatrix::<f64>::identity(n, n);
    let mut d = DVector::<f64>::zeros(n);

    for j in 0..n {
        let mut dj = p[(j, j)];
        for k in 0..j {
            dj -= l[(j, k)] * l[(j, k)] * d[k];
        }

        if dj < -tol {
            return None;
        }
        let zero_pivot = dj <= tol;
        d[j] = if zero_pivot { 0.0 } else { dj };

        for i in (j + 1)..n {
            let mut lij = p[(i, j)];
            for k in 0..j {
                lij -= l[(i, k)] * l[(j, k)] * d[k];
            }
            if zero_pivot {
                // A zero pivot over a nonzero remainder means P is indefinite.
                if lij.abs() > tol {
                    return None;
                }
            } else {
                l[(i, j)] = lij / dj;
            }
        }
    }

    for j in 0..n {
        let s = d[j].sqrt();
        for i in 0..n {
            l[(i, j)] *= s;
        }
    }
    Some(l)
}

/// `0.5 * (P + P^T)`
pub fn symmetrize(p: &DMatrix<f64>) -> DMatrix<f64> {
    (p + p.transpose()) * 0.5
}

pub fn is_finite_vector(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

pub fn is_finite_matrix(m: &DMatrix<f64>) -> bool {
    m.iter().all(|x| x.is_finite())
}

/// Matrix whose every column is `v`.
pub fn repeat_columns(v: &DVector<f64>, num_cols: usize) -> DMatrix<f64> {
    DMatrix::from_fn(v.len(), num_cols, |i, _| v[i])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_ldl_reconstructs_spd() {
        let p = DMatrix::from_row_slice(
            3,
            3,
            &[4.0, 1.0, 0.5, 1.0, 3.0, 0.2, 0.5, 0.2, 2.0],
        );
        let f = ldl_lower_factor(&p).expect("SPD matrix should factor");

        // Lower triangular
        assert_eq!(f[(0, 1)], 0.0);
        assert_eq!(f[(0, 2)], 0.0);
        assert_eq!(f[(1, 2)], 0.0);

        let rebuilt = &f * f.transpose();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(rebuilt[(i, j)], p[(i, j)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_ldl_accepts_rank_deficient() {
        // v v^T is rank one: the second and third pivots are exactly zero.
        let v = DVector::from_vec(vec![1.0, 2.0, -1.0]);
        let p = &v * v.transpose();

        let f = ldl_lower_factor(&p).expect("PSD matrix should factor");
        let rebuilt = &f * f.transpose();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(rebuilt[(i, j)], p[(i, j)], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_ldl_rejects_indefinite() {
        let p = DMatrix::from_diagonal(&DVector::from_vec(vec![1.0, -0.5, 2.0]));
        assert!(ldl_lower_factor(&p).is_none());
    }

    #[test]
    fn test_ldl_rejects_zero_pivot_with_coupling() {
        // Eigenvalues ±1 with a zero diagonal: no negative pivot ever shows up.
        let p = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, 1.0, 0.0]);
        assert!(ldl_lower_factor(&p).is_none());

        let p = DMatrix::from_row_slice(3, 3, &[1.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.0, 0.5, 2.0]);
        assert!(ldl_lower_factor(&p).is_none());
    }

    #[test]
    fn test_zero_matrix_factors_to_zero() {
        let p = DMatrix::<f64>::zeros(4, 4);
        let f = ldl_lower_factor(&p).expect("zero matrix is PSD");
        assert!(f.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_repeat_columns() {
        let v = DVector::from_vec(vec![1.0, 2.0]);
        let m = repeat_columns(&v, 3);
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m[(1, 2)], 2.0);
    }
}
