//! Single-output ridge regression with an unpenalised intercept.
//!
//! Solves `(XcᵀXc + αI) w = Xcᵀyc` on the centred design via Cholesky
//! factorisation, then recovers `intercept = ȳ − x̄·w`.

use nalgebra::{DMatrix, DVector};
use ndarray::{ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cholesky diagonal entries at or below this mean a rank-deficient system.
const PIVOT_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RidgeError {
    #[error("regularisation strength must be finite and >= 0, got {0}")]
    InvalidAlpha(f64),
    #[error("design has {rows} rows but target has {targets} values")]
    DimensionMismatch { rows: usize, targets: usize },
    #[error("cannot fit on an empty design")]
    Empty,
    #[error("normal equations are singular (alpha = 0 with a rank-deficient design?)")]
    Singular,
    #[error("training data or fitted weights are not finite")]
    NonFinite,
}

/// A fitted ridge regressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RidgeRegressor {
    pub alpha: f64,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl RidgeRegressor {
    /// Fit on `x` (samples × features) against `y`.
    pub fn fit(x: ArrayView2<f64>, y: ArrayView1<f64>, alpha: f64) -> Result<Self, RidgeError> {
        validate_alpha(alpha)?;
        let (rows, cols) = x.dim();
        if rows != y.len() {
            return Err(RidgeError::DimensionMismatch {
                rows,
                targets: y.len(),
            });
        }
        if rows == 0 || cols == 0 {
            return Err(RidgeError::Empty);
        }
        if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
            return Err(RidgeError::NonFinite);
        }

        let x_mean = x.mean_axis(Axis(0)).ok_or(RidgeError::Empty)?;
        let y_mean = y.mean().ok_or(RidgeError::Empty)?;
        let xc = DMatrix::from_fn(rows, cols, |i, j| x[[i, j]] - x_mean[j]);
        let yc = DVector::from_fn(rows, |i, _| y[i] - y_mean);

        let mut gram = xc.tr_mul(&xc);
        for i in 0..cols {
            gram[(i, i)] += alpha;
        }
        let rhs = xc.tr_mul(&yc);

        let w = solve_spd(gram, &rhs)?;
        let intercept = y_mean - x_mean.iter().zip(w.iter()).map(|(m, c)| m * c).sum::<f64>();
        if !intercept.is_finite() || w.iter().any(|c| !c.is_finite()) {
            return Err(RidgeError::NonFinite);
        }

        Ok(Self {
            alpha,
            coefficients: w.iter().copied().collect(),
            intercept,
        })
    }

    pub fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    /// Raw (unclipped) prediction. `row.len()` must equal `n_features()`;
    /// callers check this.
    pub fn predict(&self, row: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(row)
                .map(|(w, v)| w * v)
                .sum::<f64>()
    }
}

pub fn validate_alpha(alpha: f64) -> Result<(), RidgeError> {
    if alpha.is_finite() && alpha >= 0.0 {
        Ok(())
    } else {
        Err(RidgeError::InvalidAlpha(alpha))
    }
}

/// Solve `a · x = b` for symmetric positive definite `a`.
fn solve_spd(a: DMatrix<f64>, b: &DVector<f64>) -> Result<DVector<f64>, RidgeError> {
    let chol = a.cholesky().ok_or(RidgeError::Singular)?;
    // NaN pivots fail this comparison too.
    if !chol.l_dirty().diagonal().iter().all(|d| *d > PIVOT_TOLERANCE) {
        return Err(RidgeError::Singular);
    }
    Ok(chol.solve(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1, Array2};

    #[test]
    fn test_recovers_exact_line_without_penalty() {
        // y = 3 + 2a - b
        let x = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [2.0, 3.0]];
        let y = array![3.0, 5.0, 2.0, 4.0];
        let r = RidgeRegressor::fit(x.view(), y.view(), 0.0).unwrap();
        assert!((r.coefficients[0] - 2.0).abs() < 1e-9);
        assert!((r.coefficients[1] + 1.0).abs() < 1e-9);
        assert!((r.intercept - 3.0).abs() < 1e-9);
        assert!((r.predict(&[1.0, 1.0]) - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_penalty_matches_closed_form() {
        // One feature, centred x = [-1, 0, 1], yc = [-1, 0, 1]:
        // w = Σxy / (Σx² + α) = 2 / (2 + 0.5) = 0.8
        let x = array![[1.0], [2.0], [3.0]];
        let y = array![10.0, 11.0, 12.0];
        let r = RidgeRegressor::fit(x.view(), y.view(), 0.5).unwrap();
        assert!((r.coefficients[0] - 0.8).abs() < 1e-12);
        assert!((r.intercept - (11.0 - 0.8 * 2.0)).abs() < 1e-12);
    }

    #[test]
    fn test_more_features_than_samples_is_solvable_with_penalty() {
        let x = Array2::from_shape_fn((3, 68), |(i, j)| ((i * 7 + j * 3) % 11) as f64 - 5.0);
        let y = array![0.5, 0.3, 0.5];
        let r = RidgeRegressor::fit(x.view(), y.view(), 0.5).unwrap();
        assert_eq!(r.n_features(), 68);
        assert!(r.predict(&x.row(0).to_vec()).is_finite());
    }

    #[test]
    fn test_rank_deficient_without_penalty_is_singular() {
        let x = array![[1.0, 2.0], [2.0, 4.0], [3.0, 6.0]];
        let y = array![1.0, 2.0, 3.0];
        assert_eq!(
            RidgeRegressor::fit(x.view(), y.view(), 0.0),
            Err(RidgeError::Singular)
        );
    }

    #[test]
    fn test_constant_targets_give_constant_prediction() {
        let x = array![[1.0, -2.0], [0.5, 3.0], [-4.0, 1.0], [2.0, 2.0]];
        let y = Array1::from_elem(4, 0.25);
        let r = RidgeRegressor::fit(x.view(), y.view(), 0.5).unwrap();
        assert!(r.coefficients.iter().all(|w| w.abs() < 1e-12));
        assert!((r.predict(&[100.0, -100.0]) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let x = array![[1.0], [2.0]];
        let y = array![1.0, 2.0, 3.0];
        assert!(matches!(
            RidgeRegressor::fit(x.view(), y.view(), 0.5),
            Err(RidgeError::DimensionMismatch { rows: 2, targets: 3 })
        ));

        let y = array![1.0, 2.0];
        assert_eq!(
            RidgeRegressor::fit(x.view(), y.view(), -1.0),
            Err(RidgeError::InvalidAlpha(-1.0))
        );

        let x = array![[1.0], [f64::NAN]];
        assert_eq!(
            RidgeRegressor::fit(x.view(), y.view(), 0.5),
            Err(RidgeError::NonFinite)
        );
    }

    #[test]
    fn test_spd_solve_matches_system() {
        let a = DMatrix::from_row_slice(3, 3, &[4.0, 2.0, 0.6, 2.0, 5.0, 1.0, 0.6, 1.0, 3.0]);
        let b = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        let x = solve_spd(a.clone(), &b).unwrap();
        let back = &a * &x;
        for i in 0..3 {
            assert!((back[i] - b[i]).abs() < 1e-12);
        }
    }

    #[test]
    fn test_overflowing_design_is_rejected() {
        // Finite inputs whose Gram matrix overflows to infinity.
        let x = array![[1e200, 0.0], [-1e200, 1.0], [3e200, 2.0]];
        let y = array![0.2, 0.5, 0.8];
        let err = RidgeRegressor::fit(x.view(), y.view(), 0.5).unwrap_err();
        assert!(matches!(err, RidgeError::Singular | RidgeError::NonFinite));
    }
}
