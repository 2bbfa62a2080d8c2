#![allow(non_snake_case)]

//! Numerical helpers shared by the window, the objective and the solver.

use nalgebra::{DMatrix, DVector};

use crate::error::{EstimateError, Result};

pub mod rcond;

/// Relative step for central differences.
const FD_STEP: f64 = 1e-6;

/// Jacobian of `f` at `at` by central differences.
pub fn jacobian_fd<F>(f: F, at: &DVector<f64>) -> DMatrix<f64>
where
    F: Fn(&DVector<f64>) -> DVector<f64>,
{
    let f0 = f(at);
    let mut J = DMatrix::zeros(f0.len(), at.len());
    let mut xp = at.clone();
    for j in 0..at.len() {
        let h = FD_STEP * at[j].abs().max(1.);
        let xj = at[j];
        xp[j] = xj + h;
        let fp = f(&xp);
        xp[j] = xj - h;
        let fm = f(&xp);
        xp[j] = xj;
        J.set_column(j, &((fp - fm) / (2. * h)));
    }
    J
}

/// Replaces a square matrix by (M + M')/2.
pub fn symmetrize(M: &mut DMatrix<f64>) {
    let n = M.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (M[(i, j)] + M[(j, i)]);
            M[(i, j)] = avg;
            M[(j, i)] = avg;
        }
    }
}

/// Checks a reciprocal condition number is > 0.
///
/// IEC 559 NaN values are never true.
pub fn check_positive(rcond: f64, what: &'static str) -> Result<f64> {
    if rcond > 0. {
        Ok(rcond)
    } else {
        Err(EstimateError::SingularCovariance { what })
    }
}

/// Inverts a symmetric positive definite matrix.
pub fn inverse_spd(M: &DMatrix<f64>, what: &'static str) -> Result<DMatrix<f64>> {
    match M.clone().cholesky() {
        Some(chol) => Ok(chol.inverse()),
        None => Err(EstimateError::SingularCovariance { what }),
    }
}
