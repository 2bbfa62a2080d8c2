//! Reciprocal condition estimates.
//!
//! Cheap diagonal based estimates used to check weights and reported
//! information matrices before they enter the objective.

use nalgebra::DMatrix;

/// Estimate of the reciprocal condition number of a symmetric matrix from its diagonal.
///
/// The max diagonal element is taken as the matrix norm and the min element as the norm of the
/// inverse, so rcond = min/max.
///
/// Defined to be 0 for an empty or semi-definite matrix, and for min and max infinite.
/// Defined to be < 0 for a negative element or any NaN element.
pub fn rcond_symmetric(sm: &DMatrix<f64>) -> f64 {
    let n = sm.nrows().min(sm.ncols());
    rcond_of((0..n).map(|i| sm[(i, i)]))
}

fn rcond_of<I: Iterator<Item = f64>>(mut diag: I) -> f64 {
    let first = match diag.next() {
        Some(d) => d,
        None => return 0.,
    };
    if first.is_nan() {
        return -1.;
    }
    let mut mind = first;
    let mut maxd = first;
    for d in diag {
        if d.is_nan() {
            return -1.;
        }
        mind = mind.min(d);
        maxd = maxd.max(d);
    }

    if mind < 0. {
        // negative, mind does not represent a rcond
        mind
    } else {
        let rcond = mind / maxd;
        if rcond.is_nan() {
            // (mind == maxd) == (zero or infinity)
            0.
        } else {
            rcond
        }
    }
}
