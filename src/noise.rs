#![allow(non_snake_case)]

//! Estimation noise models.
//!
//! Noise models are represented as structs holding variances or covariances.
//! The objective weights are their inverses, see [`Weight`].

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{EstimateError, Result};
use crate::linalg;
use crate::linalg::rcond;

/// Additive noise.
///
/// Noise represented as a the noise variance vector.
#[derive(PartialEq, Clone, Debug)]
pub struct UncorrelatedNoise {
    /// Noise variance
    pub q: DVector<f64>,
}

/// Additive noise.
///
/// Noise represented as a the noise covariance matrix.
#[derive(PartialEq, Clone, Debug)]
pub struct CorrelatedNoise {
    /// Noise covariance
    pub Q: DMatrix<f64>,
}

impl UncorrelatedNoise {
    pub fn new(q: DVector<f64>) -> UncorrelatedNoise {
        UncorrelatedNoise { q }
    }

    /// Inverse variance weight.
    ///
    /// A zero variance is a configuration error for that channel, `channel` names it.
    pub fn information<F: Fn(usize) -> String>(&self, channel: F) -> Result<Weight> {
        let mut w = DVector::zeros(self.q.len());
        for (i, q) in self.q.iter().enumerate() {
            if !(*q > 0.) {
                return Err(EstimateError::ZeroVarianceConfig { channel: channel(i) });
            }
            w[i] = 1. / q;
        }
        Ok(Weight::Diagonal(w))
    }
}

impl CorrelatedNoise {
    /// Inverse covariance weight.
    pub fn information(&self, what: &'static str) -> Result<Weight> {
        linalg::check_positive(rcond::rcond_symmetric(&self.Q), what)?;
        let mut W = linalg::inverse_spd(&self.Q, what)?;
        linalg::symmetrize(&mut W);
        Ok(Weight::Full(W))
    }
}

/// How weights enter the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightMode {
    /// Only the diagonal of each weight is used.
    Diagonal,
    /// Weights are used as dense matrices.
    Full,
}

impl Default for WeightMode {
    fn default() -> Self {
        WeightMode::Diagonal
    }
}

/// Inverse covariance weight of one objective term.
#[derive(PartialEq, Clone, Debug)]
pub enum Weight {
    Diagonal(DVector<f64>),
    Full(DMatrix<f64>),
}

impl Weight {
    pub fn identity(d: usize) -> Weight {
        Weight::Diagonal(DVector::from_element(d, 1.))
    }

    pub fn dim(&self) -> usize {
        match self {
            Weight::Diagonal(w) => w.len(),
            Weight::Full(W) => W.nrows(),
        }
    }

    /// The weight matrix as used under `mode`.
    pub fn matrix(&self, mode: WeightMode) -> DMatrix<f64> {
        match (self, mode) {
            (Weight::Diagonal(w), _) => DMatrix::from_diagonal(w),
            (Weight::Full(W), WeightMode::Diagonal) => DMatrix::from_diagonal(&W.diagonal()),
            (Weight::Full(W), WeightMode::Full) => W.clone(),
        }
    }

    /// 0.5 v'Wv under `mode`.
    pub fn quadratic(&self, v: &DVector<f64>, mode: WeightMode) -> f64 {
        match (self, mode) {
            (Weight::Diagonal(w), _) => 0.5 * v.component_mul(v).dot(w),
            (Weight::Full(W), WeightMode::Diagonal) => 0.5 * v.component_mul(v).dot(&W.diagonal()),
            (Weight::Full(W), WeightMode::Full) => 0.5 * v.dot(&(W * v)),
        }
    }
}
