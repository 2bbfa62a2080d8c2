#![allow(non_snake_case)]

//! Objective assembly.
//!
//! The active objective depends on the window phase:
//!  - PREPARATION: `1e5 * sum_k (x[0,0,k] - x0[k])^2 + Q + R + U`,
//!  - FILTERING: `arrival + Q + R + U`,
//! with the quadratic terms
//!  - arrival `0.5 (x[0,0] - x0)' Pi (x[0,0] - x0)` over participating slots,
//!  - process noise `0.5 sum_i w_i' Q_i w_i`,
//!  - measurement noise `0.5 sum_i nu_i' R_i nu_i`,
//!  - input noise `0.5 sum_i wu_i' U_i wu_i`.
//! Under the diagonal weight mode only the diagonals of Q, R and U are used. The arrival weight
//! is always used as a dense matrix.
//!
//! The objective is quadratic in the decision variables: `0.5 v'Hv + g'v + const`.

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::models::ProcessModel;
use crate::solver::problem::VarLayout;
use crate::window::{Exclusion, Phase, Window};

/// Weight anchoring the preparation problem to the initial guess.
pub const PREPARATION_ANCHOR_WEIGHT: f64 = 1e5;

/// Values of the objective terms.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ObjectiveTerms {
    /// Preparation anchor term.
    pub anchor: f64,
    pub arrival: f64,
    pub process_noise: f64,
    pub measurement_noise: f64,
    pub input_noise: f64,
}

impl ObjectiveTerms {
    pub fn total(&self) -> f64 {
        self.anchor + self.arrival + self.process_noise + self.measurement_noise + self.input_noise
    }
}

impl<M: ProcessModel> Window<M> {
    /// Rebuilds the arrival term restricted to participating slots.
    ///
    /// Excluded slots get all-zero rows and columns of the arrival weight.
    pub fn regenerate_objective(&mut self, excl: &Exclusion) {
        let K = self.layout.K;
        let mut W = DMatrix::zeros(K, K);
        for j in 0..K {
            if !excl.participates(j) {
                continue;
            }
            for k in 0..K {
                if excl.participates(k) {
                    W[(j, k)] = self.prior.Pi[(j, k)];
                }
            }
        }
        self.arrival_weight = W;
        self.excl = excl.clone();
        debug!(
            "arrival term regenerated over {} of {} noisy states",
            excl.count(),
            K
        );
    }

    /// Prior stage deviation `x[0,0] - x0` in slot order.
    fn arrival_deviation(&self) -> DVector<f64> {
        self.noisy_state(0, 0) - &self.prior.x0
    }

    /// Values of the terms of the active objective at the current window values.
    pub fn objective_terms(&self) -> ObjectiveTerms {
        let mode = self.options.weight_mode;
        let noise_terms = || {
            let process_noise: f64 = self.Q.iter().zip(self.w.iter()).map(|(Q, w)| Q.quadratic(w, mode)).sum();
            let measurement_noise: f64 = self.R.iter().zip(self.nu.iter()).map(|(R, nu)| R.quadratic(nu, mode)).sum();
            let input_noise: f64 = if self.options.estimate_input_noise {
                self.U.iter().zip(self.wu.iter()).map(|(U, wu)| U.quadratic(wu, mode)).sum()
            } else {
                0.
            };
            (process_noise, measurement_noise, input_noise)
        };
        match self.phase {
            Phase::ColdStart => ObjectiveTerms::default(),
            Phase::Preparation => {
                let d = self.arrival_deviation();
                let (process_noise, measurement_noise, input_noise) = noise_terms();
                ObjectiveTerms {
                    anchor: PREPARATION_ANCHOR_WEIGHT * d.norm_squared(),
                    arrival: 0.,
                    process_noise,
                    measurement_noise,
                    input_noise,
                }
            }
            Phase::Filtering => {
                let d = self.arrival_deviation();
                let (process_noise, measurement_noise, input_noise) = noise_terms();
                ObjectiveTerms {
                    anchor: 0.,
                    arrival: 0.5 * d.dot(&(&self.arrival_weight * &d)),
                    process_noise,
                    measurement_noise,
                    input_noise,
                }
            }
        }
    }

    pub fn objective_value(&self) -> f64 {
        self.objective_terms().total()
    }

    /// Hessian and linear term of the active objective over the decision variables of `vars`.
    ///
    /// Terms on values that are not decision variables are constant and dropped.
    pub(crate) fn quadratic_model(&self, vars: &VarLayout) -> (DMatrix<f64>, DVector<f64>) {
        let n = vars.len();
        let mut H = DMatrix::zeros(n, n);
        let mut g = DVector::zeros(n);
        let mode = self.options.weight_mode;
        let K = self.layout.K;

        match self.phase {
            Phase::ColdStart => return (H, g),
            Phase::Preparation => {
                for k in 0..K {
                    let i = vars.x(0, 0, self.noisy_pos[k]);
                    H[(i, i)] += 2. * PREPARATION_ANCHOR_WEIGHT;
                    g[i] -= 2. * PREPARATION_ANCHOR_WEIGHT * self.prior.x0[k];
                }
            }
            Phase::Filtering => {
                let Pg = &self.arrival_weight * &self.prior.x0;
                for j in 0..K {
                    let ij = vars.x(0, 0, self.noisy_pos[j]);
                    for k in 0..K {
                        let ik = vars.x(0, 0, self.noisy_pos[k]);
                        H[(ij, ik)] += self.arrival_weight[(j, k)];
                    }
                    g[ij] -= Pg[j];
                }
            }
        }

        if let Some(w0) = vars.w_offset() {
            for (stage, Q) in self.Q.iter().enumerate() {
                let o = w0 + stage * K;
                add_block(&mut H, o, &Q.matrix(mode));
            }
        }
        if let Some(nu0) = vars.nu_offset() {
            let M = self.layout.M;
            for (stage, R) in self.R.iter().enumerate() {
                let o = nu0 + stage * M;
                add_block(&mut H, o, &R.matrix(mode));
            }
        }
        if let Some(wu0) = vars.wu_offset() {
            let P = self.layout.nin;
            for (stage, U) in self.U.iter().enumerate() {
                let o = wu0 + stage * P;
                add_block(&mut H, o, &U.matrix(mode));
            }
        }
        (H, g)
    }
}

fn add_block(H: &mut DMatrix<f64>, offset: usize, W: &DMatrix<f64>) {
    let mut block = H.slice_mut((offset, offset), (W.nrows(), W.ncols()));
    block += W;
}
