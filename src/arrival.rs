#![allow(non_snake_case)]

//! Arrival cost update.
//!
//! After each filtering solve the prior stage (stage 1, sub-point 0) is summarised into the arrival
//! cost of the next window:
//!  1. noisy states held at a bound are excluded,
//!  2. the sensitivity solver reports the information over the remaining prior stage states,
//!  3. the report is assembled into the prior weight `Pi` by registry slot,
//!  4. the arrival term is regenerated and the prior estimate copied into `x0`.

use log::{debug, warn};
use nalgebra::DMatrix;

use crate::error::{EstimateError, Result};
use crate::linalg;
use crate::linalg::rcond;
use crate::models::ProcessModel;
use crate::solver::problem::{VarLayout, WindowProblem};
use crate::solver::{NlpProblem, ReducedHessian, SensitivitySolver};
use crate::window::{Exclusion, Window};

/// Outcome of the prior weight update.
#[derive(Debug, Clone, PartialEq)]
pub enum CovarianceStatus {
    /// Pi assembled from the reduced Hessian.
    Updated,
    /// The previous Pi was kept.
    Retained(EstimateError),
}

/// Summary of one arrival cost update.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorUpdate {
    pub exclusion: Exclusion,
    pub covariance: CovarianceStatus,
    /// Slots missing from the reduced Hessian report.
    pub missing: Vec<usize>,
}

impl<M: ProcessModel> Window<M> {
    /// Noisy states at the prior stage within `tolerance` of a finite bound, or past it, are excluded.
    pub fn detect_active_bounds(&self, tolerance: f64) -> Exclusion {
        let mut excl = Exclusion::all_in(self.layout.K);
        let x = &self.x[1][0];
        for (slot, pos) in self.noisy_pos.iter().enumerate() {
            let b = self.state_bounds[*pos];
            let at_lower = b.lower.map_or(false, |l| x[*pos] - l <= tolerance);
            let at_upper = b.upper.map_or(false, |u| u - x[*pos] <= tolerance);
            if at_lower || at_upper {
                warn!(
                    "noisy state {} at a bound in the prior stage, excluded from the arrival cost",
                    self.noisy.key(slot).map(|k| k.to_string()).unwrap_or_default()
                );
                excl.set(slot, false);
            }
        }
        excl
    }

    /// Reduced Hessian over the participating prior stage states at the current window values.
    pub fn compute_reduced_hessian<S: SensitivitySolver + ?Sized>(
        &self,
        sensitivity: &mut S,
        excl: &Exclusion,
    ) -> Result<ReducedHessian> {
        let problem = WindowProblem::new(self);
        let directions: Vec<usize> = problem
            .prior_stage_variables()
            .into_iter()
            .enumerate()
            .filter(|(slot, _)| excl.participates(*slot))
            .map(|(_, var)| var)
            .collect();
        let solution = problem.start();
        let problem: &dyn NlpProblem = &problem;
        sensitivity.reduced_hessian(problem, &solution, &directions)
    }

    /// Assembles Pi from a reduced Hessian report.
    ///
    /// `Pi[j,k] = report[row(j), row(k)]` for participating pairs, zero otherwise and for slots
    /// missing from the report. Returns the missing slots.
    pub fn assemble_prior_covariance(&mut self, report: &ReducedHessian, excl: &Exclusion) -> Vec<usize> {
        let K = self.layout.K;
        let problem_vars = VarLayout::for_window(self);
        let rows: Vec<Option<usize>> = self
            .noisy_pos
            .iter()
            .enumerate()
            .map(|(slot, pos)| {
                if excl.participates(slot) {
                    report.row_of(problem_vars.x(1, 0, *pos))
                } else {
                    None
                }
            })
            .collect();

        let mut missing = Vec::new();
        for (slot, row) in rows.iter().enumerate() {
            if excl.participates(slot) && row.is_none() {
                warn!(
                    "no reduced hessian row for {}, prior weight set to zero",
                    self.noisy.key(slot).map(|k| k.to_string()).unwrap_or_default()
                );
                missing.push(slot);
            }
        }

        let mut Pi = DMatrix::zeros(K, K);
        for j in 0..K {
            for k in 0..K {
                if let (Some(rj), Some(rk)) = (rows[j], rows[k]) {
                    Pi[(j, k)] = report.matrix[(rj, rk)];
                }
            }
        }
        linalg::symmetrize(&mut Pi);
        if rcond::rcond_symmetric(&Pi) < 0. {
            warn!("prior weight is not positive semi-definite");
        }
        self.prior.Pi = Pi;
        missing
    }

    /// Copies the prior stage estimate into `x0` and the prior stage values of states that are
    /// not noisy into the initial condition.
    pub fn update_prior_state(&mut self) {
        let x1 = self.x[1][0].clone();
        self.prior.x0 = self.noisy_state(1, 0);
        for pos in 0..self.layout.nx {
            if self.slot_of_state[pos].is_none() {
                self.ic[pos] = x1[pos];
            }
        }
    }

    /// The arrival cost update run after every filtering solve.
    ///
    /// A failing sensitivity computation keeps the previous Pi.
    pub fn prior_phase<S: SensitivitySolver + ?Sized>(&mut self, sensitivity: &mut S, tolerance: f64) -> PriorUpdate {
        let excl = self.detect_active_bounds(tolerance);
        let (covariance, missing) = match self.compute_reduced_hessian(sensitivity, &excl) {
            Ok(report) => {
                let missing = self.assemble_prior_covariance(&report, &excl);
                (CovarianceStatus::Updated, missing)
            }
            Err(err) => {
                warn!("{}, previous prior weight kept", err);
                (CovarianceStatus::Retained(err), Vec::new())
            }
        };
        self.regenerate_objective(&excl);
        self.update_prior_state();
        debug!("prior updated: x0 {:?}", self.prior.x0.as_slice());
        PriorUpdate {
            exclusion: excl,
            covariance,
            missing,
        }
    }
}
