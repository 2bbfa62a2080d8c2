#![allow(non_snake_case)]

//! Solver interfaces.
//!
//! The estimation problem is handed to an [`NlpSolver`] as an [`NlpProblem`]: a quadratic
//! objective with constant Hessian, nonlinear equality constraints and variable bounds.
//! The arrival cost needs second order information at the solution which a [`SensitivitySolver`]
//! provides as a [`ReducedHessian`] value.
//!
//! [`KktSolver`] implements both for the dense problem sizes of an estimation window.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod kkt;
pub mod problem;

pub use kkt::KktSolver;

/// An equality constrained problem with bounds.
///
/// minimise `0.5 v'Hv + g'v` subject to `c(v) = 0` and `lower <= v <= upper`.
pub trait NlpProblem {
    fn num_variables(&self) -> usize;
    fn num_constraints(&self) -> usize;

    /// Constant objective Hessian.
    fn hessian(&self) -> &DMatrix<f64>;
    /// Linear objective term.
    fn linear_term(&self) -> &DVector<f64>;

    fn constraints(&self, v: &DVector<f64>) -> DVector<f64>;
    fn constraint_jacobian(&self, v: &DVector<f64>) -> DMatrix<f64>;

    fn lower_bounds(&self) -> &DVector<f64>;
    fn upper_bounds(&self) -> &DVector<f64>;

    fn objective(&self, v: &DVector<f64>) -> f64 {
        0.5 * v.dot(&(self.hessian() * v)) + self.linear_term().dot(v)
    }

    fn objective_gradient(&self, v: &DVector<f64>) -> DVector<f64> {
        self.hessian() * v + self.linear_term()
    }
}

/// Outcome of an NLP solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveStatus {
    Optimal,
    Infeasible,
    /// Iteration or time cap reached.
    IterationLimit,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iter: usize,
    /// Time cap in seconds.
    pub max_time: f64,
    /// Proximal regularization of the KKT systems.
    pub regularization: f64,
    /// Reuse the active set of the previous solve.
    pub warm_start: bool,
    /// Convergence tolerance on step and constraint violation.
    pub tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        SolverOptions {
            max_iter: 100,
            max_time: 10.,
            regularization: 1e-8,
            warm_start: true,
            tolerance: 1e-9,
        }
    }
}

impl SolverOptions {
    /// Options for the retry after a failed solve.
    ///
    /// Larger iteration cap and time budget, stronger regularization, cold active set.
    pub fn relaxed(&self) -> SolverOptions {
        SolverOptions {
            max_iter: self.max_iter * 5,
            max_time: self.max_time * 5.,
            regularization: self.regularization.max(1e-4),
            warm_start: false,
            tolerance: self.tolerance,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    pub status: SolveStatus,
    pub solution: DVector<f64>,
    /// Constraint multipliers
    pub multipliers: DVector<f64>,
    pub iterations: usize,
    pub objective: f64,
}

/// Information over a set of problem variables at a solution.
#[derive(Debug, Clone, PartialEq)]
pub struct ReducedHessian {
    pub matrix: DMatrix<f64>,
    /// Problem variable of each matrix row.
    pub rows: Vec<usize>,
}

impl ReducedHessian {
    /// Matrix row of a problem variable.
    pub fn row_of(&self, variable: usize) -> Option<usize> {
        self.rows.iter().position(|r| *r == variable)
    }
}

pub trait NlpSolver {
    fn solve(&mut self, problem: &dyn NlpProblem, start: &DVector<f64>, options: &SolverOptions) -> SolveReport;
}

pub trait SensitivitySolver {
    /// Reduced Hessian over `directions` at `solution`.
    ///
    /// Directions that cannot be reported are left out of the returned rows.
    fn reduced_hessian(
        &mut self,
        problem: &dyn NlpProblem,
        solution: &DVector<f64>,
        directions: &[usize],
    ) -> Result<ReducedHessian>;

    /// First order change of the solution for a change of the constraint right hand sides,
    /// `c(v) + perturbation = 0`.
    fn parametric_step(
        &mut self,
        problem: &dyn NlpProblem,
        solution: &DVector<f64>,
        perturbation: &DVector<f64>,
    ) -> Result<DVector<f64>>;
}
