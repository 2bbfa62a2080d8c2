#![allow(non_snake_case)]

//! Dense KKT solver.
//!
//! SQP on the equality constrained problem with the constant objective Hessian. Each iteration
//! solves the regularised KKT system
//!
//! ```text
//! [ H + dI   A'   E' ] [ dv ]   [ -g ]
//! [ A        -dI  0  ] [ l  ] = [ -c - d l0 ]
//! [ E        0   -dI ] [ mu ]   [ -d mu0 ]
//! ```
//!
//! where the rows `E` pin the variables held at a bound. The multipliers enter the right hand
//! side with their previous values (proximal method of multipliers), so the regularization does
//! not shift the converged point and dependent constraint rows stay solvable.
//!
//! Bounds are handled by a primal active set: the ratio test pins a blocking variable and at
//! convergence a pinned variable whose multiplier has the wrong sign is released. Steps are accepted on an l1 merit function.
//!
//! The same KKT system without primal regularization provides the reduced Hessian and the
//! parametric sensitivity of the solution.

use std::time::Instant;

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::error::{EstimateError, Result};
use crate::linalg;
use crate::solver::{NlpProblem, NlpSolver, ReducedHessian, SensitivitySolver, SolveReport, SolveStatus, SolverOptions};

/// Dual regularization of the sensitivity systems.
const SENSITIVITY_REGULARIZATION: f64 = 1e-12;
/// Smallest step component considered by the ratio test.
const RATIO_EPS: f64 = 1e-12;
const ARMIJO: f64 = 1e-4;
const MAX_BACKTRACK: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Lower,
    Upper,
}

#[derive(Debug, Clone)]
pub struct KktSolver {
    /// Absolute distance to a bound at which a variable is held at it in sensitivity computations.
    pub bound_tolerance: f64,
    active: Vec<Option<Side>>,
}

impl Default for KktSolver {
    fn default() -> Self {
        KktSolver::new()
    }
}

impl KktSolver {
    pub fn new() -> KktSolver {
        KktSolver::with_bound_tolerance(1e-8)
    }

    pub fn with_bound_tolerance(bound_tolerance: f64) -> KktSolver {
        KktSolver {
            bound_tolerance,
            active: Vec::new(),
        }
    }

    /// Number of variables held at a bound by the last solve.
    pub fn active_bounds(&self) -> usize {
        self.active.iter().filter(|s| s.is_some()).count()
    }

    /// Variables within `bound_tolerance` of a finite bound, or past it.
    fn pinned_at(&self, problem: &dyn NlpProblem, v: &DVector<f64>) -> Vec<usize> {
        let lb = problem.lower_bounds();
        let ub = problem.upper_bounds();
        (0..v.len())
            .filter(|i| {
                (lb[*i].is_finite() && v[*i] - lb[*i] <= self.bound_tolerance)
                    || (ub[*i].is_finite() && ub[*i] - v[*i] <= self.bound_tolerance)
            })
            .collect()
    }

    fn sensitivity_system(&self, problem: &dyn NlpProblem, v: &DVector<f64>) -> (DMatrix<f64>, Vec<usize>) {
        let pinned = self.pinned_at(problem, v);
        let A = problem.constraint_jacobian(v);
        let K = kkt_matrix(problem.hessian(), &A, &pinned, 0., SENSITIVITY_REGULARIZATION);
        (K, pinned)
    }
}

fn kkt_matrix(H: &DMatrix<f64>, A: &DMatrix<f64>, pinned: &[usize], primal: f64, dual: f64) -> DMatrix<f64> {
    let n = H.nrows();
    let m = A.nrows();
    let size = n + m + pinned.len();
    let mut K = DMatrix::zeros(size, size);
    K.slice_mut((0, 0), (n, n)).copy_from(H);
    K.slice_mut((n, 0), (m, n)).copy_from(A);
    K.slice_mut((0, n), (n, m)).copy_from(&A.transpose());
    for (r, i) in pinned.iter().enumerate() {
        K[(n + m + r, *i)] = 1.;
        K[(*i, n + m + r)] = 1.;
    }
    for i in 0..n {
        K[(i, i)] += primal;
    }
    for i in n..size {
        K[(i, i)] = -dual;
    }
    K
}

fn inf_norm(v: &DVector<f64>) -> f64 {
    v.iter().fold(0., |a, x| a.max(x.abs()))
}

fn l1_norm(v: &DVector<f64>) -> f64 {
    v.iter().map(|x| x.abs()).sum()
}

fn clamp_to(v: &mut DVector<f64>, lb: &DVector<f64>, ub: &DVector<f64>) {
    for i in 0..v.len() {
        v[i] = v[i].max(lb[i]).min(ub[i]);
    }
}

impl NlpSolver for KktSolver {
    fn solve(&mut self, problem: &dyn NlpProblem, start: &DVector<f64>, options: &SolverOptions) -> SolveReport {
        let started = Instant::now();
        let n = problem.num_variables();
        let m = problem.num_constraints();
        let lb = problem.lower_bounds();
        let ub = problem.upper_bounds();
        let H = problem.hessian();

        let mut v = start.clone();
        clamp_to(&mut v, lb, ub);
        let mut side = if options.warm_start && self.active.len() == n {
            self.active.clone()
        } else {
            vec![None; n]
        };
        for i in 0..n {
            match side[i] {
                Some(Side::Lower) if lb[i].is_finite() => v[i] = lb[i],
                Some(Side::Upper) if ub[i].is_finite() => v[i] = ub[i],
                _ => side[i] = None,
            }
        }

        let mut lambda = DVector::zeros(m);
        let mut bound_mu = vec![0.; n];
        let mut rho = 1.;
        let report = |status, v: DVector<f64>, lambda: DVector<f64>, iterations| SolveReport {
            status,
            objective: problem.objective(&v),
            solution: v,
            multipliers: lambda,
            iterations,
        };

        for iter in 0..options.max_iter {
            if started.elapsed().as_secs_f64() > options.max_time {
                debug!("sqp time cap reached after {} iterations", iter);
                return report(SolveStatus::IterationLimit, v, lambda, iter);
            }
            let c = problem.constraints(&v);
            let A = problem.constraint_jacobian(&v);
            let g = problem.objective_gradient(&v);
            let pinned: Vec<usize> = (0..n).filter(|i| side[*i].is_some()).collect();
            let p = pinned.len();

            let delta = options.regularization;
            let K = kkt_matrix(H, &A, &pinned, delta, delta);
            let mut rhs = DVector::zeros(n + m + p);
            rhs.rows_mut(0, n).copy_from(&(-&g));
            rhs.rows_mut(n, m).copy_from(&(-&c - &lambda * delta));
            for (r, i) in pinned.iter().enumerate() {
                rhs[n + m + r] = -delta * bound_mu[*i];
            }
            let sol = match K.lu().solve(&rhs) {
                Some(sol) if sol.iter().all(|s| s.is_finite()) => sol,
                _ => {
                    warn!("sqp KKT system singular at iteration {}", iter);
                    return report(SolveStatus::Error, v, lambda, iter);
                }
            };
            let dv = sol.rows(0, n).into_owned();
            lambda = sol.rows(n, m).into_owned();
            let mu = sol.rows(n + m, p).into_owned();
            for (r, i) in pinned.iter().enumerate() {
                bound_mu[*i] = mu[r];
            }

            let scale = 1. + inf_norm(&v);
            let step = inf_norm(&dv);
            let violation = inf_norm(&c);
            debug!(
                "sqp iter {} step {:.3e} violation {:.3e} active {}",
                iter, step, violation, p
            );

            if step <= options.tolerance * scale && violation <= options.tolerance * scale {
                // release the pinned variable with the worst multiplier
                let mut release: Option<(usize, f64)> = None;
                for (r, i) in pinned.iter().enumerate() {
                    let wrong = match side[*i] {
                        Some(Side::Lower) => mu[r],
                        Some(Side::Upper) => -mu[r],
                        None => 0.,
                    };
                    if wrong > options.tolerance && release.map_or(true, |(_, w)| wrong > w) {
                        release = Some((*i, wrong));
                    }
                }
                match release {
                    Some((i, _)) => {
                        debug!("sqp releases variable {}", i);
                        side[i] = None;
                        bound_mu[i] = 0.;
                        continue;
                    }
                    None => {
                        self.active = side;
                        return report(SolveStatus::Optimal, v, lambda, iter + 1);
                    }
                }
            }

            // ratio test over the free variables
            let mut alpha_max = 1.;
            let mut blocking = None;
            for i in 0..n {
                if side[i].is_some() {
                    continue;
                }
                let eps = RATIO_EPS * (1. + v[i].abs());
                if dv[i] < -eps && lb[i].is_finite() {
                    let a = ((lb[i] - v[i]) / dv[i]).max(0.);
                    if a < alpha_max {
                        alpha_max = a;
                        blocking = Some((i, Side::Lower));
                    }
                } else if dv[i] > eps && ub[i].is_finite() {
                    let a = ((ub[i] - v[i]) / dv[i]).max(0.);
                    if a < alpha_max {
                        alpha_max = a;
                        blocking = Some((i, Side::Upper));
                    }
                }
            }

            // l1 merit backtracking
            rho = f64::max(rho, 1.5 * inf_norm(&lambda));
            let c1 = l1_norm(&c);
            let phi0 = problem.objective(&v) + rho * c1;
            let slope = (g.dot(&dv) - rho * c1).min(0.);
            let mut alpha = alpha_max;
            let mut trial = &v + &dv * alpha;
            for _ in 0..MAX_BACKTRACK {
                clamp_to(&mut trial, lb, ub);
                let phi = problem.objective(&trial) + rho * l1_norm(&problem.constraints(&trial));
                if phi <= phi0 + ARMIJO * alpha * slope {
                    break;
                }
                alpha *= 0.5;
                trial = &v + &dv * alpha;
            }
            clamp_to(&mut trial, lb, ub);
            v = trial;
            for i in pinned.iter() {
                match side[*i] {
                    Some(Side::Lower) => v[*i] = lb[*i],
                    Some(Side::Upper) => v[*i] = ub[*i],
                    None => {}
                }
            }

            if let Some((i, s)) = blocking {
                if alpha == alpha_max {
                    side[i] = Some(s);
                    v[i] = match s {
                        Side::Lower => lb[i],
                        Side::Upper => ub[i],
                    };
                }
            }
        }

        let violation = inf_norm(&problem.constraints(&v));
        self.active = side;
        if violation > options.tolerance * (1. + inf_norm(&v)) {
            report(SolveStatus::Infeasible, v, lambda, options.max_iter)
        } else {
            report(SolveStatus::IterationLimit, v, lambda, options.max_iter)
        }
    }
}

impl SensitivitySolver for KktSolver {
    fn reduced_hessian(
        &mut self,
        problem: &dyn NlpProblem,
        solution: &DVector<f64>,
        directions: &[usize],
    ) -> Result<ReducedHessian> {
        let n = problem.num_variables();
        let (K, pinned) = self.sensitivity_system(problem, solution);
        let rows: Vec<usize> = directions.iter().cloned().filter(|d| !pinned.contains(d)).collect();
        let d = rows.len();

        let mut B = DMatrix::zeros(K.nrows(), d);
        for (a, var) in rows.iter().enumerate() {
            B[(*var, a)] = 1.;
        }
        let X = K.lu().solve(&B).ok_or_else(|| EstimateError::SensitivitySolverFailure {
            reason: "singular KKT system".to_string(),
        })?;

        let mut C = DMatrix::zeros(d, d);
        for a in 0..d {
            for (b, var) in rows.iter().enumerate() {
                C[(b, a)] = X[(*var, a)];
            }
        }
        if C.iter().any(|c| !c.is_finite()) || rows.iter().any(|r| *r >= n) {
            return Err(EstimateError::SensitivitySolverFailure {
                reason: "covariance block not finite".to_string(),
            });
        }
        linalg::symmetrize(&mut C);
        let matrix = linalg::inverse_spd(&C, "conditional").map_err(|_| EstimateError::SensitivitySolverFailure {
            reason: "covariance block not positive definite".to_string(),
        })?;
        Ok(ReducedHessian { matrix, rows })
    }

    fn parametric_step(
        &mut self,
        problem: &dyn NlpProblem,
        solution: &DVector<f64>,
        perturbation: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        let n = problem.num_variables();
        let m = problem.num_constraints();
        if perturbation.len() != m {
            return Err(EstimateError::DimensionMismatch {
                what: "constraint perturbation",
                expected: m,
                found: perturbation.len(),
            });
        }
        let (K, _) = self.sensitivity_system(problem, solution);
        let mut rhs = DVector::zeros(K.nrows());
        rhs.rows_mut(n, m).copy_from(&(-perturbation));
        let sol = K.lu().solve(&rhs).ok_or_else(|| EstimateError::SensitivitySolverFailure {
            reason: "singular KKT system".to_string(),
        })?;
        let dv = sol.rows(0, n).into_owned();
        if dv.iter().any(|x| !x.is_finite()) {
            return Err(EstimateError::SensitivitySolverFailure {
                reason: "parametric step not finite".to_string(),
            });
        }
        Ok(dv)
    }
}
