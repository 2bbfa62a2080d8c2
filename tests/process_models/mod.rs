//! Process models and solver wrappers shared by the integration tests.
//!
//! The models are small enough that their estimates can be checked against closed form results:
//! a scalar random walk reproduces the Kalman filter on the first filtering window.

#![allow(dead_code)]

use nalgebra::{DMatrix, DVector};

use horizon_estimate::error::{EstimateError, Result};
use horizon_estimate::models::{Bounds, ModelFactory, ProcessModel, SubIndex, VariableDecl};
use horizon_estimate::solver::{
    KktSolver, NlpProblem, NlpSolver, ReducedHessian, SensitivitySolver, SolveReport, SolveStatus, SolverOptions,
};

/// Scalar random walk `x(k+1) = x(k)`, observed directly.
pub struct RandomWalk {
    states: Vec<VariableDecl>,
    outputs: Vec<VariableDecl>,
    inputs: Vec<VariableDecl>,
}

impl ProcessModel for RandomWalk {
    fn states(&self) -> &[VariableDecl] {
        &self.states
    }
    fn outputs(&self) -> &[VariableDecl] {
        &self.outputs
    }
    fn inputs(&self) -> &[VariableDecl] {
        &self.inputs
    }
    fn step(&self, x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
        x.clone()
    }
    fn output(&self, x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
        x.clone()
    }
}

pub struct RandomWalkFactory;

impl ModelFactory for RandomWalkFactory {
    type Model = RandomWalk;

    fn build(&self, _num_stages: usize, _num_substeps: usize, _horizon_length: f64) -> Result<RandomWalk> {
        Ok(RandomWalk {
            states: vec![VariableDecl::scalar("x")],
            outputs: vec![VariableDecl::scalar("y")],
            inputs: Vec::new(),
        })
    }
}

/// Two independent random walks `a` and `b`, `b` bounded above by 1.
pub struct BoundedPair {
    states: Vec<VariableDecl>,
    outputs: Vec<VariableDecl>,
    inputs: Vec<VariableDecl>,
}

impl ProcessModel for BoundedPair {
    fn states(&self) -> &[VariableDecl] {
        &self.states
    }
    fn outputs(&self) -> &[VariableDecl] {
        &self.outputs
    }
    fn inputs(&self) -> &[VariableDecl] {
        &self.inputs
    }
    fn step(&self, x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
        x.clone()
    }
    fn output(&self, x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
        x.clone()
    }
}

pub struct BoundedPairFactory;

impl ModelFactory for BoundedPairFactory {
    type Model = BoundedPair;

    fn build(&self, _num_stages: usize, _num_substeps: usize, _horizon_length: f64) -> Result<BoundedPair> {
        Ok(BoundedPair {
            states: vec![
                VariableDecl::scalar("a"),
                VariableDecl::scalar("b").with_bounds(Bounds::at_most(1.)),
            ],
            outputs: vec![VariableDecl::scalar("ya"), VariableDecl::scalar("yb")],
            inputs: Vec::new(),
        })
    }
}

/// Cart on a line: position `p`, velocity `v`, driven by the force input `f`.
///
/// Sub-step length follows from the horizon length.
pub struct Cart {
    dt: f64,
    states: Vec<VariableDecl>,
    outputs: Vec<VariableDecl>,
    inputs: Vec<VariableDecl>,
}

impl ProcessModel for Cart {
    fn states(&self) -> &[VariableDecl] {
        &self.states
    }
    fn outputs(&self) -> &[VariableDecl] {
        &self.outputs
    }
    fn inputs(&self) -> &[VariableDecl] {
        &self.inputs
    }
    fn step(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![x[0] + self.dt * x[1], x[1] + self.dt * u[0]])
    }
    fn output(&self, x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![x[0]])
    }
    fn step_jacobian(&self, _x: &DVector<f64>, _u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        (
            DMatrix::from_row_slice(2, 2, &[1., self.dt, 0., 1.]),
            DMatrix::from_row_slice(2, 1, &[0., self.dt]),
        )
    }
}

pub struct CartFactory;

impl ModelFactory for CartFactory {
    type Model = Cart;

    fn build(&self, num_stages: usize, num_substeps: usize, horizon_length: f64) -> Result<Cart> {
        Ok(Cart {
            dt: horizon_length / (num_stages * num_substeps) as f64,
            states: vec![VariableDecl::scalar("p"), VariableDecl::scalar("v")],
            outputs: vec![VariableDecl::scalar("pm")],
            inputs: vec![VariableDecl::scalar("f")],
        })
    }
}

/// Draining tank `h' = h + dt (q - sqrt(h))`, not defined below an empty tank.
pub struct Tank {
    dt: f64,
    states: Vec<VariableDecl>,
    outputs: Vec<VariableDecl>,
    inputs: Vec<VariableDecl>,
}

impl ProcessModel for Tank {
    fn states(&self) -> &[VariableDecl] {
        &self.states
    }
    fn outputs(&self) -> &[VariableDecl] {
        &self.outputs
    }
    fn inputs(&self) -> &[VariableDecl] {
        &self.inputs
    }
    fn step(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![x[0] + self.dt * (u[0] - x[0].sqrt())])
    }
    fn output(&self, x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
        x.clone()
    }
}

pub struct TankFactory;

impl ModelFactory for TankFactory {
    type Model = Tank;

    fn build(&self, num_stages: usize, num_substeps: usize, horizon_length: f64) -> Result<Tank> {
        Ok(Tank {
            dt: horizon_length / (num_stages * num_substeps) as f64,
            states: vec![VariableDecl::scalar("h").with_bounds(Bounds::at_least(0.))],
            outputs: vec![VariableDecl::scalar("hm")],
            inputs: vec![VariableDecl::scalar("q")],
        })
    }
}

/// Three tray temperatures `T(1..3)` relaxing towards each other, trays 1 and 3 measured,
/// and the time invariant exchange coefficient `k`.
pub struct Trays {
    states: Vec<VariableDecl>,
    outputs: Vec<VariableDecl>,
    inputs: Vec<VariableDecl>,
}

impl ProcessModel for Trays {
    fn states(&self) -> &[VariableDecl] {
        &self.states
    }
    fn outputs(&self) -> &[VariableDecl] {
        &self.outputs
    }
    fn inputs(&self) -> &[VariableDecl] {
        &self.inputs
    }
    fn step(&self, x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
        let k = x[3];
        DVector::from_vec(vec![
            x[0] + k * (x[1] - x[0]),
            x[1] + k * (x[0] - 2. * x[1] + x[2]),
            x[2] + k * (x[1] - x[2]),
            k,
        ])
    }
    fn output(&self, x: &DVector<f64>, _u: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![x[0], x[2]])
    }
}

pub struct TraysFactory;

impl ModelFactory for TraysFactory {
    type Model = Trays;

    fn build(&self, _num_stages: usize, _num_substeps: usize, _horizon_length: f64) -> Result<Trays> {
        Ok(Trays {
            states: vec![
                VariableDecl::indexed("T", vec![SubIndex::at(1), SubIndex::at(2), SubIndex::at(3)]),
                VariableDecl::scalar("k").untimed(),
            ],
            outputs: vec![VariableDecl::indexed("Tm", vec![SubIndex::at(1), SubIndex::at(3)])],
            inputs: Vec::new(),
        })
    }
}

/// Fails the first `failures` solves with `status`, then solves with the KKT solver.
pub struct FlakySolver {
    pub inner: KktSolver,
    pub failures: usize,
    pub status: SolveStatus,
    pub solves: usize,
}

impl FlakySolver {
    pub fn new(failures: usize) -> FlakySolver {
        FlakySolver {
            inner: KktSolver::new(),
            failures,
            status: SolveStatus::Infeasible,
            solves: 0,
        }
    }
}

impl NlpSolver for FlakySolver {
    fn solve(&mut self, problem: &dyn NlpProblem, start: &DVector<f64>, options: &SolverOptions) -> SolveReport {
        self.solves += 1;
        if self.failures > 0 {
            self.failures -= 1;
            return SolveReport {
                status: self.status,
                solution: start.clone(),
                multipliers: DVector::zeros(problem.num_constraints()),
                iterations: 0,
                objective: problem.objective(start),
            };
        }
        self.inner.solve(problem, start, options)
    }
}

impl SensitivitySolver for FlakySolver {
    fn reduced_hessian(
        &mut self,
        problem: &dyn NlpProblem,
        solution: &DVector<f64>,
        directions: &[usize],
    ) -> Result<ReducedHessian> {
        self.inner.reduced_hessian(problem, solution, directions)
    }

    fn parametric_step(
        &mut self,
        problem: &dyn NlpProblem,
        solution: &DVector<f64>,
        perturbation: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        self.inner.parametric_step(problem, solution, perturbation)
    }
}

/// Solves with the KKT solver, but never provides a reduced Hessian.
pub struct NoSensitivity {
    pub inner: KktSolver,
}

impl NoSensitivity {
    pub fn new() -> NoSensitivity {
        NoSensitivity { inner: KktSolver::new() }
    }
}

impl NlpSolver for NoSensitivity {
    fn solve(&mut self, problem: &dyn NlpProblem, start: &DVector<f64>, options: &SolverOptions) -> SolveReport {
        self.inner.solve(problem, start, options)
    }
}

impl SensitivitySolver for NoSensitivity {
    fn reduced_hessian(
        &mut self,
        _problem: &dyn NlpProblem,
        _solution: &DVector<f64>,
        _directions: &[usize],
    ) -> Result<ReducedHessian> {
        Err(EstimateError::SensitivitySolverFailure {
            reason: "no sensitivity available".to_string(),
        })
    }

    fn parametric_step(
        &mut self,
        _problem: &dyn NlpProblem,
        _solution: &DVector<f64>,
        _perturbation: &DVector<f64>,
    ) -> Result<DVector<f64>> {
        Err(EstimateError::SensitivitySolverFailure {
            reason: "no sensitivity available".to_string(),
        })
    }
}

pub fn scalar(v: f64) -> DVector<f64> {
    DVector::from_vec(vec![v])
}

pub fn no_input() -> DVector<f64> {
    DVector::zeros(0)
}

/// Kalman filter estimate of a unit variance random walk observed with unit variance noise,
/// starting from zero with unit variance.
pub fn random_walk_filter(ys: &[f64]) -> f64 {
    let mut x = 0.;
    let mut p = 1.;
    for (i, y) in ys.iter().enumerate() {
        if i > 0 {
            p += 1.;
        }
        let k = p / (p + 1.);
        x += k * (y - x);
        p *= 1. - k;
    }
    x
}
