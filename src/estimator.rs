#![allow(non_snake_case)]

//! Moving horizon estimator.
//!
//! Drives a [`Window`] through the estimation cycle:
//!  - preparation: the window is simulated from the initial guess and solved with the
//!    PREPARATION objective, then switched to FILTERING,
//!  - every cycle: shift, patch the newest measurement and input, re-initialize the newest stage,
//!    solve (retrying once with relaxed options) and update the arrival cost.
//!
//! With the advanced-step strategy the estimate of a cycle solved on predicted data is corrected
//! by the parametric sensitivity once the plant data arrives.

use log::{debug, error, info, warn};
use nalgebra::{DMatrix, DVector};
use rand_core::RngCore;

use crate::arrival::PriorUpdate;
use crate::config::EstimatorConfig;
use crate::error::{check_len, EstimateError, Result};
use crate::journal::{CycleRecord, Journal};
use crate::models::{Estimator, ModelFactory, PriorState, ProcessModel, VariableDecl};
use crate::noise::{CorrelatedNoise, UncorrelatedNoise};
use crate::patch::inject_synthetic_noise;
use crate::solver::problem::{VarLayout, WindowProblem};
use crate::solver::{NlpProblem, NlpSolver, SensitivitySolver, SolveReport, SolveStatus, SolverOptions};
use crate::window::{Offsets, Phase, Selection, Window, WindowOptions};

/// Summary of one estimation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub solve: SolveReport,
    /// Whether the relaxed retry was needed.
    pub retried: bool,
    pub prior: PriorUpdate,
    pub offsets: Offsets,
}

pub struct MovingHorizonEstimator<F: ModelFactory, S> {
    window: Window<F::Model>,
    /// One stage model for re-initialization
    simulator: F::Model,
    solver: S,
    options: SolverOptions,
    retry_options: SolverOptions,
    bound_tolerance: f64,
    advanced_step: bool,
    /// Completed filtering cycles
    cycles: usize,
    state_offset: DVector<f64>,
    /// Arrival weight of the last solved problem, kept for the advanced-step correction
    solved_arrival_weight: Option<DMatrix<f64>>,
    injected_noise: DVector<f64>,
    real_states: Option<DVector<f64>>,
    real_outputs: Option<DVector<f64>>,
    journal: Option<Journal>,
}

impl<F, S> MovingHorizonEstimator<F, S>
where
    F: ModelFactory,
    S: NlpSolver + SensitivitySolver,
{
    pub fn new(
        factory: &F,
        num_stages: usize,
        num_substeps: usize,
        selection: &Selection,
        window_options: WindowOptions,
        solver: S,
    ) -> Result<Self> {
        let window = Window::build(num_stages, num_substeps, factory, selection, window_options)?;
        let simulator = factory.build(1, num_substeps, window_options.horizon_length / num_stages as f64)?;
        let layout = window.layout();
        let options = SolverOptions::default();
        Ok(MovingHorizonEstimator {
            window,
            simulator,
            solver,
            options,
            retry_options: options.relaxed(),
            bound_tolerance: 1e-8,
            advanced_step: false,
            cycles: 0,
            state_offset: DVector::zeros(layout.nx),
            solved_arrival_weight: None,
            injected_noise: DVector::zeros(layout.M),
            real_states: None,
            real_outputs: None,
            journal: None,
        })
    }

    /// Creates an estimator from a configuration, applying its variances and opening its journal.
    pub fn from_config(factory: &F, config: &EstimatorConfig, solver: S) -> Result<Self> {
        config.validate()?;
        let mut mhe = MovingHorizonEstimator::new(
            factory,
            config.stages,
            config.substeps,
            &config.selection(),
            config.window_options(),
            solver,
        )?;
        mhe.set_solver_options(config.solver);
        mhe.set_retry_options(config.retry_options());
        mhe.set_bound_tolerance(config.bound_tolerance);
        mhe.set_advanced_step(config.advanced_step);
        if let Some(q) = &config.variances.process {
            mhe.set_process_variances(&DVector::from_column_slice(q))?;
        }
        if let Some(r) = &config.variances.measurement {
            mhe.set_measurement_variances(&DVector::from_column_slice(r))?;
        }
        if let Some(u) = &config.variances.input {
            mhe.set_input_variances(&DVector::from_column_slice(u))?;
        }
        if let Some(j) = &config.journal {
            mhe.open_journal(&j.directory, &j.suffix)?;
        }
        Ok(mhe)
    }

    pub fn window(&self) -> &Window<F::Model> {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut Window<F::Model> {
        &mut self.window
    }

    pub fn solver(&self) -> &S {
        &self.solver
    }

    pub fn solver_mut(&mut self) -> &mut S {
        &mut self.solver
    }

    pub fn set_solver_options(&mut self, options: SolverOptions) {
        self.options = options;
        self.retry_options = options.relaxed();
    }

    pub fn set_retry_options(&mut self, options: SolverOptions) {
        self.retry_options = options;
    }

    pub fn set_bound_tolerance(&mut self, tolerance: f64) {
        self.bound_tolerance = tolerance;
    }

    pub fn set_advanced_step(&mut self, enabled: bool) {
        self.advanced_step = enabled;
    }

    pub fn cycles(&self) -> usize {
        self.cycles
    }

    // ---- weights ----

    /// Process noise variances per noisy state.
    pub fn set_process_variances(&mut self, q: &DVector<f64>) -> Result<()> {
        check_len("process noise variance", self.window.layout().K, q.len())?;
        let labels = self.window.noisy_registry().labels();
        let Q = UncorrelatedNoise::new(q.clone()).information(|i| labels[i].clone())?;
        self.window.set_process_weight(Q)
    }

    pub fn set_process_covariance(&mut self, Q: &DMatrix<f64>) -> Result<()> {
        let W = CorrelatedNoise { Q: Q.clone() }.information("process noise")?;
        self.window.set_process_weight(W)
    }

    /// Measurement noise variances per measured output.
    pub fn set_measurement_variances(&mut self, r: &DVector<f64>) -> Result<()> {
        check_len("measurement noise variance", self.window.layout().M, r.len())?;
        let labels = self.window.measurement_registry().labels();
        let R = UncorrelatedNoise::new(r.clone()).information(|i| labels[i].clone())?;
        self.window.set_measurement_weight(R)
    }

    pub fn set_measurement_covariance(&mut self, R: &DMatrix<f64>) -> Result<()> {
        let W = CorrelatedNoise { Q: R.clone() }.information("measurement noise")?;
        self.window.set_measurement_weight(W)
    }

    /// Input noise variances per model input.
    pub fn set_input_variances(&mut self, v: &DVector<f64>) -> Result<()> {
        check_len("input noise variance", self.window.layout().nin, v.len())?;
        let labels: Vec<String> = self
            .window
            .model()
            .inputs()
            .iter()
            .flat_map(VariableDecl::labels)
            .collect();
        let U = UncorrelatedNoise::new(v.clone()).information(|i| labels[i].clone())?;
        self.window.set_input_weight(U)
    }

    // ---- initial guess ----

    /// Initial state of every model state.
    ///
    /// Fills the window, sets the initial conditions and the prior estimate.
    pub fn initialize(&mut self, x: &DVector<f64>) -> Result<()> {
        self.window.fill_states(x)?;
        self.window.set_initial_condition(x)?;
        let prior = PriorState {
            x0: self.window.noisy_state(0, 0),
            Pi: self.window.prior().Pi.clone(),
        };
        self.window.set_prior(prior)
    }

    /// Prior information of the first filtering window.
    pub fn set_prior_weight(&mut self, Pi: &DMatrix<f64>) -> Result<()> {
        let prior = PriorState {
            x0: self.window.prior().x0.clone(),
            Pi: Pi.clone(),
        };
        self.window.set_prior(prior)
    }

    pub fn open_journal<P: AsRef<std::path::Path>>(&mut self, directory: P, suffix: &str) -> Result<()> {
        let labels = self.window.noisy_registry().labels();
        self.journal = Some(Journal::create(directory, suffix, &labels)?);
        Ok(())
    }

    /// Plant states and outputs of the current cycle, journaled when supplied.
    pub fn set_plant_values(&mut self, states: &DVector<f64>, outputs: &DVector<f64>) -> Result<()> {
        let l = self.window.layout();
        check_len("plant states", l.nx, states.len())?;
        check_len("plant outputs", self.window.model().output_dim(), outputs.len())?;
        self.real_states = Some(DVector::from_iterator(
            l.K,
            (0..l.K).map(|k| states[self.window.noisy_position(k)]),
        ));
        self.real_outputs = Some(DVector::from_iterator(
            l.M,
            (0..l.M).map(|m| outputs[self.window.measured_position(m)]),
        ));
        Ok(())
    }

    // ---- estimation ----

    /// Solves the preparation problem on a history of measurements and inputs, and switches to
    /// FILTERING.
    ///
    /// The history fills every stage but the newest, one sample per stage, oldest first. The
    /// newest stage holds the last sample until the first [`step`](Self::step) supplies its
    /// measurement and input. Later steps shift the window by one stage.
    pub fn prepare(&mut self, measurements: &[DVector<f64>], inputs: &[DVector<f64>]) -> Result<SolveReport> {
        let l = self.window.layout();
        if self.window.phase() != Phase::Preparation {
            return Err(EstimateError::InvalidPhaseTransition {
                from: self.window.phase().as_str(),
                to: Phase::Preparation.as_str(),
            });
        }
        let newest = l.nfe - 1;
        check_len("measurement history", newest, measurements.len())?;
        check_len("input history", newest, inputs.len())?;
        for stage in 0..l.nfe {
            let sample = stage.min(newest - 1);
            self.window.patch_measurement(stage, &measurements[sample])?;
            self.window.patch_input(stage, &inputs[sample])?;
        }
        self.window.simulate_window(&self.simulator);

        let (report, _) = self.solve_with_retry()?;
        for stage in 0..l.nfe {
            let nu = self.window.measurement(stage) - self.window.predicted_output(stage);
            self.window.set_measurement_noise(stage, &nu)?;
        }
        self.window.set_phase(Phase::Filtering)?;
        info!("preparation solved in {} iterations", report.iterations);
        Ok(report)
    }

    /// One filtering cycle with the newest measurement and held input.
    ///
    /// The first cycle after [`prepare`](Self::prepare) completes its window at the newest stage,
    /// every later cycle shifts the window first.
    pub fn step(&mut self, measurement: &DVector<f64>, input: &DVector<f64>) -> Result<CycleReport> {
        self.step_measured(measurement, input, None)
    }

    /// A filtering cycle on a measurement perturbed by synthetic noise of per channel `variance`.
    pub fn step_with_noise<R: RngCore + ?Sized>(
        &mut self,
        measurement: &DVector<f64>,
        input: &DVector<f64>,
        variance: &DVector<f64>,
        rng: &mut R,
    ) -> Result<CycleReport> {
        let (noisy, noise) = inject_synthetic_noise(measurement, variance, rng)?;
        self.step_measured(&noisy, input, Some(noise))
    }

    fn step_measured(
        &mut self,
        measurement: &DVector<f64>,
        input: &DVector<f64>,
        noise: Option<DVector<f64>>,
    ) -> Result<CycleReport> {
        if self.window.phase() != Phase::Filtering {
            return Err(EstimateError::InvalidPhaseTransition {
                from: self.window.phase().as_str(),
                to: Phase::Filtering.as_str(),
            });
        }
        let newest = self.window.layout().nfe - 1;
        if self.cycles > 0 {
            self.window.shift();
            self.window.shift_measurement_input_history();
        }
        self.window.patch_measurement(newest, measurement)?;
        self.window.patch_input(newest, input)?;
        self.injected_noise = match noise {
            Some(noise) => noise,
            None => DVector::zeros(self.window.layout().M),
        };
        if self.cycles > 0 {
            self.window.reinitialize_last_stage(&self.simulator);
            self.window.adjust_disturbance_guess();
        }

        let previous = self.current_estimate();
        let (solve, retried) = self.solve_with_retry()?;
        let offsets = self.window.compute_offset(newest)?;
        if self.advanced_step {
            self.solved_arrival_weight = Some(self.window.arrival_weight().clone());
        }
        let prior = self.window.prior_phase(&mut self.solver, self.bound_tolerance);
        self.state_offset = self.current_estimate() - previous;
        self.cycles += 1;
        self.write_journal()?;
        self.real_states = None;
        self.real_outputs = None;
        info!(
            "cycle {} solved in {} iterations, objective {:.6e}",
            self.cycles, solve.iterations, solve.objective
        );
        Ok(CycleReport {
            solve,
            retried,
            prior,
            offsets,
        })
    }

    /// Corrects the newest solution with fresh plant data by the parametric sensitivity.
    ///
    /// Returns the change of the newest estimate, also kept as the state offset.
    pub fn advanced_step_correction(&mut self, measurement: &DVector<f64>, input: &DVector<f64>) -> Result<DVector<f64>> {
        let l = self.window.layout();
        let solved_weight = match (&self.solved_arrival_weight, self.advanced_step) {
            (Some(W), true) if self.cycles > 0 => W.clone(),
            _ => {
                debug!("advanced step correction skipped");
                self.state_offset = DVector::zeros(l.nx);
                return Ok(self.state_offset.clone());
            }
        };
        let newest = l.nfe - 1;
        let fresh = self.window.compute_offset_against(newest, measurement, input)?;
        let vars = VarLayout::for_window(&self.window);

        // the sensitivity is that of the solved problem, before its arrival cost update
        let next_weight = std::mem::replace(&mut self.window.arrival_weight, solved_weight);
        let corrected = {
            let problem = WindowProblem::new(&self.window);
            let v = problem.start();
            let p = problem.measurement_perturbation(newest, &fresh.measurement)
                + problem.input_perturbation(&v, newest, &fresh.input);
            let problem: &dyn NlpProblem = &problem;
            self.solver.parametric_step(problem, &v, &p).map(|dv| v + dv)
        };
        self.window.arrival_weight = next_weight;
        let corrected = corrected?;
        let previous = self.current_estimate();
        vars.unpack(&mut self.window, &corrected);
        self.window.patch_measurement(newest, measurement)?;
        self.window.patch_input(newest, input)?;
        self.state_offset = self.current_estimate() - previous;
        debug!("advanced step offset {:?}", self.state_offset.as_slice());
        Ok(self.state_offset.clone())
    }

    /// Newest stage estimate of every model state.
    pub fn current_estimate(&self) -> DVector<f64> {
        let l = self.window.layout();
        self.window.state(l.nfe - 1, l.ncp).clone()
    }

    /// Change of the newest estimate by the last cycle or correction.
    pub fn state_offset(&self) -> &DVector<f64> {
        &self.state_offset
    }

    fn solve_once(&mut self, options: &SolverOptions) -> SolveReport {
        let problem = WindowProblem::new(&self.window);
        let start = problem.start();
        let problem: &dyn NlpProblem = &problem;
        self.solver.solve(problem, &start, options)
    }

    /// Solves the window, retrying once with the relaxed options.
    ///
    /// The window takes the solution only when the solve is optimal.
    fn solve_with_retry(&mut self) -> Result<(SolveReport, bool)> {
        let vars = VarLayout::for_window(&self.window);
        let options = self.options;
        let report = self.solve_once(&options);
        if report.status == SolveStatus::Optimal {
            vars.unpack(&mut self.window, &report.solution);
            return Ok((report, false));
        }
        warn!("solve failed with {:?}, retrying with relaxed options", report.status);
        let retry_options = self.retry_options;
        let report = self.solve_once(&retry_options);
        if report.status == SolveStatus::Optimal {
            vars.unpack(&mut self.window, &report.solution);
            return Ok((report, true));
        }
        error!("solve failed with {:?} after retry", report.status);
        Err(EstimateError::SolverFailure {
            status: report.status,
            retried: true,
        })
    }

    fn write_journal(&mut self) -> Result<()> {
        let journal = match self.journal.as_mut() {
            Some(journal) => journal,
            None => return Ok(()),
        };
        let w = &self.window;
        let l = w.layout();
        let newest = l.nfe - 1;
        let input_noise = DVector::from_iterator(
            l.nfe * l.nin,
            (0..l.nfe).flat_map(|i| w.input_noise(i).iter().cloned().collect::<Vec<_>>()),
        );
        let offsets = w.latest_offsets();
        let record = CycleRecord {
            estimated_states: w.noisy_state(newest, l.ncp),
            real_states: self.real_states.clone(),
            estimated_outputs: w.predicted_output(newest),
            real_outputs: self.real_outputs.clone(),
            patched_measurements: w.measurement(newest).clone(),
            measurement_noise: self.injected_noise.clone(),
            measurement_offsets: offsets.measurement.clone(),
            input_offsets: offsets.input.clone(),
            input_noise,
        };
        journal.record(&record)
    }
}

impl<F, S> Estimator for MovingHorizonEstimator<F, S>
where
    F: ModelFactory,
    S: NlpSolver + SensitivitySolver,
{
    fn state(&self) -> Result<DVector<f64>> {
        Ok(self.current_estimate())
    }
}
