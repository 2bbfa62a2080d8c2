//! Estimation cycles of the moving horizon estimator.
//!
//! A unit variance random walk observed with unit variance noise is solved in closed form by the
//! Kalman filter, which the first filtering window must reproduce. With a constant measurement
//! the arrival weight settles and the estimate converges to the measurement.

#![allow(non_snake_case)]

mod process_models;

use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use rand::rngs::StdRng;
use rand::SeedableRng;

use horizon_estimate::models::{Estimator, ModelFactory, ProcessModel, SubIndex};
use horizon_estimate::solver::{KktSolver, NlpSolver, SensitivitySolver, SolveStatus};
use horizon_estimate::window::{Phase, Selection, WindowOptions};
use horizon_estimate::{EstimateError, MovingHorizonEstimator};

use process_models::*;

fn walk_selection() -> Selection {
    Selection::new()
        .noisy("x", vec![SubIndex::scalar()])
        .measured("y", vec![SubIndex::scalar()])
}

fn random_walk_mhe<S: NlpSolver + SensitivitySolver>(solver: S) -> MovingHorizonEstimator<RandomWalkFactory, S> {
    let options = WindowOptions {
        horizon_length: 5.,
        ..WindowOptions::default()
    };
    let mut mhe = MovingHorizonEstimator::new(&RandomWalkFactory, 5, 1, &walk_selection(), options, solver).unwrap();
    mhe.initialize(&scalar(0.)).unwrap();
    mhe
}

fn prepared(ys: &[f64]) -> MovingHorizonEstimator<RandomWalkFactory, KktSolver> {
    let mut mhe = random_walk_mhe(KktSolver::new());
    let measurements: Vec<DVector<f64>> = ys.iter().map(|y| scalar(*y)).collect();
    mhe.prepare(&measurements, &vec![no_input(); 4]).unwrap();
    mhe
}

#[test]
fn preparation_switches_to_filtering() {
    let mut mhe = random_walk_mhe(KktSolver::new());
    assert_eq!(mhe.window().phase(), Phase::Preparation);
    let report = mhe.prepare(&vec![scalar(10.); 4], &vec![no_input(); 4]).unwrap();
    assert_eq!(report.status, SolveStatus::Optimal);
    assert_eq!(mhe.window().phase(), Phase::Filtering);
    // anchored to the initial guess, the measurement noise takes the residual
    assert_relative_eq!(mhe.current_estimate()[0], 0., epsilon = 1e-6);
    assert_relative_eq!(mhe.window().measurement_noise(2)[0], 10., epsilon = 1e-6);
    assert_eq!(mhe.cycles(), 0);
}

#[test]
fn first_window_is_the_kalman_filter() {
    let ys = [1., 3., 2., 5., 4.];
    let mut mhe = prepared(&[1., 3., 2., 5.]);
    let report = mhe.step(&scalar(4.), &no_input()).unwrap();
    assert_eq!(report.solve.status, SolveStatus::Optimal);
    assert!(!report.retried);
    assert_relative_eq!(mhe.current_estimate()[0], random_walk_filter(&ys), epsilon = 1e-7);
    assert_relative_eq!(random_walk_filter(&[10.; 5]), 9.887640449438202, epsilon = 1e-12);
}

#[test]
fn constant_measurement_converges() {
    let mut mhe = prepared(&[10.; 4]);
    let y = scalar(10.);

    mhe.step(&y, &no_input()).unwrap();
    assert_relative_eq!(mhe.current_estimate()[0], 9.887640449438202, epsilon = 1e-7);
    assert_relative_eq!(mhe.window().prior().Pi[(0, 0)], 2.282051, epsilon = 1e-5);

    mhe.step(&y, &no_input()).unwrap();
    assert_relative_eq!(mhe.current_estimate()[0], 9.974859795011, epsilon = 1e-6);

    let mut last_error = f64::INFINITY;
    for _ in 0..28 {
        let report = mhe.step(&y, &no_input()).unwrap();
        assert_eq!(report.solve.status, SolveStatus::Optimal);
        let error = (10. - mhe.current_estimate()[0]).abs();
        assert!(error <= last_error + 1e-9);
        last_error = error;
    }
    assert_eq!(mhe.cycles(), 30);
    assert!(last_error < 1e-6);
    assert_relative_eq!(mhe.window().prior().Pi[(0, 0)], 2.387462, epsilon = 1e-5);
    assert_relative_eq!(mhe.state().unwrap()[0], 10., epsilon = 1e-6);
}

#[test]
fn cycle_report_offsets() {
    let mut mhe = prepared(&[10.; 4]);
    let report = mhe.step(&scalar(10.), &no_input()).unwrap();
    // y0 - h at the newest stage is the fitted measurement noise
    assert_relative_eq!(
        report.offsets.measurement[0],
        10. - mhe.current_estimate()[0],
        epsilon = 1e-9
    );
    assert_eq!(report.offsets.input.len(), 0);
    assert_relative_eq!(mhe.state_offset()[0], mhe.current_estimate()[0], epsilon = 1e-9);
}

#[test]
fn first_step_completes_prepared_window() {
    let mut mhe = prepared(&[1., 2., 3., 4.]);
    // the newest stage holds the last sample until the first step
    assert_eq!(mhe.window().measurement(3), &scalar(4.));
    assert_eq!(mhe.window().measurement(4), &scalar(4.));

    mhe.step(&scalar(5.), &no_input()).unwrap();
    for stage in 0..5 {
        assert_eq!(mhe.window().measurement(stage), &scalar(stage as f64 + 1.));
    }
    mhe.step(&scalar(6.), &no_input()).unwrap();
    for stage in 0..5 {
        assert_eq!(mhe.window().measurement(stage), &scalar(stage as f64 + 2.));
    }
}

#[test]
fn known_plant_is_tracked_exactly() {
    // exact measurements of a driven cart, the velocity carries no noise
    let selection = Selection::new()
        .noisy("p", vec![SubIndex::scalar()])
        .measured("pm", vec![SubIndex::scalar()]);
    let options = WindowOptions {
        horizon_length: 5.,
        ..WindowOptions::default()
    };
    let mut mhe = MovingHorizonEstimator::new(&CartFactory, 5, 2, &selection, options, KktSolver::new()).unwrap();
    let plant = CartFactory.build(1, 2, 1.).unwrap();
    let f = scalar(0.2);
    let mut truth = DVector::from_vec(vec![0., 1.]);
    mhe.initialize(&truth).unwrap();

    let advance = |x: &mut DVector<f64>| {
        for _ in 0..2 {
            *x = plant.step(x, &f);
        }
    };
    let mut history = Vec::new();
    for _ in 0..4 {
        advance(&mut truth);
        history.push(scalar(truth[0]));
    }
    mhe.prepare(&history, &vec![f.clone(); 4]).unwrap();

    for _ in 0..6 {
        advance(&mut truth);
        mhe.step(&scalar(truth[0]), &f).unwrap();
        let estimate = mhe.current_estimate();
        assert_relative_eq!(estimate, truth, epsilon = 1e-6);
    }
}

#[test]
fn zero_variance_rejected_before_solving() {
    let mut mhe = random_walk_mhe(KktSolver::new());
    match mhe.set_measurement_variances(&scalar(0.)) {
        Err(EstimateError::ZeroVarianceConfig { channel }) => assert_eq!(channel, "y"),
        other => panic!("expected ZeroVarianceConfig, got {:?}", other),
    }
    assert!(mhe.set_process_variances(&DVector::from_vec(vec![1., 1.])).is_err());
    assert!(mhe
        .set_measurement_covariance(&DMatrix::from_element(1, 1, -1.))
        .is_err());
}

#[test]
fn input_variance_errors_name_the_input() {
    let selection = Selection::new()
        .noisy("p", vec![SubIndex::scalar()])
        .measured("pm", vec![SubIndex::scalar()]);
    let mut mhe =
        MovingHorizonEstimator::new(&CartFactory, 3, 1, &selection, WindowOptions::default(), KktSolver::new()).unwrap();
    match mhe.set_input_variances(&scalar(0.)) {
        Err(EstimateError::ZeroVarianceConfig { channel }) => assert_eq!(channel, "f"),
        other => panic!("expected ZeroVarianceConfig, got {:?}", other),
    }
    assert!(mhe.set_input_variances(&scalar(0.5)).is_ok());
}

#[test]
fn variances_set_the_weights() {
    // a tight measurement makes the newest estimate follow the measurement
    let mut mhe = random_walk_mhe(KktSolver::new());
    mhe.set_measurement_variances(&scalar(1e-6)).unwrap();
    mhe.prepare(&vec![scalar(10.); 4], &vec![no_input(); 4]).unwrap();
    mhe.step(&scalar(10.), &no_input()).unwrap();
    assert_relative_eq!(mhe.current_estimate()[0], 10., epsilon = 1e-4);
}

#[test]
fn failed_solve_is_retried() {
    let mut mhe = random_walk_mhe(FlakySolver::new(0));
    mhe.prepare(&vec![scalar(10.); 4], &vec![no_input(); 4]).unwrap();
    mhe.solver_mut().failures = 1;
    let report = mhe.step(&scalar(10.), &no_input()).unwrap();
    assert!(report.retried);
    assert_eq!(report.solve.status, SolveStatus::Optimal);
    assert_eq!(mhe.solver().solves, 3);
    assert_relative_eq!(mhe.current_estimate()[0], 9.887640449438202, epsilon = 1e-7);
}

#[test]
fn second_failure_aborts_the_cycle() {
    let mut mhe = random_walk_mhe(FlakySolver::new(0));
    mhe.prepare(&vec![scalar(10.); 4], &vec![no_input(); 4]).unwrap();
    mhe.solver_mut().failures = 2;
    mhe.solver_mut().status = SolveStatus::IterationLimit;
    match mhe.step(&scalar(10.), &no_input()) {
        Err(EstimateError::SolverFailure { status, retried }) => {
            assert_eq!(status, SolveStatus::IterationLimit);
            assert!(retried);
        }
        Err(e) => panic!("expected SolverFailure, got {}", e),
        Ok(_) => panic!("expected SolverFailure"),
    }
    assert_eq!(mhe.cycles(), 0);
}

#[test]
fn step_requires_preparation() {
    let mut mhe = random_walk_mhe(KktSolver::new());
    assert!(matches!(
        mhe.step(&scalar(1.), &no_input()),
        Err(EstimateError::InvalidPhaseTransition { .. })
    ));
    mhe.prepare(&vec![scalar(1.); 4], &vec![no_input(); 4]).unwrap();
    assert!(mhe.prepare(&vec![scalar(1.); 4], &vec![no_input(); 4]).is_err());
    assert!(matches!(
        mhe.step(&DVector::zeros(2), &no_input()),
        Err(EstimateError::DimensionMismatch { .. })
    ));
}

#[test]
fn prepare_checks_history_length() {
    let mut mhe = random_walk_mhe(KktSolver::new());
    assert!(matches!(
        mhe.prepare(&vec![scalar(1.); 5], &vec![no_input(); 4]),
        Err(EstimateError::DimensionMismatch { expected: 4, found: 5, .. })
    ));
}

#[test]
fn seeded_measurement_noise_is_reproducible() {
    let run = |seed: u64| {
        let mut mhe = prepared(&[10.; 4]);
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..3 {
            mhe.step_with_noise(&scalar(10.), &no_input(), &scalar(0.01), &mut rng)
                .unwrap();
        }
        mhe.current_estimate()[0]
    };
    assert_eq!(run(3), run(3));
    assert_ne!(run(3), run(4));
}

#[test]
fn advanced_step_matches_resolve() {
    // linear model: the sensitivity step is exact
    let mut predicted = prepared(&[10.; 4]);
    predicted.set_advanced_step(true);
    predicted.step(&scalar(10.), &no_input()).unwrap();
    predicted.step(&scalar(10.), &no_input()).unwrap();
    let before = predicted.current_estimate()[0];
    let offset = predicted.advanced_step_correction(&scalar(11.), &no_input()).unwrap();

    let mut resolved = prepared(&[10.; 4]);
    resolved.step(&scalar(10.), &no_input()).unwrap();
    resolved.step(&scalar(11.), &no_input()).unwrap();

    assert_relative_eq!(predicted.current_estimate()[0], resolved.current_estimate()[0], epsilon = 1e-6);
    assert_relative_eq!(offset[0], resolved.current_estimate()[0] - before, epsilon = 1e-6);
    assert_eq!(predicted.window().measurement(4), &scalar(11.));
    assert_eq!(predicted.state_offset(), &offset);
}

#[test]
fn advanced_step_disabled_gives_no_offset() {
    let mut mhe = prepared(&[10.; 4]);
    mhe.step(&scalar(10.), &no_input()).unwrap();
    let before = mhe.current_estimate();
    let offset = mhe.advanced_step_correction(&scalar(11.), &no_input()).unwrap();
    assert_eq!(offset, scalar(0.));
    assert_eq!(mhe.current_estimate(), before);
}
