mod process_models;

use approx::assert_relative_eq;
use nalgebra::DVector;

use horizon_estimate::models::{ModelFactory, SubIndex};
use horizon_estimate::window::{Phase, Selection, Window, WindowOptions};

use process_models::*;

fn cart_window(nfe: usize) -> Window<Cart> {
    let selection = Selection::new()
        .noisy("p", vec![SubIndex::scalar()])
        .measured("pm", vec![SubIndex::scalar()]);
    let options = WindowOptions {
        horizon_length: nfe as f64,
        ..WindowOptions::default()
    };
    Window::build(nfe, 2, &CartFactory, &selection, options).unwrap()
}

fn mark_stages(window: &mut Window<Cart>) {
    let nfe = window.layout().nfe;
    for stage in 0..nfe {
        for sub in 0..=2 {
            let x = DVector::from_vec(vec![stage as f64 + 0.1 * sub as f64, -(stage as f64)]);
            window.set_state(stage, sub, &x).unwrap();
        }
        window.set_measurement_noise(stage, &scalar(stage as f64)).unwrap();
        window.patch_measurement(stage, &scalar(10. + stage as f64)).unwrap();
        window.patch_input(stage, &scalar(100. + stage as f64)).unwrap();
        if stage + 1 < nfe {
            window.set_disturbance(stage, &scalar(0.01 * stage as f64)).unwrap();
        }
    }
}

#[test]
fn shift_moves_stages_back() {
    let mut window = cart_window(4);
    mark_stages(&mut window);
    window.shift();

    for stage in 0..3 {
        assert_eq!(window.state(stage, 1)[0], stage as f64 + 1.1);
        assert_eq!(window.measurement_noise(stage)[0], stage as f64 + 1.);
    }
    assert_eq!(window.disturbance(0)[0], 0.01);
    assert_eq!(window.disturbance(1)[0], 0.02);
    // newest stage keeps its values until re-initialized
    assert_eq!(window.state(3, 1)[0], 3.1);
    // parameters are shifted separately
    assert_eq!(window.measurement(0)[0], 10.);
}

#[test]
fn shift_of_identical_stages_is_identity() {
    let mut window = cart_window(3);
    window.fill_states(&DVector::from_vec(vec![2., 0.5])).unwrap();
    for stage in 0..3 {
        window.set_measurement_noise(stage, &scalar(0.25)).unwrap();
    }
    window.shift();
    for stage in 0..3 {
        for sub in 0..=2 {
            assert_eq!(window.state(stage, sub), &DVector::from_vec(vec![2., 0.5]));
        }
        assert_eq!(window.measurement_noise(stage)[0], 0.25);
    }
}

#[test]
fn history_shift_recomputes_measurement_noise() {
    let mut window = cart_window(3);
    mark_stages(&mut window);
    window.shift();
    window.shift_measurement_input_history();

    assert_eq!(window.measurement(0)[0], 11.);
    assert_eq!(window.measurement(1)[0], 12.);
    assert_eq!(window.held_input(0)[0], 101.);
    assert_eq!(window.held_input(2)[0], 102.);
    for stage in 0..3 {
        let expected = window.measurement(stage)[0] - window.state(stage, 2)[0];
        assert_relative_eq!(window.measurement_noise(stage)[0], expected);
    }
}

#[test]
fn reinitialize_simulates_newest_stage() {
    let mut window = cart_window(3);
    let simulator = CartFactory.build(1, 2, 1.).unwrap();
    window.fill_states(&DVector::from_vec(vec![1., 2.])).unwrap();
    window.set_disturbance(1, &scalar(0.5)).unwrap();
    window.patch_input(2, &scalar(4.)).unwrap();

    assert!(window.reinitialize_last_stage(&simulator));
    // sub-step 0.5, start p = 1 + 0.5 from the disturbance
    assert_relative_eq!(window.state(2, 0)[0], 1.5);
    assert_relative_eq!(window.state(2, 1)[0], 2.5);
    assert_relative_eq!(window.state(2, 1)[1], 4.);
    assert_relative_eq!(window.state(2, 2)[0], 4.5);
    assert_relative_eq!(window.state(2, 2)[1], 6.);
    // older stages untouched
    assert_eq!(window.state(1, 2), &DVector::from_vec(vec![1., 2.]));
}

#[test]
fn failed_reinitialize_keeps_guess() {
    let selection = Selection::new()
        .noisy("h", vec![SubIndex::scalar()])
        .measured("hm", vec![SubIndex::scalar()]);
    let mut window = Window::build(3, 1, &TankFactory, &selection, WindowOptions::default()).unwrap();
    let simulator = TankFactory.build(1, 1, 1.).unwrap();
    window.fill_states(&scalar(1.)).unwrap();
    window.set_state(1, 1, &scalar(-4.)).unwrap();

    assert!(!window.reinitialize_last_stage(&simulator));
    assert_eq!(window.state(2, 0), &scalar(1.));
    assert_eq!(window.state(2, 1), &scalar(1.));
}

#[test]
fn disturbance_guess_closes_continuity_gaps() {
    let mut window = cart_window(3);
    mark_stages(&mut window);
    window.adjust_disturbance_guess();
    // x[i+1][0] - x[i][ncp] for p
    assert_relative_eq!(window.disturbance(0)[0], 1. - 0.2);
    assert_relative_eq!(window.disturbance(1)[0], 2. - 1.2);
}

#[test]
fn shift_in_filtering_keeps_phase() {
    let mut window = cart_window(3);
    window.set_phase(Phase::Filtering).unwrap();
    window.shift();
    window.shift_measurement_input_history();
    assert_eq!(window.phase(), Phase::Filtering);
}
