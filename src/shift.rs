//! Horizon shift and re-initialization.
//!
//! Moves the window one stage forward in time. Stage `i` takes the values of stage `i+1`, the
//! newest stage keeps its values until it is re-initialized by forward simulation.

use log::{debug, warn};
use nalgebra::DVector;

use crate::models::ProcessModel;
use crate::window::Window;

fn shift_stages<T: Clone>(stages: &mut [T]) {
    if stages.len() > 1 {
        stages.rotate_left(1);
        let n = stages.len();
        stages[n - 1] = stages[n - 2].clone();
    }
}

impl<M: ProcessModel> Window<M> {
    /// Shifts every stage indexed decision value one stage back.
    pub fn shift(&mut self) {
        shift_stages(&mut self.x);
        shift_stages(&mut self.w);
        shift_stages(&mut self.nu);
        shift_stages(&mut self.wu);
        debug!("window shifted");
    }

    /// Shifts the patched measurements and held inputs, then recomputes the measurement noise
    /// guesses as `y0 - h(x)` on every stage.
    pub fn shift_measurement_input_history(&mut self) {
        shift_stages(&mut self.y0);
        shift_stages(&mut self.u);
        for stage in 0..self.layout.nfe {
            self.nu[stage] = &self.y0[stage] - self.predicted_output(stage);
        }
    }

    /// Forward simulates the newest stage from the end of the stage before it.
    ///
    /// `simulator` is a one stage model of the same discretisation. A simulation that does not
    /// stay finite leaves the old guess in place and returns false.
    pub fn reinitialize_last_stage<S: ProcessModel>(&mut self, simulator: &S) -> bool {
        let nfe = self.layout.nfe;
        let start = self.stage_start(nfe - 1);
        if self.simulate_stage(nfe - 1, start, simulator) {
            true
        } else {
            warn!("re-initialization of the newest stage failed, previous guess kept");
            false
        }
    }

    /// Forward simulates every stage from the state at stage 0 sub-point 0.
    pub fn simulate_window<S: ProcessModel>(&mut self, simulator: &S) -> bool {
        let mut start = self.x[0][0].clone();
        for stage in 0..self.layout.nfe {
            if stage > 0 {
                start = self.stage_start(stage);
            }
            if !self.simulate_stage(stage, start.clone(), simulator) {
                warn!("simulation of stage {} failed, previous guess kept", stage);
                return false;
            }
        }
        true
    }

    /// End of the previous stage plus the process noise guess.
    fn stage_start(&self, stage: usize) -> DVector<f64> {
        let mut xs = self.x[stage - 1][self.layout.ncp].clone();
        for (k, pos) in self.noisy_pos.iter().enumerate() {
            xs[*pos] += self.w[stage - 1][k];
        }
        xs
    }

    fn simulate_stage<S: ProcessModel>(&mut self, stage: usize, start: DVector<f64>, simulator: &S) -> bool {
        let ue = self.driven_input(stage);
        let mut trajectory = Vec::with_capacity(self.layout.ncp + 1);
        trajectory.push(start);
        for sub in 0..self.layout.ncp {
            let next = simulator.step(&trajectory[sub], &ue);
            trajectory.push(next);
        }
        if trajectory.iter().any(|x| x.iter().any(|v| !v.is_finite())) {
            return false;
        }
        self.x[stage] = trajectory;
        true
    }

    /// Sets the process noise guesses from the stage continuity gaps.
    pub fn adjust_disturbance_guess(&mut self) {
        let ncp = self.layout.ncp;
        for stage in 0..self.layout.nfe - 1 {
            for (k, pos) in self.noisy_pos.iter().enumerate() {
                self.w[stage][k] = self.x[stage + 1][0][*pos] - self.x[stage][ncp][*pos];
            }
        }
    }
}
