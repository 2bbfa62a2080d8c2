#![allow(non_snake_case)]

//! The window estimation problem as an [`NlpProblem`].
//!
//! Decision variables, in order:
//!  - `x[i][j]` for all stages and sub-points,
//!  - `w[i]` when process noise is active,
//!  - `nu[i]` in the FILTERING phase,
//!  - `wu[i]` when input noise is active.
//! Values that are not decision variables stay fixed at their window values.
//!
//! Constraint rows, in order:
//!  - sub-step transitions `x[i][j+1] - f(x[i][j], u[i] - wu[i])`,
//!  - stage continuity `x[i+1][0] - x[i][ncp] - E w[i]`,
//!  - initial conditions `x[0][0][s] - ic[s]` of states that are not noisy,
//!  - measurement residuals `y0[i] - h(x[i][ncp], u[i] - wu[i]) - nu[i]` in the FILTERING phase.

use nalgebra::{DMatrix, DVector};

use crate::models::ProcessModel;
use crate::solver::NlpProblem;
use crate::window::{Phase, Window};

/// Position of the window values in the decision vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarLayout {
    nfe: usize,
    ncp: usize,
    nx: usize,
    K: usize,
    M: usize,
    P: usize,
    w: Option<usize>,
    nu: Option<usize>,
    wu: Option<usize>,
    n: usize,
}

impl VarLayout {
    pub fn for_window<M: ProcessModel>(window: &Window<M>) -> VarLayout {
        let l = window.layout();
        let mut n = l.nfe * (l.ncp + 1) * l.nx;
        let mut take = |active: bool, len: usize| {
            if active {
                let offset = n;
                n += len;
                Some(offset)
            } else {
                None
            }
        };
        let w = take(window.process_noise_active(), (l.nfe - 1) * l.K);
        let nu = take(window.phase() == Phase::Filtering, l.nfe * l.M);
        let wu = take(window.input_noise_active(), l.nfe * l.nin);
        VarLayout {
            nfe: l.nfe,
            ncp: l.ncp,
            nx: l.nx,
            K: l.K,
            M: l.M,
            P: l.nin,
            w,
            nu,
            wu,
            n,
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Variable of model state `pos` at stage sub-point.
    pub fn x(&self, stage: usize, sub: usize, pos: usize) -> usize {
        (stage * (self.ncp + 1) + sub) * self.nx + pos
    }

    pub fn w_offset(&self) -> Option<usize> {
        self.w
    }

    pub fn nu_offset(&self) -> Option<usize> {
        self.nu
    }

    pub fn wu_offset(&self) -> Option<usize> {
        self.wu
    }

    /// Decision vector from the window values.
    pub fn pack<M: ProcessModel>(&self, window: &Window<M>) -> DVector<f64> {
        let mut v = DVector::zeros(self.n);
        for stage in 0..self.nfe {
            for sub in 0..=self.ncp {
                let o = self.x(stage, sub, 0);
                v.rows_mut(o, self.nx).copy_from(&window.x[stage][sub]);
            }
        }
        if let Some(o) = self.w {
            for (stage, w) in window.w.iter().enumerate() {
                v.rows_mut(o + stage * self.K, self.K).copy_from(w);
            }
        }
        if let Some(o) = self.nu {
            for (stage, nu) in window.nu.iter().enumerate() {
                v.rows_mut(o + stage * self.M, self.M).copy_from(nu);
            }
        }
        if let Some(o) = self.wu {
            for (stage, wu) in window.wu.iter().enumerate() {
                v.rows_mut(o + stage * self.P, self.P).copy_from(wu);
            }
        }
        v
    }

    /// Writes a decision vector back into the window.
    pub fn unpack<M: ProcessModel>(&self, window: &mut Window<M>, v: &DVector<f64>) {
        for stage in 0..self.nfe {
            for sub in 0..=self.ncp {
                let o = self.x(stage, sub, 0);
                window.x[stage][sub].copy_from(&v.rows(o, self.nx));
            }
        }
        if let Some(o) = self.w {
            for (stage, w) in window.w.iter_mut().enumerate() {
                w.copy_from(&v.rows(o + stage * self.K, self.K));
            }
        }
        if let Some(o) = self.nu {
            for (stage, nu) in window.nu.iter_mut().enumerate() {
                nu.copy_from(&v.rows(o + stage * self.M, self.M));
            }
        }
        if let Some(o) = self.wu {
            for (stage, wu) in window.wu.iter_mut().enumerate() {
                wu.copy_from(&v.rows(o + stage * self.P, self.P));
            }
        }
    }
}

/// The estimation problem of a window in its current phase.
pub struct WindowProblem<'a, M: ProcessModel> {
    window: &'a Window<M>,
    vars: VarLayout,
    H: DMatrix<f64>,
    g: DVector<f64>,
    lower: DVector<f64>,
    upper: DVector<f64>,
    /// Model state positions with a hard initial condition
    fixed_states: Vec<usize>,
    continuity_base: usize,
    ic_base: usize,
    measurement_base: Option<usize>,
    m: usize,
}

impl<'a, M: ProcessModel> WindowProblem<'a, M> {
    pub fn new(window: &'a Window<M>) -> WindowProblem<'a, M> {
        let vars = VarLayout::for_window(window);
        let (H, g) = window.quadratic_model(&vars);
        let l = window.layout();

        let mut lower = DVector::from_element(vars.len(), f64::NEG_INFINITY);
        let mut upper = DVector::from_element(vars.len(), f64::INFINITY);
        for stage in 0..l.nfe {
            for sub in 0..=l.ncp {
                for (pos, b) in window.state_bounds.iter().enumerate() {
                    let i = vars.x(stage, sub, pos);
                    lower[i] = b.lower_value();
                    upper[i] = b.upper_value();
                }
            }
        }

        let fixed_states: Vec<usize> = (0..l.nx).filter(|p| window.slot_of_state[*p].is_none()).collect();
        let continuity_base = l.nfe * l.ncp * l.nx;
        let ic_base = continuity_base + (l.nfe - 1) * l.nx;
        let mut m = ic_base + fixed_states.len();
        let measurement_base = if window.phase() == Phase::Filtering {
            let base = m;
            m += l.nfe * l.M;
            Some(base)
        } else {
            None
        };

        WindowProblem {
            window,
            vars,
            H,
            g,
            lower,
            upper,
            fixed_states,
            continuity_base,
            ic_base,
            measurement_base,
            m,
        }
    }

    pub fn vars(&self) -> &VarLayout {
        &self.vars
    }

    /// Decision vector of the current window values.
    pub fn start(&self) -> DVector<f64> {
        self.vars.pack(self.window)
    }

    /// Constraint row of a measurement residual.
    pub fn measurement_row(&self, stage: usize, m: usize) -> Option<usize> {
        self.measurement_base.map(|base| base + stage * self.window.layout.M + m)
    }

    /// Variables of the noisy states at the prior stage, by slot.
    pub fn prior_stage_variables(&self) -> Vec<usize> {
        self.window.noisy_pos.iter().map(|p| self.vars.x(1, 0, *p)).collect()
    }

    /// Right hand side perturbation of a measurement change `dy` at a stage.
    pub fn measurement_perturbation(&self, stage: usize, dy: &DVector<f64>) -> DVector<f64> {
        let mut p = DVector::zeros(self.m);
        for (m, d) in dy.iter().enumerate() {
            if let Some(row) = self.measurement_row(stage, m) {
                p[row] += d;
            }
        }
        p
    }

    /// Right hand side perturbation of a held input change `du` at a stage, linearised at `v`.
    pub fn input_perturbation(&self, v: &DVector<f64>, stage: usize, du: &DVector<f64>) -> DVector<f64> {
        let l = self.window.layout;
        let mut p = DVector::zeros(self.m);
        let ue = self.driven_input(v, stage);
        for sub in 0..l.ncp {
            let (_, Fu) = self.window.model.step_jacobian(&self.state(v, stage, sub), &ue);
            let dc = -(Fu * du);
            let row = (stage * l.ncp + sub) * l.nx;
            let mut block = p.rows_mut(row, l.nx);
            block += dc;
        }
        if self.measurement_base.is_some() {
            let (_, Hu) = self.window.model.output_jacobian(&self.state(v, stage, l.ncp), &ue);
            let dh = Hu * du;
            for (m, pos) in self.window.measured_pos.iter().enumerate() {
                if let Some(row) = self.measurement_row(stage, m) {
                    p[row] -= dh[*pos];
                }
            }
        }
        p
    }

    fn state(&self, v: &DVector<f64>, stage: usize, sub: usize) -> DVector<f64> {
        v.rows(self.vars.x(stage, sub, 0), self.window.layout.nx).into_owned()
    }

    fn input_noise(&self, v: &DVector<f64>, stage: usize) -> DVector<f64> {
        let P = self.window.layout.nin;
        match self.vars.wu {
            Some(o) => v.rows(o + stage * P, P).into_owned(),
            None => self.window.wu[stage].clone(),
        }
    }

    fn driven_input(&self, v: &DVector<f64>, stage: usize) -> DVector<f64> {
        &self.window.u[stage] - self.input_noise(v, stage)
    }

    fn measurement_noise(&self, v: &DVector<f64>, stage: usize) -> DVector<f64> {
        let M = self.window.layout.M;
        match self.vars.nu {
            Some(o) => v.rows(o + stage * M, M).into_owned(),
            None => self.window.nu[stage].clone(),
        }
    }
}

impl<'a, M: ProcessModel> NlpProblem for WindowProblem<'a, M> {
    fn num_variables(&self) -> usize {
        self.vars.len()
    }

    fn num_constraints(&self) -> usize {
        self.m
    }

    fn hessian(&self) -> &DMatrix<f64> {
        &self.H
    }

    fn linear_term(&self) -> &DVector<f64> {
        &self.g
    }

    fn constraints(&self, v: &DVector<f64>) -> DVector<f64> {
        let l = self.window.layout;
        let nx = l.nx;
        let mut c = DVector::zeros(self.m);

        for stage in 0..l.nfe {
            let ue = self.driven_input(v, stage);
            for sub in 0..l.ncp {
                let next = self.state(v, stage, sub + 1) - self.window.model.step(&self.state(v, stage, sub), &ue);
                c.rows_mut((stage * l.ncp + sub) * nx, nx).copy_from(&next);
            }
        }

        for stage in 0..l.nfe - 1 {
            let mut gap = self.state(v, stage + 1, 0) - self.state(v, stage, l.ncp);
            if let Some(o) = self.vars.w {
                for (k, pos) in self.window.noisy_pos.iter().enumerate() {
                    gap[*pos] -= v[o + stage * l.K + k];
                }
            }
            c.rows_mut(self.continuity_base + stage * nx, nx).copy_from(&gap);
        }

        for (r, pos) in self.fixed_states.iter().enumerate() {
            c[self.ic_base + r] = v[self.vars.x(0, 0, *pos)] - self.window.ic[*pos];
        }

        if let Some(base) = self.measurement_base {
            for stage in 0..l.nfe {
                let ue = self.driven_input(v, stage);
                let h = self.window.model.output(&self.state(v, stage, l.ncp), &ue);
                let nu = self.measurement_noise(v, stage);
                for (m, pos) in self.window.measured_pos.iter().enumerate() {
                    c[base + stage * l.M + m] = self.window.y0[stage][m] - h[*pos] - nu[m];
                }
            }
        }
        c
    }

    fn constraint_jacobian(&self, v: &DVector<f64>) -> DMatrix<f64> {
        let l = self.window.layout;
        let nx = l.nx;
        let mut A = DMatrix::zeros(self.m, self.vars.len());

        for stage in 0..l.nfe {
            let ue = self.driven_input(v, stage);
            for sub in 0..l.ncp {
                let row = (stage * l.ncp + sub) * nx;
                let (Fx, Fu) = self.window.model.step_jacobian(&self.state(v, stage, sub), &ue);
                let xn = self.vars.x(stage, sub + 1, 0);
                let xc = self.vars.x(stage, sub, 0);
                for r in 0..nx {
                    A[(row + r, xn + r)] += 1.;
                    for s in 0..nx {
                        A[(row + r, xc + s)] -= Fx[(r, s)];
                    }
                }
                if let Some(o) = self.vars.wu {
                    let P = l.nin;
                    let mut block = A.slice_mut((row, o + stage * P), (nx, P));
                    block += Fu;
                }
            }
        }

        for stage in 0..l.nfe - 1 {
            let row = self.continuity_base + stage * nx;
            let xn = self.vars.x(stage + 1, 0, 0);
            let xe = self.vars.x(stage, l.ncp, 0);
            for r in 0..nx {
                A[(row + r, xn + r)] = 1.;
                A[(row + r, xe + r)] = -1.;
            }
            if let Some(o) = self.vars.w {
                for (k, pos) in self.window.noisy_pos.iter().enumerate() {
                    A[(row + pos, o + stage * l.K + k)] = -1.;
                }
            }
        }

        for (r, pos) in self.fixed_states.iter().enumerate() {
            A[(self.ic_base + r, self.vars.x(0, 0, *pos))] = 1.;
        }

        if let Some(base) = self.measurement_base {
            for stage in 0..l.nfe {
                let ue = self.driven_input(v, stage);
                let (Hx, Hu) = self.window.model.output_jacobian(&self.state(v, stage, l.ncp), &ue);
                let xe = self.vars.x(stage, l.ncp, 0);
                for (m, pos) in self.window.measured_pos.iter().enumerate() {
                    let row = base + stage * l.M + m;
                    for s in 0..nx {
                        A[(row, xe + s)] = -Hx[(*pos, s)];
                    }
                    if let Some(o) = self.vars.nu {
                        A[(row, o + stage * l.M + m)] = -1.;
                    }
                    if let Some(o) = self.vars.wu {
                        for p in 0..l.nin {
                            A[(row, o + stage * l.nin + p)] = Hu[(*pos, p)];
                        }
                    }
                }
            }
        }
        A
    }

    fn lower_bounds(&self) -> &DVector<f64> {
        &self.lower
    }

    fn upper_bounds(&self) -> &DVector<f64> {
        &self.upper
    }
}
