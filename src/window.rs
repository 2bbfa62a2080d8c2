#![allow(non_snake_case)]

//! Horizon window.
//!
//! The N stage estimation problem. Each stage is subdivided into `ncp` integration sub-steps and
//! carries the model state at sub-points `0..=ncp`. Stage 0 is anchored by the arrival cost, stage
//! `nfe-1` is the newest stage and stage 1 sub-point 0 is the prior stage summarised into the
//! next arrival cost.
//!
//! Per stage decision values:
//!  - `x[i][j]` model states at sub-point `j`,
//!  - `w[i]` process noise on the noisy states, stages `0..nfe-1`, entering continuity from stage `i` to `i+1`,
//!  - `nu[i]` measurement noise on the measured outputs,
//!  - `wu[i]` input noise, the model is driven by `u[i] - wu[i]`.
//! Per stage parameters are the held inputs `u[i]` and the patched measurements `y0[i]`.

use log::info;
use nalgebra::{DMatrix, DVector};

use crate::error::{check_len, EstimateError, Result};
use crate::models::{flat_offset, Bounds, ModelFactory, PriorState, ProcessModel, SubIndex, VariableDecl};
use crate::noise::{Weight, WeightMode};
use crate::registry::{Registry, Slot};

/// Estimator phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Window under construction, no objective.
    ColdStart,
    /// Bootstrap problem anchored to the initial guess.
    Preparation,
    /// Arrival cost estimation.
    Filtering,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::ColdStart => "COLD_START",
            Phase::Preparation => "PREPARATION",
            Phase::Filtering => "FILTERING",
        }
    }
}

/// Selection of noisy states and measured outputs by name and sub-index.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Selection {
    pub noisy_states: Vec<(String, Vec<SubIndex>)>,
    pub measurements: Vec<(String, Vec<SubIndex>)>,
}

impl Selection {
    pub fn new() -> Selection {
        Selection::default()
    }

    pub fn noisy(mut self, name: &str, indices: Vec<SubIndex>) -> Selection {
        self.noisy_states.push((name.to_string(), indices));
        self
    }

    pub fn measured(mut self, name: &str, indices: Vec<SubIndex>) -> Selection {
        self.measurements.push((name.to_string(), indices));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowOptions {
    /// Time spanned by all stages.
    pub horizon_length: f64,
    /// Process noise fixed at zero.
    pub ignore_process_noise: bool,
    /// Input noise estimated.
    pub estimate_input_noise: bool,
    pub weight_mode: WeightMode,
}

impl Default for WindowOptions {
    fn default() -> Self {
        WindowOptions {
            horizon_length: 1.,
            ignore_process_noise: false,
            estimate_input_noise: false,
            weight_mode: WeightMode::Diagonal,
        }
    }
}

/// Window dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Number of stages
    pub nfe: usize,
    /// Sub-steps per stage
    pub ncp: usize,
    /// Model states
    pub nx: usize,
    /// Model inputs
    pub nin: usize,
    /// Noisy states
    pub K: usize,
    /// Measured outputs
    pub M: usize,
}

/// Exclusion bitset keyed by noisy state slot.
///
/// A set bit means the slot participates in the arrival cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exclusion {
    bits: Vec<u64>,
    len: usize,
}

impl Exclusion {
    /// All slots participate.
    pub fn all_in(len: usize) -> Exclusion {
        let mut e = Exclusion::all_out(len);
        for slot in 0..len {
            e.set(slot, true);
        }
        e
    }

    /// No slot participates.
    pub fn all_out(len: usize) -> Exclusion {
        Exclusion {
            bits: vec![0; (len + 63) / 64],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn participates(&self, slot: Slot) -> bool {
        slot < self.len && self.bits[slot / 64] & (1 << (slot % 64)) != 0
    }

    pub fn set(&mut self, slot: Slot, participates: bool) {
        if slot >= self.len {
            return;
        }
        if participates {
            self.bits[slot / 64] |= 1 << (slot % 64);
        } else {
            self.bits[slot / 64] &= !(1 << (slot % 64));
        }
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Flags as 1 (participates) and 0 (excluded) in slot order.
    pub fn flags(&self) -> Vec<u8> {
        (0..self.len).map(|s| self.participates(s) as u8).collect()
    }
}

/// Latest predicted versus actual offsets.
#[derive(Debug, Clone, PartialEq)]
pub struct Offsets {
    /// Per measured channel.
    pub measurement: DVector<f64>,
    /// Per model input.
    pub input: DVector<f64>,
}

/// The estimation window.
pub struct Window<M: ProcessModel> {
    pub(crate) model: M,
    pub(crate) layout: Layout,
    pub(crate) options: WindowOptions,
    pub(crate) phase: Phase,
    pub(crate) noisy: Registry,
    pub(crate) measured: Registry,
    /// Noisy slot to model state position
    pub(crate) noisy_pos: Vec<usize>,
    /// Measured slot to model output position
    pub(crate) measured_pos: Vec<usize>,
    /// Model state position to noisy slot
    pub(crate) slot_of_state: Vec<Option<Slot>>,
    /// Bounds per model state position
    pub(crate) state_bounds: Vec<Bounds>,
    pub(crate) x: Vec<Vec<DVector<f64>>>,
    pub(crate) w: Vec<DVector<f64>>,
    pub(crate) nu: Vec<DVector<f64>>,
    pub(crate) wu: Vec<DVector<f64>>,
    pub(crate) u: Vec<DVector<f64>>,
    pub(crate) y0: Vec<DVector<f64>>,
    pub(crate) prior: PriorState,
    pub(crate) ic: DVector<f64>,
    pub(crate) excl: Exclusion,
    /// Pi restricted to participating slots
    pub(crate) arrival_weight: DMatrix<f64>,
    pub(crate) Q: Vec<Weight>,
    pub(crate) R: Vec<Weight>,
    pub(crate) U: Vec<Weight>,
    pub(crate) offsets: Offsets,
}

impl<M: ProcessModel> Window<M> {
    /// Builds the window for `num_stages` stages of `num_substeps` sub-steps each.
    ///
    /// The noisy states and measured outputs are resolved against the model declarations.
    /// The window is left in the PREPARATION phase.
    pub fn build<F>(
        num_stages: usize,
        num_substeps: usize,
        factory: &F,
        selection: &Selection,
        options: WindowOptions,
    ) -> Result<Window<M>>
    where
        F: ModelFactory<Model = M>,
    {
        if num_stages < 2 {
            return Err(EstimateError::ModelConstructionError {
                reason: format!("horizon needs at least 2 stages, {} requested", num_stages),
            });
        }
        if num_substeps < 1 {
            return Err(EstimateError::ModelConstructionError {
                reason: "stages need at least one sub-step".to_string(),
            });
        }
        let model = factory.build(num_stages, num_substeps, options.horizon_length)?;

        let mut noisy = Registry::new();
        let mut noisy_pos = Vec::new();
        for (name, indices) in &selection.noisy_states {
            let (offset, decl) = resolve_decl(model.states(), name, "state")?;
            for sub in indices {
                let pos = offset + position_in(decl, sub)?;
                noisy.register(name, sub.clone())?;
                noisy_pos.push(pos);
            }
        }
        noisy.freeze();

        let mut measured = Registry::new();
        let mut measured_pos = Vec::new();
        for (name, indices) in &selection.measurements {
            let (offset, decl) = resolve_decl(model.outputs(), name, "output")?;
            for sub in indices {
                let pos = offset + position_in(decl, sub)?;
                measured.register(name, sub.clone())?;
                measured_pos.push(pos);
            }
        }
        measured.freeze();

        let nx = model.state_dim();
        let nin = model.input_dim();
        let layout = Layout {
            nfe: num_stages,
            ncp: num_substeps,
            nx,
            nin,
            K: noisy.len(),
            M: measured.len(),
        };

        let mut slot_of_state = vec![None; nx];
        for (slot, pos) in noisy_pos.iter().enumerate() {
            slot_of_state[*pos] = Some(slot);
        }
        let state_bounds = model
            .states()
            .iter()
            .flat_map(|d| std::iter::repeat(d.bounds).take(d.len()))
            .collect();

        let K = layout.K;
        let mut window = Window {
            model,
            layout,
            options,
            phase: Phase::ColdStart,
            noisy,
            measured,
            noisy_pos,
            measured_pos,
            slot_of_state,
            state_bounds,
            x: vec![vec![DVector::zeros(nx); num_substeps + 1]; num_stages],
            w: vec![DVector::zeros(K); num_stages - 1],
            nu: vec![DVector::zeros(layout.M); num_stages],
            wu: vec![DVector::zeros(nin); num_stages],
            u: vec![DVector::zeros(nin); num_stages],
            y0: vec![DVector::zeros(layout.M); num_stages],
            prior: PriorState::new_unit(K),
            ic: DVector::zeros(nx),
            excl: Exclusion::all_in(K),
            arrival_weight: DMatrix::identity(K, K),
            Q: vec![Weight::identity(K); num_stages - 1],
            R: vec![Weight::identity(layout.M); num_stages],
            U: vec![Weight::identity(nin); num_stages],
            offsets: Offsets {
                measurement: DVector::zeros(layout.M),
                input: DVector::zeros(nin),
            },
        };
        info!(
            "window built: {} stages x {} sub-steps, {} noisy states, {} measurements",
            num_stages, num_substeps, K, layout.M
        );
        window.set_phase(Phase::Preparation)?;
        Ok(window)
    }

    /// The single entry point of the phase state machine.
    ///
    /// COLD_START -> PREPARATION on build, PREPARATION -> FILTERING once.
    pub fn set_phase(&mut self, phase: Phase) -> Result<()> {
        match (self.phase, phase) {
            (Phase::ColdStart, Phase::Preparation) | (Phase::Preparation, Phase::Filtering) => {
                info!("phase {} -> {}", self.phase.as_str(), phase.as_str());
                self.phase = phase;
                if phase == Phase::Filtering {
                    let excl = self.excl.clone();
                    self.regenerate_objective(&excl);
                }
                Ok(())
            }
            (from, to) => Err(EstimateError::InvalidPhaseTransition {
                from: from.as_str(),
                to: to.as_str(),
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn options(&self) -> &WindowOptions {
        &self.options
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn noisy_registry(&self) -> &Registry {
        &self.noisy
    }

    pub fn measurement_registry(&self) -> &Registry {
        &self.measured
    }

    /// Model state position of a noisy slot.
    pub fn noisy_position(&self, slot: Slot) -> usize {
        self.noisy_pos[slot]
    }

    /// Model output position of a measured slot.
    pub fn measured_position(&self, slot: Slot) -> usize {
        self.measured_pos[slot]
    }

    pub fn noisy_slot_of_state(&self, pos: usize) -> Option<Slot> {
        self.slot_of_state[pos]
    }

    pub(crate) fn check_stage(&self, stage: usize) -> Result<()> {
        if stage < self.layout.nfe {
            Ok(())
        } else {
            Err(EstimateError::StageOutOfRange {
                stage,
                stages: self.layout.nfe,
            })
        }
    }

    /// Whether `w` is a decision variable.
    pub(crate) fn process_noise_active(&self) -> bool {
        self.phase == Phase::Filtering && !self.options.ignore_process_noise
    }

    /// Whether `wu` is a decision variable.
    pub(crate) fn input_noise_active(&self) -> bool {
        self.phase == Phase::Filtering && self.options.estimate_input_noise
    }

    /// Input the model is driven by at a stage.
    pub fn driven_input(&self, stage: usize) -> DVector<f64> {
        &self.u[stage] - &self.wu[stage]
    }

    /// Model outputs at the end of a stage.
    pub fn predicted_output(&self, stage: usize) -> DVector<f64> {
        let h = self.model.output(&self.x[stage][self.layout.ncp], &self.driven_input(stage));
        DVector::from_iterator(self.layout.M, self.measured_pos.iter().map(|p| h[*p]))
    }

    // ---- state values ----

    pub fn state(&self, stage: usize, sub: usize) -> &DVector<f64> {
        &self.x[stage][sub]
    }

    pub fn set_state(&mut self, stage: usize, sub: usize, x: &DVector<f64>) -> Result<()> {
        self.check_stage(stage)?;
        if sub > self.layout.ncp {
            return Err(EstimateError::StageOutOfRange {
                stage: sub,
                stages: self.layout.ncp + 1,
            });
        }
        check_len("state", self.layout.nx, x.len())?;
        self.x[stage][sub].copy_from(x);
        Ok(())
    }

    /// Noisy state values at a stage sub-point in slot order.
    pub fn noisy_state(&self, stage: usize, sub: usize) -> DVector<f64> {
        let x = &self.x[stage][sub];
        DVector::from_iterator(self.layout.K, self.noisy_pos.iter().map(|p| x[*p]))
    }

    /// Fills every sub-point of every stage with `x`.
    pub fn fill_states(&mut self, x: &DVector<f64>) -> Result<()> {
        check_len("state", self.layout.nx, x.len())?;
        for stage in self.x.iter_mut() {
            for xs in stage.iter_mut() {
                xs.copy_from(x);
            }
        }
        Ok(())
    }

    // ---- noise values ----

    pub fn disturbance(&self, stage: usize) -> &DVector<f64> {
        &self.w[stage]
    }

    pub fn set_disturbance(&mut self, stage: usize, w: &DVector<f64>) -> Result<()> {
        if stage + 1 >= self.layout.nfe {
            return Err(EstimateError::StageOutOfRange {
                stage,
                stages: self.layout.nfe - 1,
            });
        }
        check_len("disturbance", self.layout.K, w.len())?;
        self.w[stage].copy_from(w);
        Ok(())
    }

    pub fn measurement_noise(&self, stage: usize) -> &DVector<f64> {
        &self.nu[stage]
    }

    pub fn set_measurement_noise(&mut self, stage: usize, nu: &DVector<f64>) -> Result<()> {
        self.check_stage(stage)?;
        check_len("measurement noise", self.layout.M, nu.len())?;
        self.nu[stage].copy_from(nu);
        Ok(())
    }

    pub fn input_noise(&self, stage: usize) -> &DVector<f64> {
        &self.wu[stage]
    }

    pub fn set_input_noise(&mut self, stage: usize, wu: &DVector<f64>) -> Result<()> {
        self.check_stage(stage)?;
        check_len("input noise", self.layout.nin, wu.len())?;
        self.wu[stage].copy_from(wu);
        Ok(())
    }

    // ---- parameters ----

    pub fn held_input(&self, stage: usize) -> &DVector<f64> {
        &self.u[stage]
    }

    pub fn measurement(&self, stage: usize) -> &DVector<f64> {
        &self.y0[stage]
    }

    pub fn prior(&self) -> &PriorState {
        &self.prior
    }

    /// Sets the arrival cost anchor and weight.
    ///
    /// Takes effect in the objective on the next regeneration.
    pub fn set_prior(&mut self, prior: PriorState) -> Result<()> {
        check_len("prior estimate", self.layout.K, prior.x0.len())?;
        check_len("prior weight", self.layout.K, prior.Pi.nrows())?;
        check_len("prior weight", self.layout.K, prior.Pi.ncols())?;
        self.prior = prior;
        let excl = self.excl.clone();
        self.regenerate_objective(&excl);
        Ok(())
    }

    /// Initial condition parameters of all model states.
    pub fn initial_condition(&self) -> &DVector<f64> {
        &self.ic
    }

    pub fn set_initial_condition(&mut self, ic: &DVector<f64>) -> Result<()> {
        check_len("initial condition", self.layout.nx, ic.len())?;
        self.ic.copy_from(ic);
        Ok(())
    }

    pub fn exclusion(&self) -> &Exclusion {
        &self.excl
    }

    /// Arrival weight as used by the objective.
    pub fn arrival_weight(&self) -> &DMatrix<f64> {
        &self.arrival_weight
    }

    pub fn latest_offsets(&self) -> &Offsets {
        &self.offsets
    }

    // ---- weights ----

    /// Process noise weight for all stages.
    pub fn set_process_weight(&mut self, Q: Weight) -> Result<()> {
        check_len("process noise weight", self.layout.K, Q.dim())?;
        for q in self.Q.iter_mut() {
            *q = Q.clone();
        }
        Ok(())
    }

    /// Measurement noise weight for all stages.
    pub fn set_measurement_weight(&mut self, R: Weight) -> Result<()> {
        check_len("measurement noise weight", self.layout.M, R.dim())?;
        for r in self.R.iter_mut() {
            *r = R.clone();
        }
        Ok(())
    }

    /// Input noise weight for all stages.
    pub fn set_input_weight(&mut self, U: Weight) -> Result<()> {
        check_len("input noise weight", self.layout.nin, U.dim())?;
        for w in self.U.iter_mut() {
            *w = U.clone();
        }
        Ok(())
    }

    /// Process noise weight of a single stage.
    pub fn set_stage_process_weight(&mut self, stage: usize, Q: Weight) -> Result<()> {
        if stage + 1 >= self.layout.nfe {
            return Err(EstimateError::StageOutOfRange {
                stage,
                stages: self.layout.nfe - 1,
            });
        }
        check_len("process noise weight", self.layout.K, Q.dim())?;
        self.Q[stage] = Q;
        Ok(())
    }
}

fn resolve_decl<'a>(
    decls: &'a [VariableDecl],
    name: &str,
    kind: &str,
) -> Result<(usize, &'a VariableDecl)> {
    let (offset, decl) = flat_offset(decls, name).ok_or_else(|| EstimateError::ModelConstructionError {
        reason: format!("model has no {} named {}", kind, name),
    })?;
    if !decl.time_indexed {
        return Err(EstimateError::ModelConstructionError {
            reason: format!("{} {} is not indexed by time", kind, name),
        });
    }
    Ok((offset, decl))
}

fn position_in(decl: &VariableDecl, sub: &SubIndex) -> Result<usize> {
    decl.position(sub).ok_or_else(|| EstimateError::ModelConstructionError {
        reason: format!("{} has no sub-index {}", decl.name, sub),
    })
}
