//! Measurement and input patching.
//!
//! Plant data enters the window as parameters of a stage: the measurements `y0` and the held
//! inputs `u`. Decision values are never touched by patching.

use nalgebra::DVector;
use rand_core::RngCore;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{check_len, EstimateError, Result};
use crate::models::ProcessModel;
use crate::window::{Offsets, Window};

/// Perturbs `values` with zero mean Gaussian noise of per channel variance `variance`.
///
/// Deterministic for a seeded `rng`. Returns the perturbed values and the noise drawn.
pub fn inject_synthetic_noise<R: RngCore + ?Sized>(
    values: &DVector<f64>,
    variance: &DVector<f64>,
    rng: &mut R,
) -> Result<(DVector<f64>, DVector<f64>)> {
    check_len("noise variance", values.len(), variance.len())?;
    let mut noise = DVector::zeros(values.len());
    for (i, var) in variance.iter().enumerate() {
        if !(*var >= 0.) {
            return Err(EstimateError::Config {
                reason: format!("negative synthetic noise variance {} for channel {}", var, i),
            });
        }
        let n: f64 = StandardNormal.sample(rng);
        noise[i] = n * var.sqrt();
    }
    Ok((values + &noise, noise))
}

impl<M: ProcessModel> Window<M> {
    /// Writes observed measurements into `y0` of a stage.
    pub fn patch_measurement(&mut self, stage: usize, observed: &DVector<f64>) -> Result<()> {
        self.check_stage(stage)?;
        check_len("measurement", self.layout.M, observed.len())?;
        self.y0[stage].copy_from(observed);
        Ok(())
    }

    /// Writes the held input of a stage.
    pub fn patch_input(&mut self, stage: usize, observed: &DVector<f64>) -> Result<()> {
        self.check_stage(stage)?;
        check_len("input", self.layout.nin, observed.len())?;
        self.u[stage].copy_from(observed);
        Ok(())
    }

    /// Observed minus predicted measurements at the end of a stage, and held minus driven inputs.
    ///
    /// Stored as the latest offsets.
    pub fn compute_offset(&mut self, stage: usize) -> Result<Offsets> {
        self.check_stage(stage)?;
        let measurement = &self.y0[stage] - self.predicted_output(stage);
        let input = if self.options.estimate_input_noise {
            self.wu[stage].clone()
        } else {
            DVector::zeros(self.layout.nin)
        };
        self.offsets = Offsets { measurement, input };
        Ok(self.offsets.clone())
    }

    /// Offsets of fresh plant data against what is patched into a stage.
    pub fn compute_offset_against(
        &self,
        stage: usize,
        observed_y: &DVector<f64>,
        observed_u: &DVector<f64>,
    ) -> Result<Offsets> {
        self.check_stage(stage)?;
        check_len("measurement", self.layout.M, observed_y.len())?;
        check_len("input", self.layout.nin, observed_u.len())?;
        Ok(Offsets {
            measurement: observed_y - &self.y0[stage],
            input: observed_u - &self.u[stage],
        })
    }
}
