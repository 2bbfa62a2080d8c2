//! Estimator configuration.
//!
//! Read from TOML. Every field has a default so a configuration only names what it changes:
//!
//! ```toml
//! stages = 10
//! substeps = 3
//! horizon_length = 10.0
//! weight_mode = "full"
//!
//! [[noisy_states]]
//! name = "T"
//! indices = [[1], [2]]
//!
//! [[measurements]]
//! name = "Tm"
//!
//! [solver]
//! max_iter = 200
//! ```

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EstimateError, Result};
use crate::models::SubIndex;
use crate::noise::WeightMode;
use crate::solver::SolverOptions;
use crate::window::{Selection, WindowOptions};

/// A selected variable and its sub-indices, the scalar index when none are given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionEntry {
    pub name: String,
    #[serde(default = "scalar_indices")]
    pub indices: Vec<SubIndex>,
}

fn scalar_indices() -> Vec<SubIndex> {
    vec![SubIndex::scalar()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalConfig {
    pub directory: PathBuf,
    #[serde(default)]
    pub suffix: String,
}

/// Per channel variances applied when the estimator is created.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceConfig {
    pub process: Option<Vec<f64>>,
    pub measurement: Option<Vec<f64>>,
    pub input: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub stages: usize,
    pub substeps: usize,
    /// Time spanned by all stages.
    pub horizon_length: f64,
    pub noisy_states: Vec<SelectionEntry>,
    pub measurements: Vec<SelectionEntry>,
    pub ignore_process_noise: bool,
    pub estimate_input_noise: bool,
    pub weight_mode: WeightMode,
    /// Absolute distance to a bound at which a prior stage state is excluded.
    pub bound_tolerance: f64,
    /// Correct the estimate with the parametric sensitivity when fresh data arrives.
    pub advanced_step: bool,
    pub solver: SolverOptions,
    /// Retry options, relaxed `solver` options when absent.
    pub retry: Option<SolverOptions>,
    pub variances: VarianceConfig,
    pub journal: Option<JournalConfig>,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            stages: 5,
            substeps: 1,
            horizon_length: 5.,
            noisy_states: Vec::new(),
            measurements: Vec::new(),
            ignore_process_noise: false,
            estimate_input_noise: false,
            weight_mode: WeightMode::Diagonal,
            bound_tolerance: 1e-8,
            advanced_step: false,
            solver: SolverOptions::default(),
            retry: None,
            variances: VarianceConfig::default(),
            journal: None,
        }
    }
}

impl EstimatorConfig {
    pub fn from_toml_str(s: &str) -> Result<EstimatorConfig> {
        let config: EstimatorConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<EstimatorConfig> {
        let mut config_str = String::new();
        File::open(path.as_ref())
            .and_then(|mut f| f.read_to_string(&mut config_str))
            .map_err(|e| EstimateError::Config {
                reason: format!("unable to read {}: {}", path.as_ref().display(), e),
            })?;
        EstimatorConfig::from_toml_str(&config_str)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(EstimateError::Config {
                reason: reason.to_string(),
            })
        };
        if self.stages < 2 {
            return invalid("stages must be at least 2");
        }
        if self.substeps < 1 {
            return invalid("substeps must be at least 1");
        }
        if !(self.horizon_length > 0.) {
            return invalid("horizon_length must be positive");
        }
        if !(self.bound_tolerance >= 0.) {
            return invalid("bound_tolerance must not be negative");
        }
        Ok(())
    }

    pub fn selection(&self) -> Selection {
        let mut selection = Selection::new();
        for e in &self.noisy_states {
            selection = selection.noisy(&e.name, e.indices.clone());
        }
        for e in &self.measurements {
            selection = selection.measured(&e.name, e.indices.clone());
        }
        selection
    }

    pub fn window_options(&self) -> WindowOptions {
        WindowOptions {
            horizon_length: self.horizon_length,
            ignore_process_noise: self.ignore_process_noise,
            estimate_input_noise: self.estimate_input_noise,
            weight_mode: self.weight_mode,
        }
    }

    pub fn retry_options(&self) -> SolverOptions {
        self.retry.unwrap_or_else(|| self.solver.relaxed())
    }
}
