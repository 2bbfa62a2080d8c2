//! Per cycle journal.
//!
//! One tab separated file per category, one line per estimation cycle, each value followed by a
//! tab. Files are named `res_mhe_<category>_<suffix>.txt` and opened in append mode for the
//! lifetime of the journal. The label file names the noisy states in slot order.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use nalgebra::DVector;

use crate::error::{EstimateError, Result};

/// Journal file categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Newest stage noisy state estimates
    EstimatedStates,
    /// Plant states, when supplied
    RealStates,
    /// Estimated minus plant states
    EstimateOffsets,
    /// Newest stage estimated outputs
    EstimatedOutputs,
    /// Plant outputs, when supplied
    RealOutputs,
    /// Patched newest stage measurements
    PatchedMeasurements,
    /// Injected synthetic measurement noise
    MeasurementNoise,
    MeasurementOffsets,
    InputOffsets,
    /// Input noise over all stages
    InputNoise,
}

pub const CATEGORIES: [Category; 10] = [
    Category::EstimatedStates,
    Category::RealStates,
    Category::EstimateOffsets,
    Category::EstimatedOutputs,
    Category::RealOutputs,
    Category::PatchedMeasurements,
    Category::MeasurementNoise,
    Category::MeasurementOffsets,
    Category::InputOffsets,
    Category::InputNoise,
];

impl Category {
    pub fn tag(self) -> &'static str {
        match self {
            Category::EstimatedStates => "es",
            Category::RealStates => "rs",
            Category::EstimateOffsets => "eoff",
            Category::EstimatedOutputs => "ey",
            Category::RealOutputs => "yreal",
            Category::PatchedMeasurements => "yk0",
            Category::MeasurementNoise => "ynoise",
            Category::MeasurementOffsets => "yoffset",
            Category::InputOffsets => "uoffset",
            Category::InputNoise => "unoise",
        }
    }
}

/// The values journaled for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleRecord {
    pub estimated_states: DVector<f64>,
    pub real_states: Option<DVector<f64>>,
    pub estimated_outputs: DVector<f64>,
    pub real_outputs: Option<DVector<f64>>,
    pub patched_measurements: DVector<f64>,
    pub measurement_noise: DVector<f64>,
    pub measurement_offsets: DVector<f64>,
    pub input_offsets: DVector<f64>,
    /// Input noise of every stage, concatenated.
    pub input_noise: DVector<f64>,
}

pub struct Journal {
    directory: PathBuf,
    suffix: String,
    files: Vec<(Category, BufWriter<File>)>,
}

fn journal_error(path: &Path, err: std::io::Error) -> EstimateError {
    EstimateError::Journal {
        reason: format!("{}: {}", path.display(), err),
    }
}

impl Journal {
    /// Opens every category file and writes the label file.
    pub fn create<P: AsRef<Path>>(directory: P, suffix: &str, labels: &[String]) -> Result<Journal> {
        let directory = directory.as_ref().to_path_buf();
        let mut files = Vec::with_capacity(CATEGORIES.len());
        for category in CATEGORIES.iter() {
            let path = directory.join(file_name(category.tag(), suffix));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| journal_error(&path, e))?;
            files.push((*category, BufWriter::new(file)));
        }

        let label_path = directory.join(file_name("label", suffix));
        let mut label_file = File::create(&label_path).map_err(|e| journal_error(&label_path, e))?;
        for label in labels {
            write!(label_file, "{}\t", label).map_err(|e| journal_error(&label_path, e))?;
        }

        Ok(Journal {
            directory,
            suffix: suffix.to_string(),
            files,
        })
    }

    /// Path of a category file.
    pub fn path(&self, category: Category) -> PathBuf {
        self.directory.join(file_name(category.tag(), &self.suffix))
    }

    /// Appends one line to every category with data.
    pub fn record(&mut self, record: &CycleRecord) -> Result<()> {
        let offsets = record.real_states.as_ref().map(|rs| &record.estimated_states - rs);
        for i in 0..self.files.len() {
            let category = self.files[i].0;
            let values = match category {
                Category::EstimatedStates => Some(&record.estimated_states),
                Category::RealStates => record.real_states.as_ref(),
                Category::EstimateOffsets => offsets.as_ref(),
                Category::EstimatedOutputs => Some(&record.estimated_outputs),
                Category::RealOutputs => record.real_outputs.as_ref(),
                Category::PatchedMeasurements => Some(&record.patched_measurements),
                Category::MeasurementNoise => Some(&record.measurement_noise),
                Category::MeasurementOffsets => Some(&record.measurement_offsets),
                Category::InputOffsets => Some(&record.input_offsets),
                Category::InputNoise => Some(&record.input_noise),
            };
            if let Some(values) = values {
                let path = self.path(category);
                write_line(&mut self.files[i].1, values).map_err(|e| journal_error(&path, e))?;
            }
        }
        Ok(())
    }
}

fn file_name(tag: &str, suffix: &str) -> String {
    format!("res_mhe_{}_{}.txt", tag, suffix)
}

fn write_line<W: Write>(out: &mut W, values: &DVector<f64>) -> std::io::Result<()> {
    for v in values.iter() {
        write!(out, "{}\t", v)?;
    }
    writeln!(out)?;
    out.flush()
}
