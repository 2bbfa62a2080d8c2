#![allow(non_snake_case)]

//! Moving horizon estimation models.
//!
//! Process models are represented by the [`ProcessModel`] trait: named variable declarations plus
//! a one sub-step transition and an output map on flat vectors (declaration order).
//! A [`ModelFactory`] builds discretised models for a given horizon, so that the estimation
//! window and the one stage simulation model share the same discretisation.
//!
//! State representations are modeled as structs. [`PriorState`] is the arrival cost anchor.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::linalg;

/// One part of a variable sub-index tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexPart {
    Int(i64),
    Name(String),
}

impl From<i64> for IndexPart {
    fn from(i: i64) -> Self {
        IndexPart::Int(i)
    }
}

impl From<i32> for IndexPart {
    fn from(i: i32) -> Self {
        IndexPart::Int(i as i64)
    }
}

impl From<usize> for IndexPart {
    fn from(i: usize) -> Self {
        IndexPart::Int(i as i64)
    }
}

impl From<&str> for IndexPart {
    fn from(s: &str) -> Self {
        IndexPart::Name(s.to_string())
    }
}

impl From<String> for IndexPart {
    fn from(s: String) -> Self {
        IndexPart::Name(s)
    }
}

impl fmt::Display for IndexPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexPart::Int(i) => write!(f, "{}", i),
            IndexPart::Name(s) => write!(f, "{}", s),
        }
    }
}

/// Physical sub-index of a variable, the part of its index that is not time.
///
/// Scalar variables use the empty tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubIndex(pub Vec<IndexPart>);

impl SubIndex {
    pub fn scalar() -> SubIndex {
        SubIndex(Vec::new())
    }

    pub fn new<P: Into<IndexPart>>(parts: Vec<P>) -> SubIndex {
        SubIndex(parts.into_iter().map(Into::into).collect())
    }

    /// Single integer index `(i,)`.
    pub fn at(i: i64) -> SubIndex {
        SubIndex(vec![IndexPart::Int(i)])
    }

    pub fn parts(&self) -> &[IndexPart] {
        &self.0
    }
}

impl fmt::Display for SubIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ")")
    }
}

/// Variable bounds, `None` for an unbounded side.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bounds {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Bounds {
    pub fn free() -> Bounds {
        Bounds::default()
    }

    pub fn between(lower: f64, upper: f64) -> Bounds {
        Bounds {
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    pub fn at_least(lower: f64) -> Bounds {
        Bounds {
            lower: Some(lower),
            upper: None,
        }
    }

    pub fn at_most(upper: f64) -> Bounds {
        Bounds {
            lower: None,
            upper: Some(upper),
        }
    }

    /// Lower bound value, negative infinity when unbounded.
    pub fn lower_value(&self) -> f64 {
        self.lower.unwrap_or(f64::NEG_INFINITY)
    }

    /// Upper bound value, infinity when unbounded.
    pub fn upper_value(&self) -> f64 {
        self.upper.unwrap_or(f64::INFINITY)
    }
}

/// Declaration of a named model variable and its physical sub-indices.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableDecl {
    pub name: String,
    pub indices: Vec<SubIndex>,
    pub bounds: Bounds,
    /// Whether the variable is indexed by time in the discretised model.
    pub time_indexed: bool,
}

impl VariableDecl {
    pub fn scalar(name: &str) -> VariableDecl {
        VariableDecl::indexed(name, vec![SubIndex::scalar()])
    }

    pub fn indexed(name: &str, indices: Vec<SubIndex>) -> VariableDecl {
        VariableDecl {
            name: name.to_string(),
            indices,
            bounds: Bounds::free(),
            time_indexed: true,
        }
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> VariableDecl {
        self.bounds = bounds;
        self
    }

    /// Marks the variable as a time invariant quantity.
    pub fn untimed(mut self) -> VariableDecl {
        self.time_indexed = false;
        self
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Display labels `name(idx)` of every sub-index, `name` alone for a scalar.
    pub fn labels(&self) -> Vec<String> {
        self.indices
            .iter()
            .map(|sub| {
                if sub.parts().is_empty() {
                    self.name.clone()
                } else {
                    format!("{}{}", self.name, sub)
                }
            })
            .collect()
    }

    /// Position of a sub-index within this declaration.
    pub fn position(&self, sub: &SubIndex) -> Option<usize> {
        self.indices.iter().position(|s| s == sub)
    }
}

/// Offset of a named variable in the flat vector of a declaration list.
pub(crate) fn flat_offset<'a>(decls: &'a [VariableDecl], name: &str) -> Option<(usize, &'a VariableDecl)> {
    let mut offset = 0;
    for d in decls {
        if d.name == name {
            return Some((offset, d));
        }
        offset += d.len();
    }
    None
}

pub(crate) fn flat_len(decls: &[VariableDecl]) -> usize {
    decls.iter().map(VariableDecl::len).sum()
}

/// A discretised process model.
///
/// States are advanced one integration sub-step at a time by `step`.
/// Flat state, input and output vectors follow the declaration order of `states`, `inputs` and `outputs`.
pub trait ProcessModel {
    fn states(&self) -> &[VariableDecl];
    fn outputs(&self) -> &[VariableDecl];
    fn inputs(&self) -> &[VariableDecl];

    /// Advance the state by one sub-step with the input held constant.
    fn step(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64>;

    /// Model outputs at a state.
    fn output(&self, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64>;

    /// Jacobians (Fx, Fu) of `step`.
    ///
    /// Defaults to central differences.
    fn step_jacobian(&self, x: &DVector<f64>, u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let Fx = linalg::jacobian_fd(|xp| self.step(xp, u), x);
        let Fu = linalg::jacobian_fd(|up| self.step(x, up), u);
        (Fx, Fu)
    }

    /// Jacobians (Hx, Hu) of `output`.
    ///
    /// Defaults to central differences.
    fn output_jacobian(&self, x: &DVector<f64>, u: &DVector<f64>) -> (DMatrix<f64>, DMatrix<f64>) {
        let Hx = linalg::jacobian_fd(|xp| self.output(xp, u), x);
        let Hu = linalg::jacobian_fd(|up| self.output(x, up), u);
        (Hx, Hu)
    }

    fn state_dim(&self) -> usize {
        flat_len(self.states())
    }

    fn output_dim(&self) -> usize {
        flat_len(self.outputs())
    }

    fn input_dim(&self) -> usize {
        flat_len(self.inputs())
    }
}

/// Builds discretised models.
///
/// `horizon_length` is the time spanned by all `num_stages` stages.
pub trait ModelFactory {
    type Model: ProcessModel;

    fn build(&self, num_stages: usize, num_substeps: usize, horizon_length: f64) -> Result<Self::Model>;
}

/// Arrival cost anchor.
///
/// Prior state estimate and its information (inverse covariance) matrix, indexed by noisy state slot.
#[derive(PartialEq, Clone, Debug)]
pub struct PriorState {
    /// Prior state estimate
    pub x0: DVector<f64>,
    /// Prior information matrix (symmetric positive semi-definite)
    pub Pi: DMatrix<f64>,
}

impl PriorState {
    /// Zero estimate with unit information.
    pub fn new_unit(d: usize) -> PriorState {
        PriorState {
            x0: DVector::zeros(d),
            Pi: DMatrix::identity(d, d),
        }
    }
}

/// A state estimator.
pub trait Estimator {
    /// The estimator's estimate of the system's state.
    fn state(&self) -> Result<DVector<f64>>;
}
