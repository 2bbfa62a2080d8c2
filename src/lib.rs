//!
//! Horizon+Estimate the moving horizon estimation library.
//! Copyright (c) 2020 Michael Stevens
//!
//! Moving Horizon Estimation is an optimisation based technique for state estimation of nonlinear dynamic systems.
//! A window of the most recent measurements and inputs is fitted by the system's dynamic model in a weighted
//! nonlinear least squares problem. Process, measurement and input noise enter the problem as decision variables.
//!
//! The information older than the window is summarised by an arrival cost. After each solve the stage leaving the
//! window is condensed into a quadratic penalty: anchored at its estimate and weighted by the information extracted
//! from the reduced Hessian of the solved problem. States held at a bound are excluded from the arrival cost.
//!
//! Process models are represented by traits, estimation windows and their states by structs.
//! The estimation problem is handed to solvers through traits, a dense KKT solver is provided.
//
//! # Licensing
//!
//! All Horizon+Estimate source code files are copyright with the license conditions as given here. The copyright notice is that of the MIT license.
//!  This in no way restricts any commercial use you may wish to make using our source code.
//!  As long as you respect the copyright and license conditions, Michael Stevens is happy to for you to use it in any way you wish.
//!
//! Permission is hereby granted, free of charge, to any person obtaining a copy of this software and associated documentation files (the "Software"), to deal in the Software without restriction,
//! including without limitation the rights to use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of the Software,
//! and to permit persons to whom the Software is furnished to do so, subject to the following conditions:
//!
//! The above copyright notice and this permission notice shall be included in all copies or substantial portions of the Software.
//!
//! THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//! FITNESS FOR A PARTICULAR PURPOSE AND NON INFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY,
//! WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

pub mod error;
pub mod models;
pub mod noise;
pub mod linalg;
pub mod registry;
pub mod window;
pub mod patch;
pub mod objective;
pub mod arrival;
pub mod shift;
pub mod solver;
pub mod estimator;
pub mod journal;
pub mod config;

pub use error::{EstimateError, Result};
pub use estimator::MovingHorizonEstimator;
