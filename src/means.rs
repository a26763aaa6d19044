//! A module for prior mean models of the process.
//!
//! The process is fitted on the residual between the targets and the prior
//! mean, so only simple baselines are needed:
//! * zero,
//! * average of the targets,
//! * first target value.
//!
//! With derivative observations the extended target vector carries gradient
//! components after the values; a constant baseline contributes zero to those.

use ndarray::{Array1, ArrayBase, Data, Ix1};
use std::fmt;

/// A prior mean model subtracted from the targets before fitting
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub enum PriorMean {
    /// No baseline
    #[default]
    Zero,
    /// Mean of the target values
    Average,
    /// First target value
    FirstPoint,
}

impl PriorMean {
    /// Baseline constant for given target values (value part only)
    pub fn value(&self, y: &ArrayBase<impl Data<Elem = f64>, Ix1>) -> f64 {
        match self {
            PriorMean::Zero => 0.0,
            PriorMean::Average => {
                if y.is_empty() {
                    0.0
                } else {
                    y.mean().unwrap()
                }
            }
            PriorMean::FirstPoint => {
                if y.is_empty() {
                    0.0
                } else {
                    y[0]
                }
            }
        }
    }

    /// Subtract the baseline from an extended target vector.
    ///
    /// Only the first `n_values` components are value observations, the rest
    /// are derivative components a constant baseline does not affect.
    pub fn residual(
        &self,
        y: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        n_values: usize,
    ) -> (Array1<f64>, f64) {
        let yp = self.value(&y.slice(ndarray::s![..n_values]));
        let mut res = y.to_owned();
        res.slice_mut(ndarray::s![..n_values]).mapv_inplace(|v| v - yp);
        (res, yp)
    }
}

impl fmt::Display for PriorMean {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PriorMean::Zero => write!(f, "Zero"),
            PriorMean::Average => write!(f, "Average"),
            PriorMean::FirstPoint => write!(f, "FirstPoint"),
        }
    }
}
