//! Optimization strategies over the hyperparameter search space.
//!
//! An [`Optimizer`] minimizes an [`ObjectiveFunction`] for a fixed training
//! problem from an initial vector, optionally constrained by per-component
//! bounds. Local methods live in [`local`], line searches in [`linesearch`]
//! and global/stochastic strategies in [`global`]. Every strategy returns a
//! [`Solution`] record; non-convergence is reported through
//! [`Solution::success`], never as an error.

pub mod global;
pub mod linesearch;
pub mod local;

pub use global::{
    AnnealingOptimizer, AnnealingTransOptimizer, BasinOptimizer, FactorizedOptimizer,
    GridOptimizer, IterativeLineOptimizer, RandomSamplingOptimizer,
};
pub use linesearch::{FineGridSearch, GoldenSearch, TransGridSearch};
pub use local::{CobylaOptimizer, FunctionEvaluation, GuessStartOptimizer, Lbfgs, PriorStartOptimizer};

use ndarray::Array1;
use std::fmt;

use crate::objectives::{ObjectiveFunction, Problem};

/// Outcome of one optimization run.
#[derive(Clone, Debug)]
pub struct Solution {
    /// Best loss found
    pub fun: f64,
    /// Hyperparameter vector at the best loss
    pub x: Array1<f64>,
    /// Gradient at the best point, when the objective provided one
    pub jac: Option<Array1<f64>>,
    /// Whether the strategy converged within its budget
    pub success: bool,
    /// Number of objective evaluations spent
    pub nfev: usize,
}

impl Solution {
    /// Single objective evaluation wrapped as a solution record
    pub fn evaluated(
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        x: Array1<f64>,
        jac: bool,
    ) -> Solution {
        let eval = objective.evaluate(&x, problem, jac);
        Solution {
            fun: eval.fun,
            x,
            jac: eval.jac,
            success: eval.fun.is_finite(),
            nfev: 1,
        }
    }

    /// Keep the better of two solutions, accumulating the evaluation count.
    /// Ties keep `self`, the earlier record.
    pub fn merge(self, other: Solution) -> Solution {
        let nfev = self.nfev + other.nfev;
        let mut best = if other.fun < self.fun { other } else { self };
        best.nfev = nfev;
        best
    }
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Solution(fun={:.6e}, success={}, nfev={})",
            self.fun, self.success, self.nfev
        )
    }
}

/// A strategy minimizing an objective over hyperparameter space.
pub trait Optimizer: Sync + Send + fmt::Debug {
    /// Minimize `objective` starting from `theta0`.
    ///
    /// `bounds` holds per-component `(low, high)` pairs aligned with the
    /// search vector; strategies that require bounds fall back to wide
    /// machine bounds when none are given.
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution;
}

/// Bounds fallback for strategies that cannot run unbounded
pub(crate) fn bounds_or_default(
    bounds: Option<&[(f64, f64)]>,
    dim: usize,
) -> Vec<(f64, f64)> {
    match bounds {
        Some(b) => b.to_vec(),
        None => vec![(-18.0, 18.0); dim],
    }
}
