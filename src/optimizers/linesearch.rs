//! Line-search strategies along the diagonal of the bounds.
//!
//! These strategies reduce the search to a single parameter `t` in `[0, 1]`
//! mapped onto the bounds diagonal, `theta(t) = low + t * (high - low)` per
//! component. They are cheap, derivative-free and pair naturally with the
//! factorized objectives, which profile the remaining hyperparameters
//! internally.

use ndarray::Array1;

use super::{bounds_or_default, Optimizer, Solution};
use crate::boundary::FittedTransform;
use crate::objectives::{ObjectiveFunction, Problem};

fn line_point(bounds: &[(f64, f64)], t: f64) -> Array1<f64> {
    bounds
        .iter()
        .map(|&(low, high)| low + t * (high - low))
        .collect()
}

/// Golden-section search along the bounds diagonal.
#[derive(Clone, Copy, Debug)]
pub struct GoldenSearch {
    /// Iteration budget
    pub maxiter: usize,
    /// Interval-width convergence tolerance on `t`
    pub tol: f64,
}

impl Default for GoldenSearch {
    fn default() -> Self {
        GoldenSearch {
            maxiter: 100,
            tol: 1e-5,
        }
    }
}

impl Optimizer for GoldenSearch {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let bounds = bounds_or_default(bounds, theta0.len());
        let mut nfev = 0;
        let mut eval = |t: f64| {
            nfev += 1;
            objective.evaluate(&line_point(&bounds, t), problem, false).fun
        };
        let inv_phi = 0.5 * (5.0f64.sqrt() - 1.0);
        let (mut a, mut b) = (0.0f64, 1.0f64);
        let mut c = b - inv_phi * (b - a);
        let mut d = a + inv_phi * (b - a);
        let (mut fc, mut fd) = (eval(c), eval(d));
        let mut converged = false;
        for _ in 0..self.maxiter {
            if (b - a).abs() < self.tol {
                converged = true;
                break;
            }
            if fc < fd {
                b = d;
                d = c;
                fd = fc;
                c = b - inv_phi * (b - a);
                fc = eval(c);
            } else {
                a = c;
                c = d;
                fc = fd;
                d = a + inv_phi * (b - a);
                fd = eval(d);
            }
        }
        let t = 0.5 * (a + b);
        let fun = eval(t);
        Solution {
            fun,
            x: line_point(&bounds, t),
            jac: None,
            success: converged && fun.is_finite(),
            nfev,
        }
    }
}

/// Iteratively refined grid along the bounds diagonal.
///
/// Each loop lays a uniform grid over the current interval, then zooms onto
/// the cells adjacent to the best point.
#[derive(Clone, Copy, Debug)]
pub struct FineGridSearch {
    /// Number of refinement loops
    pub loops: usize,
    /// Grid points per loop
    pub ngrid: usize,
}

impl Default for FineGridSearch {
    fn default() -> Self {
        FineGridSearch { loops: 3, ngrid: 80 }
    }
}

impl Optimizer for FineGridSearch {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let bounds = bounds_or_default(bounds, theta0.len());
        let n = self.ngrid.max(2);
        let mut nfev = 0;
        let (mut lo, mut hi) = (0.0f64, 1.0f64);
        let mut best_t = 0.5;
        let mut best_f = f64::INFINITY;
        for _ in 0..self.loops.max(1) {
            let mut loop_best = (lo, f64::INFINITY);
            for i in 0..n {
                let t = lo + (hi - lo) * i as f64 / (n - 1) as f64;
                let f = objective.evaluate(&line_point(&bounds, t), problem, false).fun;
                nfev += 1;
                if f < loop_best.1 {
                    loop_best = (t, f);
                }
            }
            if loop_best.1 < best_f {
                best_t = loop_best.0;
                best_f = loop_best.1;
            }
            let step = (hi - lo) / (n - 1) as f64;
            lo = (loop_best.0 - step).max(0.0);
            hi = (loop_best.0 + step).min(1.0);
        }
        Solution {
            fun: best_f,
            x: line_point(&bounds, best_t),
            jac: None,
            success: best_f.is_finite(),
            nfev,
        }
    }
}

/// Grid search along the diagonal of a logistic-transformed space.
///
/// The bounds define a [`FittedTransform`] per component; the grid runs over
/// the transformed coordinate, which concentrates resolution around the
/// bounds midpoint where optima typically fall.
#[derive(Clone, Copy, Debug)]
pub struct TransGridSearch {
    /// Number of refinement loops
    pub loops: usize,
    /// Grid points per loop
    pub ngrid: usize,
}

impl Default for TransGridSearch {
    fn default() -> Self {
        TransGridSearch { loops: 2, ngrid: 80 }
    }
}

impl Optimizer for TransGridSearch {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let bounds = bounds_or_default(bounds, theta0.len());
        let transform = FittedTransform::from_bounds(&bounds);
        let n = self.ngrid.max(2);
        let dim = theta0.len();
        let mut nfev = 0;
        let (mut lo, mut hi) = (0.0f64, 1.0f64);
        let mut best = (Array1::zeros(dim), f64::INFINITY);
        for _ in 0..self.loops.max(1) {
            let mut loop_best = (lo, f64::INFINITY);
            for i in 0..n {
                let t = lo + (hi - lo) * i as f64 / (n - 1) as f64;
                let theta = transform.retransform(&Array1::from_elem(dim, t));
                let f = objective.evaluate(&theta, problem, false).fun;
                nfev += 1;
                if f < loop_best.1 {
                    loop_best = (t, f);
                }
                if f < best.1 {
                    best = (theta, f);
                }
            }
            let step = (hi - lo) / (n - 1) as f64;
            lo = (loop_best.0 - step).max(0.0);
            hi = (loop_best.0 + step).min(1.0);
        }
        Solution {
            fun: best.1,
            x: best.0,
            jac: None,
            success: best.1.is_finite(),
            nfev,
        }
    }
}
