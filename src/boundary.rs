//! A module for hyperparameter boundary conditions and variable
//! transformations.
//!
//! A [`Boundary`] turns training data and a hyperparameter layout into
//! per-component `(low, high)` bounds in log space. The bounds feed grid and
//! line searches and constrain the local optimizers. A
//! [`VariableTransformation`] wraps another boundary and remaps each search
//! variable through a logistic onto `(0, 1)` so that unconstrained optimizers
//! see a uniform, bounded space.

use ndarray::{Array1, ArrayView1, ArrayView2};
use std::collections::BTreeMap;

use crate::errors::{GpFitError, Result};
use crate::hyperparameters::HpIndex;

/// Half-width of the machine-precision log-space bounds
const MACHINE_BOUND: f64 = 18.0;

/// Margin keeping transformed variables away from the logistic asymptotes
const TRANSFORM_EPS: f64 = 1e-8;

/// Boundary policy for the hyperparameter search space.
#[derive(Clone, Debug)]
pub enum Boundary {
    /// User-supplied bounds per hyperparameter name; names without an entry
    /// fall back to the machine-precision bounds.
    Fixed(BTreeMap<String, Vec<(f64, f64)>>),
    /// Hard numeric bounds derived from machine precision, independent of the
    /// training data.
    Strict,
    /// Data-driven bounds: length from pairwise feature-distance extremes,
    /// noise from the sample count, prefactor from the target variance.
    Educated,
    /// Another boundary remapped through a logistic onto `(0, 1)`.
    Transformed(VariableTransformation),
}

impl Default for Boundary {
    fn default() -> Self {
        Boundary::Educated
    }
}

impl Boundary {
    /// Fixed bounds from `(name, pairs)` entries.
    ///
    /// Fails with [`GpFitError::InvalidBounds`] when any pair has
    /// `low > high`.
    pub fn fixed<I>(entries: I) -> Result<Boundary>
    where
        I: IntoIterator<Item = (String, Vec<(f64, f64)>)>,
    {
        let map: BTreeMap<_, _> = entries.into_iter().collect();
        for (name, pairs) in &map {
            for &(low, high) in pairs {
                if low > high || !low.is_finite() || !high.is_finite() {
                    return Err(GpFitError::InvalidBounds {
                        name: name.clone(),
                        low,
                        high,
                    });
                }
            }
        }
        Ok(Boundary::Fixed(map))
    }

    /// Per-component bounds in log space, aligned with the flat search
    /// vector described by `index`.
    pub fn bounds(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        index: &HpIndex,
    ) -> Result<Vec<(f64, f64)>> {
        match self {
            Boundary::Fixed(map) => fixed_bounds(map, index),
            Boundary::Strict => Ok(strict_bounds(index)),
            Boundary::Educated => Ok(educated_bounds(x, y, index)),
            // Raw-space bounds of the wrapped boundary; the fitter applies
            // the transformation separately.
            Boundary::Transformed(tr) => tr.inner.bounds(x, y, index),
        }
    }
}

fn fixed_bounds(
    map: &BTreeMap<String, Vec<(f64, f64)>>,
    index: &HpIndex,
) -> Result<Vec<(f64, f64)>> {
    let mut out = Vec::with_capacity(index.dim());
    for (name, range) in index.iter() {
        let n = range.len();
        match map.get(name) {
            Some(pairs) if pairs.len() == n => out.extend_from_slice(pairs),
            Some(pairs) if pairs.len() == 1 => out.extend(std::iter::repeat(pairs[0]).take(n)),
            Some(pairs) => {
                return Err(GpFitError::DimensionMismatch {
                    what: format!("bounds for {}", name),
                    expected: n,
                    actual: pairs.len(),
                })
            }
            None => out.extend(std::iter::repeat((-MACHINE_BOUND, MACHINE_BOUND)).take(n)),
        }
    }
    Ok(out)
}

fn strict_bounds(index: &HpIndex) -> Vec<(f64, f64)> {
    vec![(-MACHINE_BOUND, MACHINE_BOUND); index.dim()]
}

fn educated_bounds(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    index: &HpIndex,
) -> Vec<(f64, f64)> {
    let n = x.nrows();
    let length = length_bounds(x);
    let noise = {
        let low = 0.5 * (10.0 * n.max(2) as f64 * f64::EPSILON).ln();
        (low, 10.0f64.ln())
    };
    let prefactor = {
        // Variance of the value targets only; derivative targets trail the
        // value block and would skew the scale.
        let nv = y.len().min(n.max(1));
        let vals = y.slice(ndarray::s![..nv]);
        let mean = vals.sum() / nv as f64;
        let var = vals.mapv(|v| (v - mean) * (v - mean)).sum() / nv as f64;
        if var > 0.0 {
            let mid = 0.5 * var.ln();
            (mid - 8.0, mid + 8.0)
        } else {
            (-MACHINE_BOUND, MACHINE_BOUND)
        }
    };
    let mut out = Vec::with_capacity(index.dim());
    for (name, range) in index.iter() {
        let pair = match name {
            "length" => length,
            "noise" => noise,
            "prefactor" => prefactor,
            _ => (-MACHINE_BOUND, MACHINE_BOUND),
        };
        out.extend(std::iter::repeat(pair).take(range.len()));
    }
    out
}

/// Length-scale bounds from the nonzero pairwise distance extremes
fn length_bounds(x: ArrayView2<f64>) -> (f64, f64) {
    let n = x.nrows();
    let mut dmin = f64::INFINITY;
    let mut dmax = 0.0f64;
    for i in 0..n {
        for j in (i + 1)..n {
            let mut s = 0.0;
            for k in 0..x.ncols() {
                let dx = x[[i, k]] - x[[j, k]];
                s += dx * dx;
            }
            let d = s.sqrt();
            if d > 0.0 {
                dmin = dmin.min(d);
                dmax = dmax.max(d);
            }
        }
    }
    if dmin.is_finite() && dmax > 0.0 {
        ((0.01 * dmin).ln(), (10.0 * dmax).ln())
    } else {
        (-MACHINE_BOUND, MACHINE_BOUND)
    }
}

/// Logistic remapping of a wrapped boundary's search space onto `(0, 1)`.
#[derive(Clone, Debug)]
pub struct VariableTransformation {
    inner: Box<Boundary>,
}

impl VariableTransformation {
    /// Wrap a boundary; its bounds define the logistic center and width per
    /// component.
    pub fn new(inner: Boundary) -> Self {
        VariableTransformation {
            inner: Box::new(inner),
        }
    }

    /// Default wrapping of the educated boundary
    pub fn educated() -> Self {
        VariableTransformation::new(Boundary::Educated)
    }

    /// Fit the transformation to the data by resolving the wrapped bounds.
    pub fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        index: &HpIndex,
    ) -> Result<FittedTransform> {
        let raw = self.inner.bounds(x, y, index)?;
        Ok(FittedTransform::from_bounds(&raw))
    }
}

/// Resolved logistic transformation between log space and `(0, 1)`.
#[derive(Clone, Debug)]
pub struct FittedTransform {
    mu: Array1<f64>,
    s: Array1<f64>,
}

impl FittedTransform {
    /// Logistic transform centered on the given bounds per component
    pub fn from_bounds(bounds: &[(f64, f64)]) -> Self {
        let mut mu = Array1::zeros(bounds.len());
        let mut s = Array1::zeros(bounds.len());
        for (i, &(low, high)) in bounds.iter().enumerate() {
            mu[i] = 0.5 * (low + high);
            s[i] = if high > low { (high - low) / 8.0 } else { 1.0 };
        }
        FittedTransform { mu, s }
    }

    /// Map log-space values onto `(0, 1)`, clipped away from the asymptotes.
    pub fn transform(&self, theta: &Array1<f64>) -> Array1<f64> {
        let mut t = Array1::zeros(theta.len());
        for i in 0..theta.len() {
            let v = 1.0 / (1.0 + (-(theta[i] - self.mu[i]) / self.s[i]).exp());
            t[i] = v.clamp(TRANSFORM_EPS, 1.0 - TRANSFORM_EPS);
        }
        t
    }

    /// Inverse map from `(0, 1)` back to log space.
    pub fn retransform(&self, t: &Array1<f64>) -> Array1<f64> {
        let mut theta = Array1::zeros(t.len());
        for i in 0..t.len() {
            let v = t[i].clamp(TRANSFORM_EPS, 1.0 - TRANSFORM_EPS);
            theta[i] = self.mu[i] + self.s[i] * (v / (1.0 - v)).ln();
        }
        theta
    }

    /// Chain-rule factor `d(theta)/d(t)` at a transformed point, for mapping
    /// gradients between the two spaces.
    pub fn derivative_factor(&self, t: &Array1<f64>) -> Array1<f64> {
        let mut f = Array1::zeros(t.len());
        for i in 0..t.len() {
            let v = t[i].clamp(TRANSFORM_EPS, 1.0 - TRANSFORM_EPS);
            f[i] = self.s[i] / (v * (1.0 - v));
        }
        f
    }

    /// Bounds of the transformed space
    pub fn bounds(&self) -> Vec<(f64, f64)> {
        vec![(TRANSFORM_EPS, 1.0 - TRANSFORM_EPS); self.mu.len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperparameters::Hyperparameters;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn index() -> HpIndex {
        Hyperparameters::default().to_vector().1
    }

    #[test]
    fn test_fixed_bounds_validation() {
        let err = Boundary::fixed([("length".to_string(), vec![(3.0, -3.0)])]).unwrap_err();
        assert!(matches!(err, GpFitError::InvalidBounds { .. }));
    }

    #[test]
    fn test_fixed_bounds_layout() {
        let b = Boundary::fixed([
            ("length".to_string(), vec![(-3.0, 3.0)]),
            ("noise".to_string(), vec![(-8.0, 0.0)]),
            ("prefactor".to_string(), vec![(-2.0, 4.0)]),
        ])
        .unwrap();
        let x = array![[0.0], [1.0]];
        let y = array![0.1, 0.9];
        let bounds = b.bounds(x.view(), y.view(), &index()).unwrap();
        assert_eq!(bounds, vec![(-3.0, 3.0), (-8.0, 0.0), (-2.0, 4.0)]);
    }

    #[test]
    fn test_educated_bounds_ordered_and_bracketing() {
        use crate::kernels::SquaredExponential;
        use crate::objectives::{LogLikelihood, Problem, ProcessRecipe};
        use crate::optimizers::{Lbfgs, Optimizer};

        let x = array![[0.0], [0.4], [1.1], [2.0], [2.7], [3.3]];
        let y = array![0.2, 0.5, -0.3, 1.4, 0.8, 0.9];
        let idx = index();
        let bounds = Boundary::Educated
            .bounds(x.view(), y.view(), &idx)
            .unwrap();
        for &(low, high) in &bounds {
            assert!(low < high);
        }
        // Length bounds bracket the log of the typical pairwise distance.
        assert!(bounds[0].0 < 0.0 && bounds[0].1 > 1.0f64.ln());
        // The unconstrained training-only optimum falls inside the bounds.
        let kernel = SquaredExponential::new();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &idx,
            priors: None,
        };
        let (theta0, _) = Hyperparameters::default().to_vector();
        let optimum = Lbfgs::default().run(&LogLikelihood, &problem, &theta0, None);
        for (v, &(low, high)) in optimum.x.iter().zip(&bounds) {
            assert!(*v >= low && *v <= high);
        }
    }

    #[test]
    fn test_transformation_round_trip() {
        let x = array![[0.0], [0.7], [1.5], [2.2]];
        let y = array![0.0, 0.3, -0.2, 0.8];
        let tr = VariableTransformation::educated()
            .fit(x.view(), y.view(), &index())
            .unwrap();
        let theta = array![0.3, -4.0, 1.2];
        let t = tr.transform(&theta);
        let back = tr.retransform(&t);
        for i in 0..theta.len() {
            assert!((0.0..=1.0).contains(&t[i]));
            assert_abs_diff_eq!(back[i], theta[i], epsilon = 1e-9);
        }
    }

    #[test]
    fn test_transformation_center_maps_to_half() {
        let b = Boundary::fixed([
            ("length".to_string(), vec![(-3.0, 3.0)]),
            ("noise".to_string(), vec![(-8.0, 0.0)]),
            ("prefactor".to_string(), vec![(-2.0, 4.0)]),
        ])
        .unwrap();
        let x = array![[0.0], [1.0]];
        let y = array![0.1, 0.9];
        let tr = VariableTransformation::new(b)
            .fit(x.view(), y.view(), &index())
            .unwrap();
        let centers = array![0.0, -4.0, 1.0];
        let t = tr.transform(&centers);
        for i in 0..3 {
            assert_abs_diff_eq!(t[i], 0.5, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_strict_bounds_symmetric() {
        let x = array![[0.0], [1.0]];
        let y = array![0.0, 1.0];
        let bounds = Boundary::Strict.bounds(x.view(), y.view(), &index()).unwrap();
        for &(low, high) in &bounds {
            assert_abs_diff_eq!(low, -high, epsilon = 1e-12);
        }
    }
}
