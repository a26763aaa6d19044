//! Prior distributions over hyperparameters.
//!
//! A prior contributes its negative log-density (and the derivative thereof)
//! additively to the objective function. Priors are attached per
//! hyperparameter name; absent entries contribute zero.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::fmt;

use crate::hyperparameters::HpIndex;
use ndarray::Array1;

/// A trait for prior densities over a single hyperparameter value (log space)
pub trait PriorDistribution: Sync + Send + fmt::Debug {
    /// Log of the probability density at `x`
    fn ln_pdf(&self, x: f64) -> f64;

    /// Derivative of the log-density with respect to `x`
    fn ln_deriv(&self, x: f64) -> f64;
}

/// Normal prior
#[derive(Clone, Copy, Debug)]
pub struct NormalPrior {
    /// Mean
    pub mu: f64,
    /// Standard deviation
    pub std: f64,
}

impl NormalPrior {
    /// Normal prior with given mean and standard deviation
    pub fn new(mu: f64, std: f64) -> Self {
        NormalPrior { mu, std }
    }
}

impl PriorDistribution for NormalPrior {
    fn ln_pdf(&self, x: f64) -> f64 {
        let z = (x - self.mu) / self.std;
        -0.5 * z * z - self.std.ln() - 0.5 * (2.0 * PI).ln()
    }

    fn ln_deriv(&self, x: f64) -> f64 {
        -(x - self.mu) / (self.std * self.std)
    }
}

/// Uniform prior on an interval, with vanishing density outside
#[derive(Clone, Copy, Debug)]
pub struct UniformPrior {
    /// Interval start
    pub low: f64,
    /// Interval end
    pub high: f64,
}

impl UniformPrior {
    /// Uniform prior on `[low, high]`
    pub fn new(low: f64, high: f64) -> Self {
        UniformPrior { low, high }
    }
}

impl PriorDistribution for UniformPrior {
    fn ln_pdf(&self, x: f64) -> f64 {
        if x < self.low || x > self.high {
            f64::NEG_INFINITY
        } else {
            -(self.high - self.low).ln()
        }
    }

    fn ln_deriv(&self, _x: f64) -> f64 {
        0.0
    }
}

/// Generalized normal prior with shape parameter `v`
///
/// `ln pdf(x) = -((x - mu)/s)^(2v) - ln(s) + ln(0.52)`
#[derive(Clone, Copy, Debug)]
pub struct GenNormalPrior {
    /// Location
    pub mu: f64,
    /// Scale
    pub s: f64,
    /// Shape exponent (the density falls off as the 2v-th power)
    pub v: i32,
}

impl GenNormalPrior {
    /// Generalized normal prior with location `mu`, scale `s` and shape `v`
    pub fn new(mu: f64, s: f64, v: i32) -> Self {
        GenNormalPrior { mu, s, v }
    }

    /// Parameters chosen so the density has the given mean and variance
    pub fn from_mean_var(mean: f64, var: f64) -> Self {
        GenNormalPrior::new(mean, (var / 0.32).sqrt(), 2)
    }
}

impl PriorDistribution for GenNormalPrior {
    fn ln_pdf(&self, x: f64) -> f64 {
        let z = (x - self.mu) / self.s;
        -z.powi(2 * self.v) - self.s.ln() + 0.52_f64.ln()
    }

    fn ln_deriv(&self, x: f64) -> f64 {
        let p = 2 * self.v;
        -(p as f64) * (x - self.mu).powi(p - 1) / self.s.powi(p)
    }
}

/// Priors attached per hyperparameter name
#[derive(Debug, Default)]
pub struct PriorCollection {
    priors: BTreeMap<String, Vec<Box<dyn PriorDistribution>>>,
}

impl PriorCollection {
    /// An empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a prior to a hyperparameter name.
    ///
    /// For a vector hyperparameter, attach one prior per component (the last
    /// prior is reused when fewer priors than components are attached).
    pub fn add(mut self, name: &str, prior: impl PriorDistribution + 'static) -> Self {
        self.priors
            .entry(name.to_string())
            .or_default()
            .push(Box::new(prior));
        self
    }

    /// Whether any prior is attached
    pub fn is_empty(&self) -> bool {
        self.priors.is_empty()
    }

    /// Prior for the `component`-th entry of `name`, if any
    fn get(&self, name: &str, component: usize) -> Option<&dyn PriorDistribution> {
        self.priors
            .get(name)
            .and_then(|v| v.get(component.min(v.len().saturating_sub(1))))
            .map(|b| b.as_ref())
    }

    /// Sum of `-ln pdf` over the flat hyperparameter vector
    pub fn neg_ln_pdf(&self, theta: &Array1<f64>, index: &HpIndex) -> f64 {
        let mut total = 0.0;
        for (name, range) in index.iter() {
            for (k, i) in range.enumerate() {
                if let Some(p) = self.get(name, k) {
                    total -= p.ln_pdf(theta[i]);
                }
            }
        }
        total
    }

    /// Gradient of `-ln pdf` over the flat hyperparameter vector
    pub fn neg_ln_deriv(&self, theta: &Array1<f64>, index: &HpIndex) -> Array1<f64> {
        let mut grad = Array1::zeros(theta.len());
        for (name, range) in index.iter() {
            for (k, i) in range.enumerate() {
                if let Some(p) = self.get(name, k) {
                    grad[i] = -p.ln_deriv(theta[i]);
                }
            }
        }
        grad
    }

    /// Mean location of the prior for each component, used for educated starts
    pub fn means(&self, index: &HpIndex) -> Option<Array1<f64>> {
        if self.is_empty() {
            return None;
        }
        let mut means = Array1::zeros(index.dim());
        for (name, range) in index.iter() {
            for (k, i) in range.enumerate() {
                if let Some(p) = self.get(name, k) {
                    // crude mode estimate: where the log-density derivative vanishes,
                    // found by a short bisection around zero derivative
                    means[i] = prior_mode(p);
                }
            }
        }
        Some(means)
    }
}

/// Locate the mode of a unimodal prior by bisection on its log-derivative
fn prior_mode(p: &dyn PriorDistribution) -> f64 {
    let (mut lo, mut hi) = (-50.0, 50.0);
    for _ in 0..200 {
        let mid = 0.5 * (lo + hi);
        if p.ln_deriv(mid) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}
