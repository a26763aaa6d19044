//! Factorized likelihood objectives.
//!
//! These objectives eigendecompose the noise-free correlation matrix once
//! per length-scale candidate and then re-evaluate the loss across many
//! noise values in the fixed eigenbasis. With `R = U diag(lambda) U^T` the
//! solve matrix at relative noise `rho` is `U diag(lambda + rho) U^T`, so
//! the quadratic form and log determinant are sums over the spectrum and a
//! full noise line search costs one decomposition. The prefactor is profiled
//! in closed form; [`refine_solution`](ObjectiveFunction::refine_solution)
//! writes the profiled noise and prefactor back into the solution vector.

use ndarray::{Array1, Array2, ArrayView1};
use ndarray_stats::QuantileExt;

use linfa_linalg::eigh::*;
use linfa_linalg::svd::*;

use super::{Evaluation, ObjectiveFunction, Problem, NUGGET};
use crate::errors::{GpFitError, Result};
use crate::hyperparameters::Hyperparameters;
use crate::optimizers::Solution;

const LN_2PI: f64 = 1.837877066409345;

fn check_finite(theta: &Array1<f64>) -> Result<()> {
    if theta.iter().any(|v| !v.is_finite()) {
        return Err(GpFitError::InvalidHyperparameter(
            "non-finite hyperparameter vector".to_string(),
        ));
    }
    Ok(())
}

/// Line-search strategy over the noise hyperparameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NoiseMethod {
    /// Single uniform grid over the noise bounds
    Grid,
    /// Golden-section search over the noise bounds
    Golden,
    /// Repeatedly refined grid, zooming on the best cell each loop
    FineGrid {
        /// Number of refinement loops
        loops: usize,
    },
}

impl Default for NoiseMethod {
    fn default() -> Self {
        NoiseMethod::FineGrid { loops: 3 }
    }
}

/// Eigenbasis of the noise-free correlation matrix, reusable across noise
/// values.
pub struct EigenBasis {
    /// Eigenvalues of `R`
    pub eigenvalues: Array1<f64>,
    /// Eigenvectors of `R`, one per column
    pub vectors: Array2<f64>,
    /// Targets rotated into the eigenbasis, `U^T y`
    pub w: Array1<f64>,
}

impl EigenBasis {
    /// Symmetric eigendecomposition of the correlation at `theta`
    pub fn new(theta: &Array1<f64>, problem: &Problem) -> Result<Self> {
        check_finite(theta)?;
        let hp = Hyperparameters::from_vector(theta, problem.index)?;
        let r = problem.kernel.correlation(problem.x, problem.x, &hp)?;
        let (eigenvalues, vectors) = r.eigh_into()?;
        Ok(Self::from_parts(eigenvalues, vectors, problem.y))
    }

    /// Decomposition through SVD, which tolerates slightly indefinite
    /// correlation matrices better than the symmetric eigensolver.
    pub fn new_svd(theta: &Array1<f64>, problem: &Problem) -> Result<Self> {
        check_finite(theta)?;
        let hp = Hyperparameters::from_vector(theta, problem.index)?;
        let r = problem.kernel.correlation(problem.x, problem.x, &hp)?;
        let (u, s, _) = r.svd(true, false)?;
        let vectors = u.ok_or_else(|| {
            GpFitError::InvalidValueError("SVD did not return singular vectors".to_string())
        })?;
        Ok(Self::from_parts(s, vectors, problem.y))
    }

    fn from_parts(eigenvalues: Array1<f64>, vectors: Array2<f64>, y: ArrayView1<f64>) -> Self {
        let w = vectors.t().dot(&y);
        EigenBasis {
            eigenvalues,
            vectors,
            w,
        }
    }

    fn n(&self) -> usize {
        self.eigenvalues.len()
    }
}

/// Profiled log likelihood at one noise value in a fixed eigenbasis.
///
/// Returns the loss together with the profiled prefactor, or `None` when
/// the shifted spectrum is not positive.
pub fn evaluate_given_eigendecomposition(
    basis: &EigenBasis,
    theta_noise: f64,
    modification: bool,
) -> Option<(f64, f64)> {
    let rho = (2.0 * theta_noise).exp() + NUGGET;
    let n = basis.n() as f64;
    let mut quad = 0.0;
    let mut ln_det = 0.0;
    for k in 0..basis.n() {
        let d = basis.eigenvalues[k] + rho;
        if !(d > 0.0) {
            return None;
        }
        quad += basis.w[k] * basis.w[k] / d;
        ln_det += d.ln();
    }
    if !(quad > 0.0) {
        return None;
    }
    let denom = if modification { (n - 1.0).max(1.0) } else { n };
    let sf2 = quad / denom;
    let fun = 0.5 * n + 0.5 * n * sf2.ln() + 0.5 * ln_det + 0.5 * n * LN_2PI;
    Some((fun, 0.5 * sf2.ln()))
}

/// Scalar minimization of `f` over `[low, high]` per the noise method;
/// returns the best argument and value seen.
fn scan_noise(
    f: &dyn Fn(f64) -> f64,
    low: f64,
    high: f64,
    ngrid: usize,
    method: NoiseMethod,
) -> (f64, f64) {
    match method {
        NoiseMethod::Grid => grid_scan(f, low, high, ngrid),
        NoiseMethod::Golden => golden_scan(f, low, high, 1e-5),
        NoiseMethod::FineGrid { loops } => {
            let (mut lo, mut hi) = (low, high);
            let (mut best_t, mut best_f) = (0.5 * (low + high), f64::INFINITY);
            for _ in 0..loops.max(1) {
                let (t, v) = grid_scan(f, lo, hi, ngrid);
                if v < best_f {
                    best_t = t;
                    best_f = v;
                }
                let step = (hi - lo) / (ngrid.max(2) - 1) as f64;
                lo = (t - step).max(low);
                hi = (t + step).min(high);
            }
            (best_t, best_f)
        }
    }
}

fn grid_scan(f: &dyn Fn(f64) -> f64, low: f64, high: f64, ngrid: usize) -> (f64, f64) {
    let n = ngrid.max(2);
    let ts = Array1::linspace(low, high, n);
    let vals = ts.mapv(|t| f(t));
    match vals.argmin() {
        Ok(i) => (ts[i], vals[i]),
        Err(_) => (low, f64::INFINITY),
    }
}

fn golden_scan(f: &dyn Fn(f64) -> f64, low: f64, high: f64, tol: f64) -> (f64, f64) {
    let inv_phi = 0.5 * (5.0f64.sqrt() - 1.0);
    let (mut a, mut b) = (low, high);
    let mut c = b - inv_phi * (b - a);
    let mut d = a + inv_phi * (b - a);
    let (mut fc, mut fd) = (f(c), f(d));
    let mut iter = 0;
    while (b - a).abs() > tol && iter < 200 {
        if fc < fd {
            b = d;
            d = c;
            fd = fc;
            c = b - inv_phi * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + inv_phi * (b - a);
            fd = f(d);
        }
        iter += 1;
    }
    let mid = 0.5 * (a + b);
    (mid, f(mid))
}

/// Default noise bounds when none are configured
fn default_noise_bounds(n: usize) -> (f64, f64) {
    let low = 0.5 * (10.0 * n.max(2) as f64 * f64::EPSILON).ln();
    (low, 10.0f64.ln())
}

/// Evaluate priors at the search vector with the profiled noise and
/// prefactor substituted in.
fn prior_at(theta: &Array1<f64>, problem: &Problem, noise: f64, prefactor: f64) -> f64 {
    match problem.priors {
        None => 0.0,
        Some(priors) => {
            let mut full = theta.clone();
            if let Some(r) = problem.index.range("noise") {
                full[r.start] = noise;
            }
            if let Some(r) = problem.index.range("prefactor") {
                full[r.start] = prefactor;
            }
            priors.neg_ln_pdf(&full, problem.index)
        }
    }
}

/// Negative log likelihood with both the noise and the prefactor profiled
/// out through the eigenbasis.
///
/// Evaluation at a hyperparameter vector ignores the vector's noise and
/// prefactor entries: the noise is line-searched over the bounds in the
/// fixed eigenbasis and the prefactor follows in closed form. Gradients are
/// not available.
#[derive(Clone, Debug)]
pub struct FactorizedLogLikelihood {
    /// Divide by `n - 1` instead of `n` when profiling the prefactor
    pub modification: bool,
    /// Grid resolution of the noise line search
    pub ngrid: usize,
    /// Noise line-search strategy
    pub noise_method: NoiseMethod,
    /// Log-space noise bounds; data-derived defaults when absent
    pub noise_bounds: Option<(f64, f64)>,
}

impl Default for FactorizedLogLikelihood {
    fn default() -> Self {
        FactorizedLogLikelihood {
            modification: false,
            ngrid: 80,
            noise_method: NoiseMethod::default(),
            noise_bounds: None,
        }
    }
}

impl FactorizedLogLikelihood {
    fn best_noise(
        &self,
        basis: &EigenBasis,
        theta: &Array1<f64>,
        problem: &Problem,
    ) -> (f64, f64, f64) {
        let (low, high) = self
            .noise_bounds
            .unwrap_or_else(|| default_noise_bounds(basis.n()));
        let modification = self.modification;
        let f = |tn: f64| match evaluate_given_eigendecomposition(basis, tn, modification) {
            Some((fun, p)) => fun + prior_at(theta, problem, tn, p),
            None => f64::INFINITY,
        };
        let (tn, fun) = scan_noise(&f, low, high, self.ngrid, self.noise_method);
        let prefactor = evaluate_given_eigendecomposition(basis, tn, modification)
            .map(|(_, p)| p)
            .unwrap_or(0.0);
        (tn, prefactor, fun)
    }
}

impl ObjectiveFunction for FactorizedLogLikelihood {
    fn evaluate(&self, theta: &Array1<f64>, problem: &Problem, _jac: bool) -> Evaluation {
        match EigenBasis::new(theta, problem) {
            Ok(basis) => {
                let (_, _, fun) = self.best_noise(&basis, theta, problem);
                Evaluation { fun, jac: None }
            }
            Err(e) => {
                log::debug!("factorized evaluation failed: {}", e);
                Evaluation {
                    fun: f64::INFINITY,
                    jac: None,
                }
            }
        }
    }

    fn refine_solution(&self, solution: &mut Solution, problem: &Problem) {
        if let Ok(basis) = EigenBasis::new(&solution.x, problem) {
            let (tn, p, fun) = self.best_noise(&basis, &solution.x, problem);
            if let Some(r) = problem.index.range("noise") {
                solution.x[r.start] = tn;
            }
            if let Some(r) = problem.index.range("prefactor") {
                solution.x[r.start] = p;
            }
            solution.fun = fun;
        }
    }
}

/// [`FactorizedLogLikelihood`] backed by an SVD of the correlation matrix.
#[derive(Clone, Debug, Default)]
pub struct FactorizedLogLikelihoodSVD {
    /// Shared factorized configuration
    pub inner: FactorizedLogLikelihood,
}

impl ObjectiveFunction for FactorizedLogLikelihoodSVD {
    fn evaluate(&self, theta: &Array1<f64>, problem: &Problem, _jac: bool) -> Evaluation {
        match EigenBasis::new_svd(theta, problem) {
            Ok(basis) => {
                let (_, _, fun) = self.inner.best_noise(&basis, theta, problem);
                Evaluation { fun, jac: None }
            }
            Err(e) => {
                log::debug!("factorized SVD evaluation failed: {}", e);
                Evaluation {
                    fun: f64::INFINITY,
                    jac: None,
                }
            }
        }
    }

    fn refine_solution(&self, solution: &mut Solution, problem: &Problem) {
        if let Ok(basis) = EigenBasis::new_svd(&solution.x, problem) {
            let (tn, p, fun) = self.inner.best_noise(&basis, &solution.x, problem);
            if let Some(r) = problem.index.range("noise") {
                solution.x[r.start] = tn;
            }
            if let Some(r) = problem.index.range("prefactor") {
                solution.x[r.start] = p;
            }
            solution.fun = fun;
        }
    }
}

/// Geisser predictive probability with noise and prefactor profiled through
/// the eigenbasis.
#[derive(Clone, Debug)]
pub struct FactorizedGPP {
    /// Grid resolution of the noise line search
    pub ngrid: usize,
    /// Noise line-search strategy
    pub noise_method: NoiseMethod,
    /// Log-space noise bounds; data-derived defaults when absent
    pub noise_bounds: Option<(f64, f64)>,
}

impl Default for FactorizedGPP {
    fn default() -> Self {
        FactorizedGPP {
            ngrid: 80,
            noise_method: NoiseMethod::default(),
            noise_bounds: None,
        }
    }
}

impl FactorizedGPP {
    /// GPP loss and profiled prefactor at one noise value
    fn gpp_at(basis: &EigenBasis, theta_noise: f64) -> Option<(f64, f64)> {
        let rho = (2.0 * theta_noise).exp() + NUGGET;
        let n = basis.n();
        // alpha and diag(P) in the eigenbasis
        let mut alpha = Array1::zeros(n);
        let mut pdiag = Array1::zeros(n);
        for i in 0..n {
            let mut ai = 0.0;
            let mut pi = 0.0;
            for k in 0..n {
                let d = basis.eigenvalues[k] + rho;
                if !(d > 0.0) {
                    return None;
                }
                let uik = basis.vectors[[i, k]];
                ai += uik * basis.w[k] / d;
                pi += uik * uik / d;
            }
            alpha[i] = ai;
            pdiag[i] = pi;
        }
        if pdiag.iter().any(|&v| !(v > 0.0)) {
            return None;
        }
        let nf = n as f64;
        let mut scale = 0.0;
        for i in 0..n {
            scale += alpha[i] * alpha[i] / pdiag[i];
        }
        let sf2 = scale / nf;
        if !(sf2 > 0.0) {
            return None;
        }
        let mut fun = 0.0;
        for i in 0..n {
            fun += 0.5 * (sf2.ln() - pdiag[i].ln())
                + 0.5 * alpha[i] * alpha[i] / (sf2 * pdiag[i])
                + 0.5 * LN_2PI;
        }
        Some((fun / nf, 0.5 * sf2.ln()))
    }

    fn best_noise(
        &self,
        basis: &EigenBasis,
        theta: &Array1<f64>,
        problem: &Problem,
    ) -> (f64, f64, f64) {
        let (low, high) = self
            .noise_bounds
            .unwrap_or_else(|| default_noise_bounds(basis.n()));
        let f = |tn: f64| match Self::gpp_at(basis, tn) {
            Some((fun, p)) => fun + prior_at(theta, problem, tn, p),
            None => f64::INFINITY,
        };
        let (tn, fun) = scan_noise(&f, low, high, self.ngrid, self.noise_method);
        let prefactor = Self::gpp_at(basis, tn).map(|(_, p)| p).unwrap_or(0.0);
        (tn, prefactor, fun)
    }
}

impl ObjectiveFunction for FactorizedGPP {
    fn evaluate(&self, theta: &Array1<f64>, problem: &Problem, _jac: bool) -> Evaluation {
        match EigenBasis::new(theta, problem) {
            Ok(basis) => {
                let (_, _, fun) = self.best_noise(&basis, theta, problem);
                Evaluation { fun, jac: None }
            }
            Err(e) => {
                log::debug!("factorized GPP evaluation failed: {}", e);
                Evaluation {
                    fun: f64::INFINITY,
                    jac: None,
                }
            }
        }
    }

    fn refine_solution(&self, solution: &mut Solution, problem: &Problem) {
        if let Ok(basis) = EigenBasis::new(&solution.x, problem) {
            let (tn, p, fun) = self.best_noise(&basis, &solution.x, problem);
            if let Some(r) = problem.index.range("noise") {
                solution.x[r.start] = tn;
            }
            if let Some(r) = problem.index.range("prefactor") {
                solution.x[r.start] = p;
            }
            solution.fun = fun;
        }
    }
}
