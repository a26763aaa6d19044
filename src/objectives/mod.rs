//! Objective functions for hyperparameter fitting.
//!
//! An [`ObjectiveFunction`] maps a flat log-space hyperparameter vector to a
//! scalar loss (and optionally its gradient) for a fixed training problem.
//! Marginal likelihood variants live in [`likelihood`], leave-one-out losses
//! in [`loo`] and eigendecomposition-based factorized losses in
//! [`factorized`].
//!
//! All objectives share the same covariance convention: the solve matrix is
//! `M = R(length) + (exp(2*noise) + nugget) * I` and the full covariance is
//! `exp(2*prefactor) * M`, so `noise` is relative to the prefactor. A failed
//! Cholesky factorization maps to an infinite loss rather than an error so
//! that optimizers can step past ill-conditioned regions.

pub mod factorized;
pub mod likelihood;
pub mod loo;

pub use factorized::{
    evaluate_given_eigendecomposition, EigenBasis, FactorizedGPP, FactorizedLogLikelihood,
    FactorizedLogLikelihoodSVD, NoiseMethod,
};
pub use likelihood::{LogLikelihood, MaximumLogLikelihood};
pub use loo::{LeaveOneOut, GPE, GPP};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::fmt;

use linfa_linalg::cholesky::*;
use linfa_linalg::triangular::*;

use crate::errors::{GpFitError, Result};
use crate::hyperparameters::{HpIndex, Hyperparameters};
use crate::kernels::Kernel;
use crate::optimizers::Solution;
use crate::pdistributions::PriorCollection;

/// Jitter added to the solve-matrix diagonal alongside the noise term
pub const NUGGET: f64 = 100.0 * f64::EPSILON;

/// Process family the objective evaluates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProcessRecipe {
    /// Gaussian process
    Gp,
    /// Student-t process with inverse-gamma hyperprior parameters `a`, `b`;
    /// the degrees of freedom are `2a + n`.
    StudentT { a: f64, b: f64 },
}

impl ProcessRecipe {
    /// Student-t recipe with the default weakly informative hyperprior
    pub fn student_t() -> Self {
        ProcessRecipe::StudentT { a: 1e-20, b: 1e-20 }
    }

    /// Degrees of freedom for `n` observations
    pub fn dof(&self, n: usize) -> f64 {
        match self {
            ProcessRecipe::Gp => f64::INFINITY,
            ProcessRecipe::StudentT { a, .. } => 2.0 * a + n as f64,
        }
    }
}

impl fmt::Display for ProcessRecipe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessRecipe::Gp => write!(f, "GP"),
            ProcessRecipe::StudentT { .. } => write!(f, "TP"),
        }
    }
}

/// Fixed training problem an objective is evaluated against.
///
/// `y` holds the prior-mean residual targets in the extended layout: value
/// observations first, then derivative observations sample-major.
pub struct Problem<'a> {
    /// Training features, one sample per row
    pub x: ArrayView2<'a, f64>,
    /// Residual targets in the extended layout
    pub y: ArrayView1<'a, f64>,
    /// Covariance kernel
    pub kernel: &'a dyn Kernel,
    /// Process family
    pub recipe: ProcessRecipe,
    /// Layout of the flat search vector
    pub index: &'a HpIndex,
    /// Optional hyperparameter priors
    pub priors: Option<&'a PriorCollection>,
}

impl<'a> Problem<'a> {
    /// Negative log prior density at `theta`, zero without priors
    pub fn neg_ln_prior(&self, theta: &Array1<f64>) -> f64 {
        self.priors
            .map(|p| p.neg_ln_pdf(theta, self.index))
            .unwrap_or(0.0)
    }

    /// Gradient of the negative log prior density, zero without priors
    pub fn neg_ln_prior_deriv(&self, theta: &Array1<f64>) -> Array1<f64> {
        self.priors
            .map(|p| p.neg_ln_deriv(theta, self.index))
            .unwrap_or_else(|| Array1::zeros(self.index.dim()))
    }
}

/// Loss value and optional gradient at a hyperparameter vector.
#[derive(Clone, Debug)]
pub struct Evaluation {
    /// Loss value; infinite when the covariance factorization failed
    pub fun: f64,
    /// Gradient aligned with the search vector, when requested and available
    pub jac: Option<Array1<f64>>,
}

impl Evaluation {
    /// Infinite loss with a zero gradient placeholder when `jac` is set
    pub fn infinite(dim: usize, jac: bool) -> Self {
        Evaluation {
            fun: f64::INFINITY,
            jac: if jac { Some(Array1::zeros(dim)) } else { None },
        }
    }
}

/// A scalar loss over log-space hyperparameters for a fixed problem.
pub trait ObjectiveFunction: Sync + Send + fmt::Debug {
    /// Loss at `theta`; the gradient is computed only when `jac` is set and
    /// the objective supports it.
    fn evaluate(&self, theta: &Array1<f64>, problem: &Problem, jac: bool) -> Evaluation;

    /// Rewrite profiled hyperparameters into a finished solution.
    ///
    /// Objectives that optimize some components analytically (profiled
    /// prefactor, factorized noise) override this to store those values in
    /// `solution.x`; the default keeps the solution as returned.
    fn refine_solution(&self, _solution: &mut Solution, _problem: &Problem) {}
}

/// Cholesky factorization of the solve matrix and derived quantities shared
/// by the non-factorized objectives.
pub(crate) struct CholeskyCore {
    pub hp: Hyperparameters,
    /// Lower Cholesky factor of `M`
    pub l: Array2<f64>,
    /// `M^{-1} y`
    pub alpha: Array1<f64>,
    /// `y^T M^{-1} y`
    pub a: f64,
    /// `sum ln L_ii`, half the log determinant of `M`
    pub half_ln_det: f64,
    /// Extended observation count (dimension of `M`)
    pub n: usize,
    /// Kernel hyperparameter gradients of `R`, per name and component
    pub grads: Vec<(String, Vec<Array2<f64>>)>,
}

impl CholeskyCore {
    pub(crate) fn compute(theta: &Array1<f64>, problem: &Problem, jac: bool) -> Result<Self> {
        if theta.iter().any(|v| !v.is_finite()) {
            return Err(GpFitError::InvalidHyperparameter(
                "non-finite hyperparameter vector".to_string(),
            ));
        }
        let hp = Hyperparameters::from_vector(theta, problem.index)?;
        let (mut m, grads) = problem.kernel.correlation_with_gradients(problem.x, &hp, jac)?;
        let noise2 = (2.0 * hp.require_scalar("noise")?).exp() + NUGGET;
        m.diag_mut().mapv_inplace(|v| v + noise2);
        let n = m.nrows();
        let l = m.cholesky()?;
        let yc = problem.y.to_owned().insert_axis(Axis(1));
        let z = l.solve_triangular(&yc, UPLO::Lower)?;
        let alpha = l
            .t()
            .solve_triangular(&z, UPLO::Upper)?
            .remove_axis(Axis(1));
        let a = problem.y.dot(&alpha);
        let half_ln_det = l.diag().mapv(f64::ln).sum();
        Ok(CholeskyCore {
            hp,
            l,
            alpha,
            a,
            half_ln_det,
            n,
            grads,
        })
    }

    /// `M^{-1}` from the stored factor
    pub(crate) fn inverse(&self) -> Result<Array2<f64>> {
        let eye = Array2::eye(self.n);
        let z = self.l.solve_triangular(&eye, UPLO::Lower)?;
        Ok(z.t().dot(&z))
    }
}

/// Per-component derivative contributions of the solve matrix `M`.
///
/// For each component `k` of the search vector, `trace[k] = tr(M^{-1} dM_k)`
/// and `quad[k] = alpha^T dM_k alpha`; components that do not enter `M` (the
/// prefactor) carry zeros and are handled by each objective directly.
pub(crate) struct GradientTerms {
    pub trace: Array1<f64>,
    pub quad: Array1<f64>,
}

pub(crate) fn gradient_terms(core: &CholeskyCore, problem: &Problem) -> Result<GradientTerms> {
    let dim = problem.index.dim();
    let mut trace = Array1::zeros(dim);
    let mut quad = Array1::zeros(dim);
    let p = core.inverse()?;
    for (name, mats) in &core.grads {
        if let Some(range) = problem.index.range(name) {
            for (c, dr) in mats.iter().enumerate() {
                let k = range.start + c;
                trace[k] = (&p * dr).sum();
                quad[k] = core.alpha.dot(&dr.dot(&core.alpha));
            }
        }
    }
    if let Some(range) = problem.index.range("noise") {
        let noise2 = (2.0 * core.hp.require_scalar("noise")?).exp();
        let k = range.start;
        trace[k] = 2.0 * noise2 * p.diag().sum();
        quad[k] = 2.0 * noise2 * core.alpha.dot(&core.alpha);
    }
    Ok(GradientTerms { trace, quad })
}
