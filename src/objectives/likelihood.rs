//! Marginal likelihood objectives for GP and Student-t processes.

use ndarray::Array1;

use super::{
    gradient_terms, CholeskyCore, Evaluation, ObjectiveFunction, Problem, ProcessRecipe,
};
use crate::optimizers::Solution;

const LN_2PI: f64 = 1.837877066409345;

/// Negative log marginal likelihood.
///
/// For the Gaussian process this is the exact marginal likelihood of the
/// targets; for the Student-t process the multivariate-t likelihood with
/// `2a + n` degrees of freedom. Gradients are analytic for every
/// hyperparameter.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogLikelihood;

impl ObjectiveFunction for LogLikelihood {
    fn evaluate(&self, theta: &Array1<f64>, problem: &Problem, jac: bool) -> Evaluation {
        let dim = problem.index.dim();
        let core = match CholeskyCore::compute(theta, problem, jac) {
            Ok(c) => c,
            Err(e) => {
                log::debug!("likelihood evaluation failed: {}", e);
                return Evaluation::infinite(dim, jac);
            }
        };
        let p = match core.hp.require_scalar("prefactor") {
            Ok(p) => p,
            Err(_) => return Evaluation::infinite(dim, jac),
        };
        let n = core.n as f64;
        let beta = core.a * (-2.0 * p).exp();
        let (fun, weight) = match problem.recipe {
            ProcessRecipe::Gp => {
                let fun = 0.5 * beta + n * p + core.half_ln_det + 0.5 * n * LN_2PI;
                (fun, 1.0)
            }
            ProcessRecipe::StudentT { a, .. } => {
                let nu = 2.0 * a + n;
                if nu <= 2.0 {
                    return Evaluation::infinite(dim, jac);
                }
                let fun = n * p
                    + core.half_ln_det
                    + 0.5 * (nu + n) * (1.0 + beta / (nu - 2.0)).ln()
                    + 0.5 * n * ((nu - 2.0) * std::f64::consts::PI).ln()
                    - libm::lgamma(0.5 * (nu + n))
                    + libm::lgamma(0.5 * nu);
                (fun, (nu + n) / (nu - 2.0 + beta))
            }
        };
        let fun = fun + problem.neg_ln_prior(theta);
        let jacobian = if jac {
            match gradient_terms(&core, problem) {
                Ok(terms) => {
                    let e2p = (-2.0 * p).exp();
                    let mut g = Array1::zeros(dim);
                    for k in 0..dim {
                        g[k] = 0.5 * (terms.trace[k] - weight * e2p * terms.quad[k]);
                    }
                    if let Some(range) = problem.index.range("prefactor") {
                        g[range.start] = n - weight * beta;
                    }
                    Some(g + problem.neg_ln_prior_deriv(theta))
                }
                Err(_) => return Evaluation::infinite(dim, true),
            }
        } else {
            None
        };
        Evaluation { fun, jac: jacobian }
    }
}

/// Negative log likelihood with the prefactor profiled out analytically.
///
/// The optimal prefactor `exp(2p*) = y^T M^{-1} y / n` is substituted into
/// the Gaussian likelihood, so the search effectively runs over length and
/// noise only; the prefactor gradient component is zero and
/// [`refine_solution`](ObjectiveFunction::refine_solution) stores the
/// profiled value. With `modification` the divisor is `n - 1`, the unbiased
/// variant.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaximumLogLikelihood {
    /// Divide by `n - 1` instead of `n` when profiling the prefactor
    pub modification: bool,
}

impl MaximumLogLikelihood {
    fn denominator(&self, n: f64) -> f64 {
        if self.modification {
            (n - 1.0).max(1.0)
        } else {
            n
        }
    }
}

impl ObjectiveFunction for MaximumLogLikelihood {
    fn evaluate(&self, theta: &Array1<f64>, problem: &Problem, jac: bool) -> Evaluation {
        let dim = problem.index.dim();
        let core = match CholeskyCore::compute(theta, problem, jac) {
            Ok(c) => c,
            Err(e) => {
                log::debug!("profiled likelihood evaluation failed: {}", e);
                return Evaluation::infinite(dim, jac);
            }
        };
        let n = core.n as f64;
        if core.a <= 0.0 {
            return Evaluation::infinite(dim, jac);
        }
        let sf2 = core.a / self.denominator(n);
        let fun = 0.5 * n
            + 0.5 * n * sf2.ln()
            + core.half_ln_det
            + 0.5 * n * LN_2PI
            + problem.neg_ln_prior(theta);
        let jacobian = if jac {
            match gradient_terms(&core, problem) {
                Ok(terms) => {
                    let mut g = Array1::zeros(dim);
                    for k in 0..dim {
                        g[k] = 0.5 * (terms.trace[k] - (n / core.a) * terms.quad[k]);
                    }
                    if let Some(range) = problem.index.range("prefactor") {
                        g[range.start] = 0.0;
                    }
                    Some(g + problem.neg_ln_prior_deriv(theta))
                }
                Err(_) => return Evaluation::infinite(dim, true),
            }
        } else {
            None
        };
        Evaluation { fun, jac: jacobian }
    }

    fn refine_solution(&self, solution: &mut Solution, problem: &Problem) {
        if let Some(range) = problem.index.range("prefactor") {
            if let Ok(core) = CholeskyCore::compute(&solution.x, problem, false) {
                if core.a > 0.0 {
                    let n = core.n as f64;
                    solution.x[range.start] = 0.5 * (core.a / self.denominator(n)).ln();
                }
            }
        }
    }
}
