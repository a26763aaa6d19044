//! Leave-one-out cross-validation objectives.
//!
//! All three losses are built from the closed-form leave-one-out identities
//! of the solve matrix inverse `P = M^{-1}`: the held-out residual of
//! observation `i` is `alpha_i / P_ii` and its predictive variance is
//! `exp(2*prefactor) / P_ii`.

use ndarray::{Array1, Array2};

use super::{CholeskyCore, Evaluation, ObjectiveFunction, Problem};
use crate::optimizers::Solution;

const LN_2PI: f64 = 1.837877066409345;

/// Per-component derivatives of `alpha` and `diag(P)` for the components
/// that enter the solve matrix; `None` marks the prefactor.
type ComponentDerivs = Vec<Option<(Array1<f64>, Array1<f64>)>>;

fn component_derivatives(
    core: &CholeskyCore,
    p: &Array2<f64>,
    problem: &Problem,
) -> ComponentDerivs {
    let dim = problem.index.dim();
    let mut out: ComponentDerivs = vec![None; dim];
    for (name, mats) in &core.grads {
        if let Some(range) = problem.index.range(name) {
            for (c, dr) in mats.iter().enumerate() {
                let u = dr.dot(&core.alpha);
                let dalpha = -p.dot(&u);
                let b = p.dot(dr);
                // diag(P dM P) as row sums of the elementwise product
                let dpdiag = -(&b * p).sum_axis(ndarray::Axis(1));
                out[range.start + c] = Some((dalpha, dpdiag));
            }
        }
    }
    if let Some(range) = problem.index.range("noise") {
        if let Ok(noise) = core.hp.require_scalar("noise") {
            let scale = 2.0 * (2.0 * noise).exp();
            let dalpha = p.dot(&core.alpha).mapv(|v| -scale * v);
            let dpdiag = (p * p).sum_axis(ndarray::Axis(1)).mapv(|v| -scale * v);
            out[range.start] = Some((dalpha, dpdiag));
        }
    }
    out
}

fn loo_setup(
    theta: &Array1<f64>,
    problem: &Problem,
    jac: bool,
) -> Option<(CholeskyCore, Array2<f64>)> {
    let core = match CholeskyCore::compute(theta, problem, jac) {
        Ok(c) => c,
        Err(e) => {
            log::debug!("leave-one-out evaluation failed: {}", e);
            return None;
        }
    };
    let p = core.inverse().ok()?;
    if p.diag().iter().any(|&v| !(v > 0.0)) {
        return None;
    }
    Some((core, p))
}

/// Sum of squared leave-one-out residuals.
///
/// The loss is prefactor-free; with `modification` the prefactor that
/// matches the leave-one-out error scale is written into the solution by
/// [`refine_solution`](ObjectiveFunction::refine_solution).
#[derive(Clone, Copy, Debug, Default)]
pub struct LeaveOneOut {
    /// Re-estimate the prefactor from the held-out variances after fitting
    pub modification: bool,
}

impl ObjectiveFunction for LeaveOneOut {
    fn evaluate(&self, theta: &Array1<f64>, problem: &Problem, jac: bool) -> Evaluation {
        let dim = problem.index.dim();
        let Some((core, p)) = loo_setup(theta, problem, jac) else {
            return Evaluation::infinite(dim, jac);
        };
        let pdiag = p.diag().to_owned();
        let eps = &core.alpha / &pdiag;
        let fun = eps.mapv(|v| v * v).sum() + problem.neg_ln_prior(theta);
        let jacobian = if jac {
            let mut g = problem.neg_ln_prior_deriv(theta);
            for (k, derivs) in component_derivatives(&core, &p, problem).iter().enumerate() {
                if let Some((dalpha, dpdiag)) = derivs {
                    let mut acc = 0.0;
                    for i in 0..core.n {
                        let deps = dalpha[i] / pdiag[i] - eps[i] * dpdiag[i] / pdiag[i];
                        acc += 2.0 * eps[i] * deps;
                    }
                    g[k] += acc;
                }
            }
            Some(g)
        } else {
            None
        };
        Evaluation { fun, jac: jacobian }
    }

    fn refine_solution(&self, solution: &mut Solution, problem: &Problem) {
        if !self.modification {
            return;
        }
        if let Some(range) = problem.index.range("prefactor") {
            if let Some((core, p)) = loo_setup(&solution.x, problem, false) {
                let pdiag = p.diag();
                let mut s = 0.0;
                for i in 0..core.n {
                    s += core.alpha[i] * core.alpha[i] / pdiag[i];
                }
                if s > 0.0 {
                    solution.x[range.start] = 0.5 * (s / core.n as f64).ln();
                }
            }
        }
    }
}

/// Mean negative log predictive probability of the held-out observations
/// (Geisser's predictive probability).
#[derive(Clone, Copy, Debug, Default)]
pub struct GPP;

impl ObjectiveFunction for GPP {
    fn evaluate(&self, theta: &Array1<f64>, problem: &Problem, jac: bool) -> Evaluation {
        let dim = problem.index.dim();
        let Some((core, p)) = loo_setup(theta, problem, jac) else {
            return Evaluation::infinite(dim, jac);
        };
        let pf = match core.hp.require_scalar("prefactor") {
            Ok(v) => v,
            Err(_) => return Evaluation::infinite(dim, jac),
        };
        let em2p = (-2.0 * pf).exp();
        let n = core.n as f64;
        let pdiag = p.diag().to_owned();
        let mut fun = 0.0;
        for i in 0..core.n {
            let a2 = core.alpha[i] * core.alpha[i];
            fun += 0.5 * (2.0 * pf - pdiag[i].ln()) + 0.5 * em2p * a2 / pdiag[i] + 0.5 * LN_2PI;
        }
        let fun = fun / n + problem.neg_ln_prior(theta);
        let jacobian = if jac {
            let mut g = problem.neg_ln_prior_deriv(theta);
            for (k, derivs) in component_derivatives(&core, &p, problem).iter().enumerate() {
                if let Some((dalpha, dpdiag)) = derivs {
                    let mut acc = 0.0;
                    for i in 0..core.n {
                        let ai = core.alpha[i];
                        acc += -0.5 * dpdiag[i] / pdiag[i]
                            + 0.5
                                * em2p
                                * (2.0 * ai * dalpha[i] / pdiag[i]
                                    - ai * ai * dpdiag[i] / (pdiag[i] * pdiag[i]));
                    }
                    g[k] += acc / n;
                }
            }
            if let Some(range) = problem.index.range("prefactor") {
                let mut acc = 0.0;
                for i in 0..core.n {
                    acc += 1.0 - em2p * core.alpha[i] * core.alpha[i] / pdiag[i];
                }
                g[range.start] += acc / n;
            }
            Some(g)
        } else {
            None
        };
        Evaluation { fun, jac: jacobian }
    }
}

/// Mean squared leave-one-out error plus the mean held-out variance
/// (predictive error objective).
#[derive(Clone, Copy, Debug, Default)]
pub struct GPE;

impl ObjectiveFunction for GPE {
    fn evaluate(&self, theta: &Array1<f64>, problem: &Problem, jac: bool) -> Evaluation {
        let dim = problem.index.dim();
        let Some((core, p)) = loo_setup(theta, problem, jac) else {
            return Evaluation::infinite(dim, jac);
        };
        let pf = match core.hp.require_scalar("prefactor") {
            Ok(v) => v,
            Err(_) => return Evaluation::infinite(dim, jac),
        };
        let e2p = (2.0 * pf).exp();
        let n = core.n as f64;
        let pdiag = p.diag().to_owned();
        let mut fun = 0.0;
        for i in 0..core.n {
            let a2 = core.alpha[i] * core.alpha[i];
            fun += a2 / (pdiag[i] * pdiag[i]) + e2p / pdiag[i];
        }
        let fun = fun / n + problem.neg_ln_prior(theta);
        let jacobian = if jac {
            let mut g = problem.neg_ln_prior_deriv(theta);
            for (k, derivs) in component_derivatives(&core, &p, problem).iter().enumerate() {
                if let Some((dalpha, dpdiag)) = derivs {
                    let mut acc = 0.0;
                    for i in 0..core.n {
                        let ai = core.alpha[i];
                        let p2 = pdiag[i] * pdiag[i];
                        acc += 2.0 * ai * dalpha[i] / p2
                            - 2.0 * ai * ai * dpdiag[i] / (p2 * pdiag[i])
                            - e2p * dpdiag[i] / p2;
                    }
                    g[k] += acc / n;
                }
            }
            if let Some(range) = problem.index.range("prefactor") {
                let mut acc = 0.0;
                for i in 0..core.n {
                    acc += 2.0 * e2p / pdiag[i];
                }
                g[range.start] += acc / n;
            }
            Some(g)
        } else {
            None
        };
        Evaluation { fun, jac: jacobian }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperparameters::Hyperparameters;
    use crate::kernels::SquaredExponential;
    use crate::objectives::ProcessRecipe;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::array;

    fn problem_parts() -> (ndarray::Array2<f64>, Array1<f64>) {
        let x = array![[0.0], [0.5], [1.2], [2.0], [2.8], [3.5]];
        let y = x.column(0).mapv(|v: f64| (1.3 * v).cos() - 0.2 * v);
        (x, y)
    }

    fn check_gradient(objective: &dyn ObjectiveFunction, theta: Array1<f64>) {
        let (x, y) = problem_parts();
        let kernel = SquaredExponential::new();
        let (_, index) = Hyperparameters::default().to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        let analytic = objective.evaluate(&theta, &problem, true).jac.unwrap();
        let numeric =
            theta.central_diff(&|t: &Array1<f64>| objective.evaluate(t, &problem, false).fun);
        for k in 0..theta.len() {
            assert_abs_diff_eq!(analytic[k], numeric[k], epsilon = 1e-4);
        }
    }

    #[test]
    fn test_loo_gradient_matches_finite_difference() {
        check_gradient(&LeaveOneOut::default(), array![-0.4, -2.0, 0.3]);
    }

    #[test]
    fn test_gpp_gradient_matches_finite_difference() {
        check_gradient(&GPP, array![0.1, -3.0, -0.2]);
    }

    #[test]
    fn test_gpe_gradient_matches_finite_difference() {
        check_gradient(&GPE, array![-0.2, -2.5, 0.1]);
    }

    #[test]
    fn test_loo_prefactor_free() {
        let (x, y) = problem_parts();
        let kernel = SquaredExponential::new();
        let (_, index) = Hyperparameters::default().to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        let a = LeaveOneOut::default()
            .evaluate(&array![-0.4, -2.0, 0.0], &problem, false)
            .fun;
        let b = LeaveOneOut::default()
            .evaluate(&array![-0.4, -2.0, 2.0], &problem, false)
            .fun;
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }

    #[test]
    fn test_invalid_vector_rejected_as_infinite() {
        let (x, y) = problem_parts();
        let kernel = SquaredExponential::new();
        let (_, index) = Hyperparameters::default().to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        let bad = array![f64::NAN, -2.0, 0.0];
        for objective in [
            &LeaveOneOut::default() as &dyn ObjectiveFunction,
            &GPP,
            &GPE,
        ] {
            let eval = objective.evaluate(&bad, &problem, true);
            assert!(eval.fun.is_infinite() && eval.fun > 0.0);
            assert!(eval.jac.unwrap().iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_loo_refine_writes_prefactor() {
        let (x, y) = problem_parts();
        let kernel = SquaredExponential::new();
        let (_, index) = Hyperparameters::default().to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        let objective = LeaveOneOut { modification: true };
        let mut solution = Solution {
            fun: 0.0,
            x: array![-0.4, -2.0, 0.0],
            jac: None,
            success: true,
            nfev: 1,
        };
        objective.refine_solution(&mut solution, &problem);
        assert!(solution.x[2].is_finite());
        assert!(solution.x[2] != 0.0);
    }
}
