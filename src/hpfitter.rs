//! Hyperparameter fitting orchestration.
//!
//! The [`HyperparameterFitter`] wires an objective, an optimizer and an
//! optional boundary policy together. It never touches a model's live
//! hyperparameters: the caller passes a working copy in and decides what to
//! do with the fitted result.

use ndarray::{Array1, ArrayView1, ArrayView2};

use crate::boundary::{Boundary, FittedTransform};
use crate::errors::Result;
use crate::hyperparameters::Hyperparameters;
use crate::kernels::Kernel;
use crate::objectives::{
    Evaluation, LogLikelihood, ObjectiveFunction, Problem, ProcessRecipe,
};
use crate::optimizers::{Lbfgs, Optimizer, Solution};
use crate::pdistributions::PriorCollection;

/// Fitted hyperparameters with the optimizer's diagnostic record.
#[derive(Clone, Debug)]
pub struct FitResult {
    /// Fitted hyperparameters in log space
    pub hp: Hyperparameters,
    /// Best solution found by the optimizer
    pub solution: Solution,
}

/// Objective, optimizer and boundary policy composed into one fitting step.
#[derive(Debug)]
pub struct HyperparameterFitter {
    /// Loss to minimize
    pub objective: Box<dyn ObjectiveFunction>,
    /// Search strategy
    pub optimizer: Box<dyn Optimizer>,
    /// Bounds/transformation policy; `None` runs unbounded
    pub boundary: Option<Boundary>,
}

impl Default for HyperparameterFitter {
    fn default() -> Self {
        HyperparameterFitter {
            objective: Box::new(LogLikelihood),
            optimizer: Box::new(Lbfgs::default()),
            boundary: Some(Boundary::Educated),
        }
    }
}

impl HyperparameterFitter {
    /// Fit the hyperparameters for the given training data.
    ///
    /// `y` holds residual targets in the extended layout. The initial set
    /// `hp0` is only read; the fitted values come back in the result.
    pub fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        kernel: &dyn Kernel,
        recipe: ProcessRecipe,
        hp0: &Hyperparameters,
        priors: Option<&PriorCollection>,
    ) -> Result<FitResult> {
        let (theta0, index) = hp0.to_vector();
        let problem = Problem {
            x: x.reborrow(),
            y: y.reborrow(),
            kernel,
            recipe,
            index: &index,
            priors,
        };
        let mut solution = match &self.boundary {
            None => self
                .optimizer
                .run(&*self.objective, &problem, &theta0, None),
            Some(Boundary::Transformed(tr)) => {
                let transform = tr.fit(x, y, &index)?;
                let wrapped = TransformedObjective {
                    inner: &*self.objective,
                    transform: &transform,
                };
                let t0 = transform.transform(&theta0);
                let t_bounds = transform.bounds();
                let sol_t = self
                    .optimizer
                    .run(&wrapped, &problem, &t0, Some(&t_bounds));
                unwrap_transformed(sol_t, &transform)
            }
            Some(boundary) => {
                let bounds = boundary.bounds(x, y, &index)?;
                self.optimizer
                    .run(&*self.objective, &problem, &theta0, Some(&bounds))
            }
        };
        self.objective.refine_solution(&mut solution, &problem);
        if !solution.success {
            log::warn!("hyperparameter search did not converge, keeping best candidate");
        }
        let hp = Hyperparameters::from_vector(&solution.x, &index)?;
        log::debug!("fitted hyperparameters: {} ({})", hp, solution);
        Ok(FitResult { hp, solution })
    }
}

/// Map a solution from the transformed space back to log space, including
/// the gradient through the chain rule.
fn unwrap_transformed(mut solution: Solution, transform: &FittedTransform) -> Solution {
    let t = solution.x.clone();
    solution.x = transform.retransform(&t);
    if let Some(jac_t) = solution.jac.take() {
        // jac_t = jac_theta * dtheta/dt per component
        let factor = transform.derivative_factor(&t);
        let jac: Array1<f64> = jac_t
            .iter()
            .zip(factor.iter())
            .map(|(j, f)| if f.abs() > 0.0 { j / f } else { 0.0 })
            .collect();
        solution.jac = Some(jac);
    }
    solution
}

/// Objective seen by the optimizer when a variable transformation is
/// active: evaluates the wrapped objective at the retransformed vector and
/// chain-rules the gradient.
#[derive(Debug)]
struct TransformedObjective<'a> {
    inner: &'a dyn ObjectiveFunction,
    transform: &'a FittedTransform,
}

impl ObjectiveFunction for TransformedObjective<'_> {
    fn evaluate(&self, t: &Array1<f64>, problem: &Problem, jac: bool) -> Evaluation {
        let theta = self.transform.retransform(t);
        let mut eval = self.inner.evaluate(&theta, problem, jac);
        if let Some(j) = eval.jac.take() {
            let factor = self.transform.derivative_factor(t);
            eval.jac = Some(&j * &factor);
        }
        eval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::VariableTransformation;
    use crate::kernels::SquaredExponential;
    use crate::objectives::{FactorizedLogLikelihood, MaximumLogLikelihood};
    use crate::optimizers::{FactorizedOptimizer, FunctionEvaluation};
    use ndarray::array;

    fn training_data() -> (ndarray::Array2<f64>, Array1<f64>) {
        let x = array![[0.0], [0.4], [0.9], [1.5], [2.2], [3.0], [3.7]];
        let y = x.column(0).mapv(|v: f64| (1.2 * v).sin() + 0.05 * v);
        (x, y)
    }

    #[test]
    fn test_fit_improves_objective() {
        let (x, y) = training_data();
        let kernel = SquaredExponential::new();
        let hp0 = Hyperparameters::default();
        let fitter = HyperparameterFitter::default();
        let result = fitter
            .fit(x.view(), y.view(), &kernel, ProcessRecipe::Gp, &hp0, None)
            .unwrap();
        let (theta0, index) = hp0.to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        let f0 = LogLikelihood.evaluate(&theta0, &problem, false).fun;
        assert!(result.solution.fun <= f0);
        assert_eq!(result.hp.len(), 3);
    }

    #[test]
    fn test_fit_does_not_mutate_initial_hyperparameters() {
        let (x, y) = training_data();
        let kernel = SquaredExponential::new();
        let hp0 = Hyperparameters::default();
        let before = hp0.to_vector().0;
        let fitter = HyperparameterFitter::default();
        fitter
            .fit(x.view(), y.view(), &kernel, ProcessRecipe::Gp, &hp0, None)
            .unwrap();
        assert_eq!(hp0.to_vector().0, before);
    }

    #[test]
    fn test_transformed_fit_returns_raw_space_values() {
        let (x, y) = training_data();
        let kernel = SquaredExponential::new();
        let hp0 = Hyperparameters::default();
        let fitter = HyperparameterFitter {
            objective: Box::new(LogLikelihood),
            optimizer: Box::new(Lbfgs::default()),
            boundary: Some(Boundary::Transformed(VariableTransformation::educated())),
        };
        let result = fitter
            .fit(x.view(), y.view(), &kernel, ProcessRecipe::Gp, &hp0, None)
            .unwrap();
        // Raw-space values, not (0, 1) coordinates
        let raw = Boundary::Educated
            .bounds(x.view(), y.view(), &hp0.to_vector().1)
            .unwrap();
        for (v, (low, high)) in result.solution.x.iter().zip(raw) {
            assert!(*v >= low - 1e-6 && *v <= high + 1e-6);
        }
    }

    #[test]
    fn test_factorized_fit_fills_profiled_components() {
        let (x, y) = training_data();
        let kernel = SquaredExponential::new();
        let mut hp0 = Hyperparameters::default();
        hp0.set_scalar("noise", 0.0).set_scalar("prefactor", 0.0);
        let fitter = HyperparameterFitter {
            objective: Box::new(FactorizedLogLikelihood::default()),
            optimizer: Box::new(FactorizedOptimizer::default()),
            boundary: Some(Boundary::Educated),
        };
        let result = fitter
            .fit(x.view(), y.view(), &kernel, ProcessRecipe::Gp, &hp0, None)
            .unwrap();
        // Profiled noise replaces the placeholder initial value.
        assert!(result.hp.require_scalar("noise").unwrap() < 0.0);
        assert!(result.solution.fun.is_finite());
    }

    fn wide_training_data() -> (ndarray::Array2<f64>, Array1<f64>) {
        let n = 20;
        let mut x = ndarray::Array2::zeros((n, 1));
        let mut y = Array1::zeros(n);
        for i in 0..n {
            let v = 6.0 * i as f64 / (n - 1) as f64;
            x[[i, 0]] = v;
            y[i] = (1.5 * v).sin() + 0.1 * v;
        }
        (x, y)
    }

    #[test]
    fn test_gp_fit_reaches_stationary_point() {
        let (x, y) = wide_training_data();
        let kernel = SquaredExponential::new();
        let mut hp0 = Hyperparameters::default();
        hp0.set_scalar("length", 0.7);
        let fitter = HyperparameterFitter {
            objective: Box::new(LogLikelihood),
            optimizer: Box::new(Lbfgs {
                tol: 1e-12,
                ..Default::default()
            }),
            boundary: Some(Boundary::Educated),
        };
        let result = fitter
            .fit(x.view(), y.view(), &kernel, ProcessRecipe::Gp, &hp0, None)
            .unwrap();
        assert!(result.solution.fun.is_finite());
        let (_, index) = hp0.to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        // Interior stationarity, unless a bound is active
        let bounds = Boundary::Educated.bounds(x.view(), y.view(), &index).unwrap();
        let g = LogLikelihood
            .evaluate(&result.solution.x, &problem, true)
            .jac
            .unwrap();
        for (k, ((v, grad), (low, high))) in result
            .solution
            .x
            .iter()
            .zip(g.iter())
            .zip(bounds)
            .enumerate()
        {
            let at_bound = (*v - low).abs() < 1e-6 || (*v - high).abs() < 1e-6;
            assert!(
                at_bound || grad.abs() < 1e-3,
                "component {} not stationary: grad {}",
                k,
                grad
            );
        }
    }

    #[test]
    fn test_tp_function_evaluation_yields_finite_loss_and_gradient() {
        let (x, y) = wide_training_data();
        let kernel = SquaredExponential::new();
        let hp0 = Hyperparameters::default();
        let fitter = HyperparameterFitter {
            objective: Box::new(LogLikelihood),
            optimizer: Box::new(FunctionEvaluation { jac: true }),
            boundary: None,
        };
        let result = fitter
            .fit(
                x.view(),
                y.view(),
                &kernel,
                ProcessRecipe::student_t(),
                &hp0,
                None,
            )
            .unwrap();
        assert!(result.solution.fun.is_finite());
        let jac = result.solution.jac.unwrap();
        assert!(jac.iter().all(|v| v.is_finite()));
        assert_eq!(result.solution.nfev, 1);
    }

    #[test]
    fn test_refinement_applies_with_function_evaluation() {
        let (x, y) = training_data();
        let kernel = SquaredExponential::new();
        let hp0 = Hyperparameters::default();
        let fitter = HyperparameterFitter {
            objective: Box::new(MaximumLogLikelihood::default()),
            optimizer: Box::new(FunctionEvaluation::default()),
            boundary: None,
        };
        let result = fitter
            .fit(x.view(), y.view(), &kernel, ProcessRecipe::Gp, &hp0, None)
            .unwrap();
        // The profiled prefactor lands in the result even without a search.
        let p0 = hp0.require_scalar("prefactor").unwrap();
        assert!(result.hp.require_scalar("prefactor").unwrap() != p0);
    }
}
