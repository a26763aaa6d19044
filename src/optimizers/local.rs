//! Local optimization strategies.

use ndarray::Array1;
use ndarray_rand::rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::cell::Cell;

use super::{bounds_or_default, Optimizer, Solution};
use crate::objectives::{ObjectiveFunction, Problem};

/// Single objective evaluation at the initial vector, no search.
#[derive(Clone, Copy, Debug, Default)]
pub struct FunctionEvaluation {
    /// Request the gradient alongside the value
    pub jac: bool,
}

impl Optimizer for FunctionEvaluation {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        _bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        Solution::evaluated(objective, problem, theta0.clone(), self.jac)
    }
}

/// Limited-memory BFGS with projection onto the bounds.
///
/// Uses the objective's analytic gradient when available, otherwise central
/// finite differences. Step lengths come from Armijo backtracking; the run
/// converges when the gradient infinity norm drops below `tol`.
#[derive(Clone, Copy, Debug)]
pub struct Lbfgs {
    /// Iteration budget
    pub maxiter: usize,
    /// Gradient infinity-norm convergence tolerance
    pub tol: f64,
    /// Number of curvature pairs kept for the two-loop recursion
    pub memory: usize,
    /// Ask the objective for analytic gradients
    pub use_jac: bool,
}

impl Default for Lbfgs {
    fn default() -> Self {
        Lbfgs {
            maxiter: 500,
            tol: 1e-8,
            memory: 10,
            use_jac: true,
        }
    }
}

impl Lbfgs {
    fn gradient(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        x: &Array1<f64>,
        nfev: &mut usize,
    ) -> (f64, Array1<f64>) {
        if self.use_jac {
            let eval = objective.evaluate(x, problem, true);
            *nfev += 1;
            if let Some(jac) = eval.jac {
                return (eval.fun, jac);
            }
        }
        let f0 = objective.evaluate(x, problem, false).fun;
        *nfev += 1;
        let h = 1e-6;
        let mut g = Array1::zeros(x.len());
        for k in 0..x.len() {
            let mut xp = x.clone();
            xp[k] += h;
            let mut xm = x.clone();
            xm[k] -= h;
            let fp = objective.evaluate(&xp, problem, false).fun;
            let fm = objective.evaluate(&xm, problem, false).fun;
            *nfev += 2;
            g[k] = (fp - fm) / (2.0 * h);
        }
        (f0, g)
    }
}

fn project(x: &mut Array1<f64>, bounds: Option<&[(f64, f64)]>) {
    if let Some(bounds) = bounds {
        for (v, &(low, high)) in x.iter_mut().zip(bounds) {
            *v = v.clamp(low, high);
        }
    }
}

impl Optimizer for Lbfgs {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let mut nfev = 0;
        let mut x = theta0.clone();
        project(&mut x, bounds);
        let (mut f, mut g) = self.gradient(objective, problem, &x, &mut nfev);
        if !f.is_finite() {
            return Solution {
                fun: f,
                x,
                jac: Some(g),
                success: false,
                nfev,
            };
        }
        let mut s_hist: Vec<Array1<f64>> = Vec::new();
        let mut y_hist: Vec<Array1<f64>> = Vec::new();
        let mut success = false;
        for _ in 0..self.maxiter {
            if g.iter().all(|v| v.abs() < self.tol) {
                success = true;
                break;
            }
            // Two-loop recursion
            let mut q = g.clone();
            let m = s_hist.len();
            let mut alphas = vec![0.0; m];
            for i in (0..m).rev() {
                let rho = 1.0 / y_hist[i].dot(&s_hist[i]);
                alphas[i] = rho * s_hist[i].dot(&q);
                q = &q - &(&y_hist[i] * alphas[i]);
            }
            if m > 0 {
                let last = m - 1;
                let gamma = s_hist[last].dot(&y_hist[last]) / y_hist[last].dot(&y_hist[last]);
                q.mapv_inplace(|v| v * gamma);
            }
            for i in 0..m {
                let rho = 1.0 / y_hist[i].dot(&s_hist[i]);
                let beta = rho * y_hist[i].dot(&q);
                q = &q + &(&s_hist[i] * (alphas[i] - beta));
            }
            let mut d = -q;
            let mut slope = g.dot(&d);
            if slope >= 0.0 {
                d = -g.clone();
                slope = g.dot(&d);
            }
            // Armijo backtracking
            let mut alpha = 1.0;
            let mut accepted = None;
            for _ in 0..25 {
                let mut xn = &x + &(&d * alpha);
                project(&mut xn, bounds);
                let fn_ = objective.evaluate(&xn, problem, false).fun;
                nfev += 1;
                if fn_.is_finite() && fn_ <= f + 1e-4 * alpha * slope {
                    accepted = Some((xn, fn_));
                    break;
                }
                alpha *= 0.5;
            }
            let Some((xn, fn_)) = accepted else {
                success = g.iter().all(|v| v.abs() < 1e-4);
                break;
            };
            let (_, gn) = self.gradient(objective, problem, &xn, &mut nfev);
            let s = &xn - &x;
            let yv = &gn - &g;
            if s.dot(&yv) > 1e-12 {
                s_hist.push(s);
                y_hist.push(yv);
                if s_hist.len() > self.memory {
                    s_hist.remove(0);
                    y_hist.remove(0);
                }
            }
            x = xn;
            f = fn_;
            g = gn;
        }
        Solution {
            fun: f,
            x,
            jac: Some(g),
            success,
            nfev,
        }
    }
}

/// Derivative-free COBYLA local search.
#[derive(Clone, Copy, Debug)]
pub struct CobylaOptimizer {
    /// Evaluation budget
    pub maxeval: usize,
    /// Initial trust-region radius
    pub rhobeg: f64,
    /// Relative function-value stopping tolerance
    pub ftol_rel: f64,
}

impl Default for CobylaOptimizer {
    fn default() -> Self {
        CobylaOptimizer {
            maxeval: 200,
            rhobeg: 0.5,
            ftol_rel: 1e-4,
        }
    }
}

impl Optimizer for CobylaOptimizer {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        use cobyla::{minimize, Func, RhoBeg, StopTols};

        let bounds = bounds_or_default(bounds, theta0.len());
        let cons: Vec<&dyn Func<()>> = vec![];
        let param0 = theta0.to_vec();
        let nfev = Cell::new(0usize);
        let objfn = |x: &[f64], _u: &mut ()| {
            nfev.set(nfev.get() + 1);
            let theta = Array1::from_vec(x.to_vec());
            objective.evaluate(&theta, problem, false).fun
        };
        match minimize(
            objfn,
            &param0,
            &bounds,
            &cons,
            (),
            self.maxeval,
            RhoBeg::All(self.rhobeg),
            Some(StopTols {
                ftol_rel: self.ftol_rel,
                ..StopTols::default()
            }),
        ) {
            Ok((_, x_opt, fval)) => {
                let fun = if fval.is_nan() { f64::INFINITY } else { fval };
                Solution {
                    fun,
                    x: Array1::from_vec(x_opt),
                    jac: None,
                    success: fun.is_finite(),
                    nfev: nfev.get(),
                }
            }
            Err((status, x_opt, _)) => {
                log::warn!("COBYLA failed with status={status:?}");
                Solution {
                    fun: f64::INFINITY,
                    x: Array1::from_vec(x_opt),
                    jac: None,
                    success: false,
                    nfev: nfev.get(),
                }
            }
        }
    }
}

/// Multistart wrapper running an inner local strategy from the initial
/// vector plus uniform samples inside the bounds, keeping the best run.
/// Starts are evaluated in parallel.
#[derive(Debug)]
pub struct GuessStartOptimizer {
    /// Local strategy run from every start
    pub inner: Box<dyn Optimizer>,
    /// Number of sampled starts besides the initial vector
    pub n_guesses: usize,
    /// Sampling seed
    pub seed: u64,
}

impl GuessStartOptimizer {
    /// Multistart around a default L-BFGS inner strategy
    pub fn new(n_guesses: usize) -> Self {
        GuessStartOptimizer {
            inner: Box::new(Lbfgs::default()),
            n_guesses,
            seed: 42,
        }
    }
}

impl Optimizer for GuessStartOptimizer {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let b = bounds_or_default(bounds, theta0.len());
        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed);
        let mut starts = vec![theta0.clone()];
        for _ in 0..self.n_guesses {
            let guess = b
                .iter()
                .map(|&(low, high)| {
                    if high > low {
                        rng.gen_range(low..high)
                    } else {
                        low
                    }
                })
                .collect::<Vec<_>>();
            starts.push(Array1::from_vec(guess));
        }
        starts
            .into_par_iter()
            .map(|start| self.inner.run(objective, problem, &start, bounds))
            .reduce_with(Solution::merge)
            .expect("at least one start")
    }
}

/// Local search started from the modes of the hyperparameter priors when
/// present, merged with a run from the initial vector.
#[derive(Debug)]
pub struct PriorStartOptimizer {
    /// Local strategy run from each start
    pub inner: Box<dyn Optimizer>,
}

impl Default for PriorStartOptimizer {
    fn default() -> Self {
        PriorStartOptimizer {
            inner: Box::new(Lbfgs::default()),
        }
    }
}

impl Optimizer for PriorStartOptimizer {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let base = self.inner.run(objective, problem, theta0, bounds);
        let prior_start = problem.priors.and_then(|p| p.means(problem.index));
        match prior_start {
            Some(start) if start.len() == theta0.len() => {
                let other = self.inner.run(objective, problem, &start, bounds);
                base.merge(other)
            }
            _ => base,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperparameters::Hyperparameters;
    use crate::kernels::SquaredExponential;
    use crate::objectives::{LogLikelihood, ProcessRecipe};
    use ndarray::array;

    fn problem_parts() -> (ndarray::Array2<f64>, Array1<f64>) {
        let x = array![[0.0], [0.5], [1.1], [1.8], [2.6], [3.3], [4.0]];
        let y = x.column(0).mapv(|v: f64| (1.1 * v).sin());
        (x, y)
    }

    #[test]
    fn test_function_evaluation_is_single_call() {
        let (x, y) = problem_parts();
        let kernel = SquaredExponential::new();
        let (theta0, index) = Hyperparameters::default().to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        let solution = FunctionEvaluation { jac: true }.run(&LogLikelihood, &problem, &theta0, None);
        assert_eq!(solution.nfev, 1);
        assert!(solution.fun.is_finite());
        assert!(solution.jac.is_some());
    }

    #[test]
    fn test_lbfgs_improves_on_start() {
        let (x, y) = problem_parts();
        let kernel = SquaredExponential::new();
        let (theta0, index) = Hyperparameters::default().to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        let f0 = LogLikelihood.evaluate(&theta0, &problem, false).fun;
        let solution = Lbfgs::default().run(&LogLikelihood, &problem, &theta0, None);
        assert!(solution.fun <= f0);
        // Stationarity at the returned point
        let g = solution.jac.unwrap();
        assert!(g.iter().all(|v| v.abs() < 1e-3));
    }

    #[test]
    fn test_lbfgs_respects_bounds() {
        let (x, y) = problem_parts();
        let kernel = SquaredExponential::new();
        let (theta0, index) = Hyperparameters::default().to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        let bounds = [(-1.0, 1.0), (-5.0, -1.0), (-1.0, 1.0)];
        let solution = Lbfgs::default().run(&LogLikelihood, &problem, &theta0, Some(&bounds));
        for (v, &(low, high)) in solution.x.iter().zip(&bounds) {
            assert!(*v >= low && *v <= high);
        }
    }

    #[test]
    fn test_cobyla_improves_on_start() {
        let (x, y) = problem_parts();
        let kernel = SquaredExponential::new();
        let (theta0, index) = Hyperparameters::default().to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        let f0 = LogLikelihood.evaluate(&theta0, &problem, false).fun;
        let solution =
            CobylaOptimizer::default().run(&LogLikelihood, &problem, &theta0, None);
        assert!(solution.fun <= f0);
        assert!(solution.nfev > 1);
    }

    #[test]
    fn test_multistart_not_worse_than_single_run() {
        let (x, y) = problem_parts();
        let kernel = SquaredExponential::new();
        let (theta0, index) = Hyperparameters::default().to_vector();
        let problem = Problem {
            x: x.view(),
            y: y.view(),
            kernel: &kernel,
            recipe: ProcessRecipe::Gp,
            index: &index,
            priors: None,
        };
        let bounds = [(-3.0, 3.0), (-8.0, 0.0), (-2.0, 4.0)];
        let single = Lbfgs::default().run(&LogLikelihood, &problem, &theta0, Some(&bounds));
        let multi = GuessStartOptimizer::new(3).run(&LogLikelihood, &problem, &theta0, Some(&bounds));
        assert!(multi.fun <= single.fun + 1e-9);
    }
}
