//! Global and stochastic optimization strategies.
//!
//! Every strategy here explores many candidates inside the bounds and
//! reports the best one, optionally polished by a nested local strategy.
//! Candidate evaluations are independent and side-effect free, so the grid
//! and random-sampling strategies fan them out over a worker pool and
//! combine with a min-reduction.

use ndarray::Array1;
use ndarray_rand::rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;

use super::linesearch::FineGridSearch;
use super::local::Lbfgs;
use super::{bounds_or_default, Optimizer, Solution};
use crate::boundary::FittedTransform;
use crate::objectives::{ObjectiveFunction, Problem};

/// Uniform random sampling inside the bounds, best candidate optionally
/// refined by a nested local strategy.
#[derive(Debug)]
pub struct RandomSamplingOptimizer {
    /// Number of sampled candidates
    pub npoints: usize,
    /// Sampling seed
    pub seed: u64,
    /// Local refinement of the best candidate
    pub local: Option<Box<dyn Optimizer>>,
}

impl Default for RandomSamplingOptimizer {
    fn default() -> Self {
        RandomSamplingOptimizer {
            npoints: 50,
            seed: 42,
            local: None,
        }
    }
}

impl Optimizer for RandomSamplingOptimizer {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let b = bounds_or_default(bounds, theta0.len());
        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed);
        let mut candidates = vec![theta0.clone()];
        for _ in 0..self.npoints {
            let point = b
                .iter()
                .map(|&(low, high)| {
                    if high > low {
                        rng.gen_range(low..high)
                    } else {
                        low
                    }
                })
                .collect::<Vec<_>>();
            candidates.push(Array1::from_vec(point));
        }
        let best = candidates
            .into_par_iter()
            .map(|x| Solution::evaluated(objective, problem, x, false))
            .reduce_with(Solution::merge)
            .expect("at least one candidate");
        match &self.local {
            Some(local) => {
                let refined = local.run(objective, problem, &best.x.clone(), bounds);
                best.merge(refined)
            }
            None => best,
        }
    }
}

/// Full cartesian grid over the bounds with a fixed resolution per
/// dimension, best cell optionally refined locally.
#[derive(Debug)]
pub struct GridOptimizer {
    /// Grid points per dimension
    pub n_each_dim: usize,
    /// Local refinement of the best cell
    pub local: Option<Box<dyn Optimizer>>,
}

impl Default for GridOptimizer {
    fn default() -> Self {
        GridOptimizer {
            n_each_dim: 5,
            local: None,
        }
    }
}

impl GridOptimizer {
    fn decode(&self, mut idx: usize, bounds: &[(f64, f64)]) -> Array1<f64> {
        let n = self.n_each_dim.max(2);
        let mut point = Array1::zeros(bounds.len());
        for (k, &(low, high)) in bounds.iter().enumerate() {
            let digit = idx % n;
            idx /= n;
            point[k] = low + (high - low) * digit as f64 / (n - 1) as f64;
        }
        point
    }
}

impl Optimizer for GridOptimizer {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let b = bounds_or_default(bounds, theta0.len());
        let n = self.n_each_dim.max(2);
        let total = n.pow(b.len() as u32);
        let best = (0..total)
            .into_par_iter()
            .map(|idx| Solution::evaluated(objective, problem, self.decode(idx, &b), false))
            .reduce_with(Solution::merge)
            .expect("at least one grid cell");
        match &self.local {
            Some(local) => {
                let refined = local.run(objective, problem, &best.x.clone(), bounds);
                best.merge(refined)
            }
            None => best,
        }
    }
}

/// Coordinate-descent over the bounds: each pass line-searches every
/// dimension in turn on a uniform grid while the others stay fixed.
#[derive(Debug)]
pub struct IterativeLineOptimizer {
    /// Number of full passes over the dimensions
    pub loops: usize,
    /// Grid points per dimension per pass
    pub ngrid: usize,
    /// Local refinement of the final point
    pub local: Option<Box<dyn Optimizer>>,
}

impl Default for IterativeLineOptimizer {
    fn default() -> Self {
        IterativeLineOptimizer {
            loops: 3,
            ngrid: 10,
            local: None,
        }
    }
}

impl Optimizer for IterativeLineOptimizer {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let b = bounds_or_default(bounds, theta0.len());
        let n = self.ngrid.max(2);
        let mut x = theta0.clone();
        let mut fun = objective.evaluate(&x, problem, false).fun;
        let mut nfev = 1;
        for _ in 0..self.loops.max(1) {
            for (k, &(low, high)) in b.iter().enumerate() {
                let mut best = (x[k], fun);
                for i in 0..n {
                    let v = low + (high - low) * i as f64 / (n - 1) as f64;
                    let mut trial = x.clone();
                    trial[k] = v;
                    let f = objective.evaluate(&trial, problem, false).fun;
                    nfev += 1;
                    if f < best.1 {
                        best = (v, f);
                    }
                }
                x[k] = best.0;
                fun = best.1;
            }
        }
        let swept = Solution {
            fun,
            x,
            jac: None,
            success: fun.is_finite(),
            nfev,
        };
        match &self.local {
            Some(local) => {
                let refined = local.run(objective, problem, &swept.x.clone(), bounds);
                swept.merge(refined)
            }
            None => swept,
        }
    }
}

/// Basin hopping: repeated local minimization from perturbed copies of the
/// current minimum with Metropolis acceptance between basins.
#[derive(Debug)]
pub struct BasinOptimizer {
    /// Number of hops
    pub niter: usize,
    /// Metropolis temperature between basins
    pub temperature: f64,
    /// Perturbation size as a fraction of the bounds width
    pub step: f64,
    /// Perturbation seed
    pub seed: u64,
    /// Local strategy run after every hop
    pub local: Box<dyn Optimizer>,
}

impl Default for BasinOptimizer {
    fn default() -> Self {
        BasinOptimizer {
            niter: 10,
            temperature: 1.0,
            step: 0.25,
            seed: 42,
            local: Box::new(Lbfgs::default()),
        }
    }
}

impl Optimizer for BasinOptimizer {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let b = bounds_or_default(bounds, theta0.len());
        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed);
        let mut current = self.local.run(objective, problem, theta0, bounds);
        let mut best = current.clone();
        let mut nfev = current.nfev;
        for _ in 0..self.niter {
            let trial_start: Array1<f64> = current
                .x
                .iter()
                .zip(&b)
                .map(|(&v, &(low, high))| {
                    let width = (high - low).max(1e-12);
                    (v + rng.gen_range(-1.0..1.0) * self.step * width).clamp(low, high)
                })
                .collect();
            let trial = self.local.run(objective, problem, &trial_start, bounds);
            nfev += trial.nfev;
            let accept = trial.fun < current.fun
                || rng.gen::<f64>() < (-(trial.fun - current.fun) / self.temperature).exp();
            if trial.fun < best.fun {
                best = trial.clone();
            }
            if accept {
                current = trial;
            }
        }
        best.nfev = nfev;
        best
    }
}

/// Simulated annealing with a geometric cooling schedule and bounded,
/// temperature-scaled moves.
#[derive(Clone, Copy, Debug)]
pub struct AnnealingOptimizer {
    /// Initial temperature
    pub t_initial: f64,
    /// Final temperature ending the schedule
    pub t_final: f64,
    /// Geometric cooling factor in `(0, 1)`
    pub cooling: f64,
    /// Moves attempted per temperature
    pub n_per_temp: usize,
    /// Move size as a fraction of the bounds width at full temperature
    pub step: f64,
    /// Move seed
    pub seed: u64,
}

impl Default for AnnealingOptimizer {
    fn default() -> Self {
        AnnealingOptimizer {
            t_initial: 10.0,
            t_final: 1e-4,
            cooling: 0.9,
            n_per_temp: 20,
            step: 0.3,
            seed: 42,
        }
    }
}

impl AnnealingOptimizer {
    fn anneal<F>(&self, x0: Array1<f64>, bounds: &[(f64, f64)], mut f: F) -> Solution
    where
        F: FnMut(&Array1<f64>) -> f64,
    {
        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed);
        let mut x = x0;
        let mut fx = f(&x);
        let mut best = (x.clone(), fx);
        let mut nfev = 1;
        let mut t = self.t_initial;
        while t > self.t_final {
            let frac = (t / self.t_initial).max(0.05);
            for _ in 0..self.n_per_temp {
                let trial: Array1<f64> = x
                    .iter()
                    .zip(bounds)
                    .map(|(&v, &(low, high))| {
                        let width = (high - low).max(1e-12);
                        (v + rng.gen_range(-1.0..1.0) * self.step * frac * width)
                            .clamp(low, high)
                    })
                    .collect();
                let ft = f(&trial);
                nfev += 1;
                let accept = ft < fx || rng.gen::<f64>() < (-(ft - fx) / t).exp();
                if ft < best.1 {
                    best = (trial.clone(), ft);
                }
                if accept {
                    x = trial;
                    fx = ft;
                }
            }
            t *= self.cooling;
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

impl Optimizer for AnnealingOptimizer {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let b = bounds_or_default(bounds, theta0.len());
        self.anneal(theta0.clone(), &b, |x| {
            objective.evaluate(x, problem, false).fun
        })
    }
}

/// Simulated annealing in the logistic-transformed space of the bounds,
/// where moves of fixed size cover the raw space non-uniformly and the
/// walls never reject a move.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnnealingTransOptimizer {
    /// Underlying annealing schedule
    pub inner: AnnealingOptimizer,
}

impl Optimizer for AnnealingTransOptimizer {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let b = bounds_or_default(bounds, theta0.len());
        let transform = FittedTransform::from_bounds(&b);
        let t_bounds = transform.bounds();
        let t0 = transform.transform(theta0);
        let mut solution = self.inner.anneal(t0, &t_bounds, |t| {
            objective.evaluate(&transform.retransform(t), problem, false).fun
        });
        solution.x = transform.retransform(&solution.x);
        solution
    }
}

/// Couples a diagonal line search over the length-scale with the closed-form
/// noise/prefactor profiling of the factorized objectives.
///
/// Only the `length` components move; every other component's bounds are
/// collapsed onto the initial vector, and the profiled values are written
/// into the solution afterwards.
#[derive(Debug)]
pub struct FactorizedOptimizer {
    /// Line-search strategy over the length axis
    pub line: Box<dyn Optimizer>,
}

impl Default for FactorizedOptimizer {
    fn default() -> Self {
        FactorizedOptimizer {
            line: Box::new(FineGridSearch::default()),
        }
    }
}

impl Optimizer for FactorizedOptimizer {
    fn run(
        &self,
        objective: &dyn ObjectiveFunction,
        problem: &Problem,
        theta0: &Array1<f64>,
        bounds: Option<&[(f64, f64)]>,
    ) -> Solution {
        let mut b = bounds_or_default(bounds, theta0.len());
        let length = problem.index.range("length");
        for (k, pair) in b.iter_mut().enumerate() {
            let movable = length.as_ref().map(|r| r.contains(&k)).unwrap_or(false);
            if !movable {
                *pair = (theta0[k], theta0[k]);
            }
        }
        let mut solution = self.line.run(objective, problem, theta0, Some(&b));
        objective.refine_solution(&mut solution, problem);
        solution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyperparameters::Hyperparameters;
    use crate::kernels::SquaredExponential;
    use crate::objectives::{
        Evaluation, FactorizedLogLikelihood, LogLikelihood, MaximumLogLikelihood, ProcessRecipe,
    };
    use crate::optimizers::CobylaOptimizer;
    use ndarray::array;

    fn problem_parts() -> (ndarray::Array2<f64>, Array1<f64>) {
        let x = array![[0.0], [0.4], [1.0], [1.7], [2.3], [3.0], [3.8]];
        let y = x.column(0).mapv(|v: f64| (1.4 * v).sin() + 0.2);
        (x, y)
    }

    const BOUNDS: [(f64, f64); 3] = [(-3.0, 3.0), (-8.0, 0.0), (-2.0, 4.0)];

    #[test]
    fn test_random_sampling_not_worse_than_start() {
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
        let solution = RandomSamplingOptimizer::default().run(
            &LogLikelihood,
            &problem,
            &theta0,
            Some(&BOUNDS),
        );
        assert!(solution.fun <= f0);
        assert!(solution.nfev >= 51);
    }

    #[test]
    fn test_grid_result_lies_on_grid_without_refinement() {
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
        let optimizer = GridOptimizer {
            n_each_dim: 5,
            local: None,
        };
        let solution = optimizer.run(&LogLikelihood, &problem, &theta0, Some(&BOUNDS));
        assert_eq!(solution.nfev, 125);
        for (v, &(low, high)) in solution.x.iter().zip(&BOUNDS) {
            let t = (v - low) / (high - low) * 4.0;
            assert!((t - t.round()).abs() < 1e-9);
        }
    }

    #[test]
    fn test_grid_refinement_improves_or_matches() {
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
        let plain = GridOptimizer::default().run(&LogLikelihood, &problem, &theta0, Some(&BOUNDS));
        let refined = GridOptimizer {
            n_each_dim: 5,
            local: Some(Box::new(Lbfgs::default())),
        }
        .run(&LogLikelihood, &problem, &theta0, Some(&BOUNDS));
        assert!(refined.fun <= plain.fun + 1e-12);
    }

    #[test]
    fn test_iterative_line_descends() {
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
        let solution = IterativeLineOptimizer::default().run(
            &LogLikelihood,
            &problem,
            &theta0,
            Some(&BOUNDS),
        );
        assert!(solution.fun <= f0);
    }

    #[test]
    fn test_basin_and_annealing_stay_in_bounds() {
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
        let basin = BasinOptimizer {
            niter: 3,
            ..Default::default()
        }
        .run(&LogLikelihood, &problem, &theta0, Some(&BOUNDS));
        let anneal = AnnealingOptimizer {
            t_final: 1.0,
            ..Default::default()
        }
        .run(&LogLikelihood, &problem, &theta0, Some(&BOUNDS));
        let anneal_t = AnnealingTransOptimizer {
            inner: AnnealingOptimizer {
                t_final: 1.0,
                ..Default::default()
            },
        }
        .run(&LogLikelihood, &problem, &theta0, Some(&BOUNDS));
        for solution in [basin, anneal, anneal_t] {
            assert!(solution.fun.is_finite());
            for (v, &(low, high)) in solution.x.iter().zip(&BOUNDS) {
                assert!(*v >= low - 1e-9 && *v <= high + 1e-9);
            }
        }
    }

    /// Parabola in the first component with an infinite wall over the
    /// negative half-line.
    #[derive(Debug)]
    struct WalledParabola;

    impl ObjectiveFunction for WalledParabola {
        fn evaluate(&self, theta: &Array1<f64>, _problem: &Problem, _jac: bool) -> Evaluation {
            let fun = if theta[0] < 0.0 {
                f64::INFINITY
            } else {
                (theta[0] - 1.0) * (theta[0] - 1.0)
            };
            Evaluation { fun, jac: None }
        }
    }

    #[test]
    fn test_infinite_candidates_never_selected_as_best() {
        // The starting point sits inside the infinite region, so the best
        // record must come from a finite candidate.
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
        let theta0 = array![-1.5];
        let bounds = [(-2.0, 2.0)];
        let random = RandomSamplingOptimizer::default().run(
            &WalledParabola,
            &problem,
            &theta0,
            Some(&bounds),
        );
        let grid = GridOptimizer {
            n_each_dim: 9,
            local: None,
        }
        .run(&WalledParabola, &problem, &theta0, Some(&bounds));
        for solution in [random, grid] {
            assert!(solution.fun.is_finite());
            assert!(solution.x[0] >= 0.0);
        }
    }

    #[test]
    fn test_factorized_matches_full_local_optimum() {
        // The 1-D factorized search with closed-form profiling must land at
        // the same likelihood as a multivariate search over length and
        // noise with the prefactor profiled.
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
        let factorized = FactorizedOptimizer {
            line: Box::new(crate::optimizers::FineGridSearch {
                loops: 4,
                ngrid: 100,
            }),
        };
        let objective = FactorizedLogLikelihood {
            ngrid: 150,
            noise_bounds: Some(BOUNDS[1]),
            ..Default::default()
        };
        let fact = factorized.run(&objective, &problem, &theta0, Some(&BOUNDS));
        let full = CobylaOptimizer {
            maxeval: 500,
            ..Default::default()
        }
        .run(&MaximumLogLikelihood::default(), &problem, &theta0, Some(&BOUNDS));
        assert!((fact.fun - full.fun).abs() < 0.1);
    }
}
