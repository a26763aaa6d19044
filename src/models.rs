//! Gaussian and Student-t process regression models.
//!
//! A [`Process`] owns a kernel, a prior mean and the live hyperparameters.
//! Training factorizes the regularized covariance at the current
//! hyperparameters and caches the factor; any hyperparameter change drops
//! the cache. [`GaussianProcess`] and [`StudentTProcess`] are thin fronts
//! selecting the process family.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::ops::{Deref, DerefMut};

use linfa_linalg::{cholesky::*, triangular::*};

use crate::errors::{GpFitError, Result};
use crate::hpfitter::{FitResult, HyperparameterFitter};
use crate::hyperparameters::Hyperparameters;
use crate::kernels::Kernel;
use crate::means::PriorMean;
use crate::objectives::{CholeskyCore, Problem, ProcessRecipe};
use crate::pdistributions::PriorCollection;

/// Cached factorization and training data of a trained process
struct TrainedState {
    x: Array2<f64>,
    /// Lower Cholesky factor of the solve matrix
    l: Array2<f64>,
    /// Solve-matrix weights of the residual targets
    alpha: Array1<f64>,
    /// Prior mean subtracted from the value targets
    baseline: f64,
    /// `exp(2 * prefactor)`
    prefactor2: f64,
    /// Student-t variance inflation, `1` for the Gaussian process
    variance_scale: f64,
}

/// Shared regression machinery of both process families.
pub struct Process {
    kernel: Box<dyn Kernel>,
    recipe: ProcessRecipe,
    prior_mean: PriorMean,
    hp: Hyperparameters,
    priors: Option<PriorCollection>,
    trained: Option<TrainedState>,
}

impl Process {
    fn new(kernel: Box<dyn Kernel>, recipe: ProcessRecipe) -> Self {
        Process {
            kernel,
            recipe,
            prior_mean: PriorMean::default(),
            hp: Hyperparameters::default(),
            priors: None,
            trained: None,
        }
    }

    /// Replace the prior mean policy; drops any trained state.
    pub fn set_prior_mean(&mut self, mean: PriorMean) {
        self.prior_mean = mean;
        self.trained = None;
    }

    /// Replace the hyperparameters; drops any trained state.
    pub fn set_hyperparameters(&mut self, hp: Hyperparameters) {
        self.hp = hp;
        self.trained = None;
    }

    /// Attach hyperparameter priors used during fitting.
    pub fn set_priors(&mut self, priors: PriorCollection) {
        self.priors = Some(priors);
    }

    /// Current hyperparameters in log space
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hp
    }

    /// Whether a factorization is cached
    pub fn is_trained(&self) -> bool {
        self.trained.is_some()
    }

    fn check_targets(&self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<()> {
        let expected = x.nrows() * self.kernel.block_dim(x.ncols());
        if y.len() != expected {
            return Err(GpFitError::DimensionMismatch {
                what: "targets".to_string(),
                expected,
                actual: y.len(),
            });
        }
        Ok(())
    }

    /// Build and cache the factorization at the current hyperparameters.
    ///
    /// `y` is in the extended layout: the value of every sample first, then
    /// derivative components sample-major when the kernel uses derivatives.
    /// Fails with [`GpFitError::NotPositiveDefinite`] when the regularized
    /// covariance cannot be factorized.
    pub fn train(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<()> {
        self.check_targets(x, y)?;
        let n_values = x.nrows();
        let (residual, baseline) = self.prior_mean.residual(&y, n_values);
        let (theta, index) = self.hp.to_vector();
        let problem = Problem {
            x: x.reborrow(),
            y: residual.view(),
            kernel: &*self.kernel,
            recipe: self.recipe,
            index: &index,
            priors: None,
        };
        let core = CholeskyCore::compute(&theta, &problem, false).map_err(|e| {
            GpFitError::NotPositiveDefinite(format!(
                "covariance factorization failed during training: {}",
                e
            ))
        })?;
        let p = self.hp.require_scalar("prefactor")?;
        let prefactor2 = (2.0 * p).exp();
        let variance_scale = match self.recipe {
            ProcessRecipe::Gp => 1.0,
            ProcessRecipe::StudentT { a, b } => {
                let n = core.n as f64;
                let nu = 2.0 * a + n;
                if nu <= 2.0 {
                    return Err(GpFitError::InvalidValueError(
                        "Student-t process needs more than two observations".to_string(),
                    ));
                }
                let beta = core.a * (-2.0 * p).exp();
                (2.0 * b + beta) / (nu - 2.0)
            }
        };
        self.trained = Some(TrainedState {
            x: x.to_owned(),
            l: core.l,
            alpha: core.alpha,
            baseline,
            prefactor2,
            variance_scale,
        });
        Ok(())
    }

    /// Fit the hyperparameters with `fitter` and adopt them.
    ///
    /// With `retrain` the model is trained at the fitted hyperparameters
    /// before returning; without it the model is left untrained and the
    /// caller picks the moment to train.
    pub fn optimize(
        &mut self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        fitter: &HyperparameterFitter,
        retrain: bool,
    ) -> Result<FitResult> {
        self.check_targets(x, y)?;
        let (residual, _) = self.prior_mean.residual(&y, x.nrows());
        let result = fitter.fit(
            x,
            residual.view(),
            &*self.kernel,
            self.recipe,
            &self.hp,
            self.priors.as_ref(),
        )?;
        self.hp = result.hp.clone();
        self.trained = None;
        if retrain {
            self.train(x, y)?;
        }
        Ok(result)
    }

    fn state(&self) -> Result<&TrainedState> {
        self.trained
            .as_ref()
            .ok_or_else(|| GpFitError::InvalidValueError("model is not trained".to_string()))
    }

    /// Extended predictive mean: test values first, then derivative
    /// components sample-major when `derivatives` is set.
    fn predict_extended(&self, xt: ArrayView2<f64>, derivatives: bool) -> Result<Array1<f64>> {
        let state = self.state()?;
        let k = self
            .kernel
            .cross_correlation(xt, state.x.view(), &self.hp, derivatives)?;
        let mut mean = k.dot(&state.alpha);
        mean.slice_mut(s![..xt.nrows()])
            .mapv_inplace(|v| v + state.baseline);
        Ok(mean)
    }

    /// Predictive mean at the test points
    pub fn predict(&self, xt: ArrayView2<f64>) -> Result<Array1<f64>> {
        self.predict_extended(xt, false)
    }

    /// Predictive gradient of the mean, one row per test point
    pub fn predict_gradients(&self, xt: ArrayView2<f64>) -> Result<Array2<f64>> {
        let (nt, d) = (xt.nrows(), xt.ncols());
        let mean = self.predict_extended(xt, true)?;
        let grads = mean.slice(s![nt..]).to_owned();
        Ok(grads.into_shape((nt, d)).map_err(|_| {
            GpFitError::DimensionMismatch {
                what: "gradient block".to_string(),
                expected: nt * d,
                actual: mean.len() - nt,
            }
        })?)
    }

    /// Predictive mean and variance at the test points.
    ///
    /// The variance is the diagonal of the posterior covariance of the
    /// latent function, clipped at zero; negative values before clipping
    /// are floating-point artifacts and logged as warnings. The Student-t
    /// process inflates the variance by its residual-dependent factor.
    pub fn predict_with_variance(
        &self,
        xt: ArrayView2<f64>,
    ) -> Result<(Array1<f64>, Array1<f64>)> {
        let state = self.state()?;
        let mean = self.predict_extended(xt, false)?;
        let k = self
            .kernel
            .cross_correlation(xt, state.x.view(), &self.hp, false)?;
        let v = state
            .l
            .solve_triangular(&k.t().to_owned(), UPLO::Lower)?;
        let explained = (&v * &v).sum_axis(Axis(0));
        let prior_diag = self.kernel.self_diagonal(xt, &self.hp, false)?;
        let scale = state.prefactor2 * state.variance_scale;
        let mut clipped = 0usize;
        let variance = prior_diag
            .iter()
            .zip(explained.iter())
            .map(|(d, e)| {
                let v = scale * (d - e);
                if v < 0.0 {
                    clipped += 1;
                    0.0
                } else {
                    v
                }
            })
            .collect::<Array1<f64>>();
        if clipped > 0 {
            log::warn!("clipped {} negative predictive variances to zero", clipped);
        }
        Ok((mean, variance))
    }
}

/// Gaussian process regression model.
pub struct GaussianProcess(Process);

impl GaussianProcess {
    /// Model over the given kernel with default hyperparameters
    pub fn new(kernel: Box<dyn Kernel>) -> Self {
        GaussianProcess(Process::new(kernel, ProcessRecipe::Gp))
    }
}

impl Deref for GaussianProcess {
    type Target = Process;
    fn deref(&self) -> &Process {
        &self.0
    }
}

impl DerefMut for GaussianProcess {
    fn deref_mut(&mut self) -> &mut Process {
        &mut self.0
    }
}

/// Student-t process regression model.
///
/// Shares the predictive mean with the Gaussian process; the predictive
/// variance carries the heavier-tailed scaling from the training residuals.
pub struct StudentTProcess(Process);

impl StudentTProcess {
    /// Model with the default weakly informative hyperprior
    pub fn new(kernel: Box<dyn Kernel>) -> Self {
        StudentTProcess(Process::new(kernel, ProcessRecipe::student_t()))
    }

    /// Model with explicit inverse-gamma hyperprior parameters
    pub fn with_hyperprior(kernel: Box<dyn Kernel>, a: f64, b: f64) -> Self {
        StudentTProcess(Process::new(kernel, ProcessRecipe::StudentT { a, b }))
    }
}

impl Deref for StudentTProcess {
    type Target = Process;
    fn deref(&self) -> &Process {
        &self.0
    }
}

impl DerefMut for StudentTProcess {
    fn deref_mut(&mut self) -> &mut Process {
        &mut self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::SquaredExponential;
    use crate::objectives::MaximumLogLikelihood;
    use crate::optimizers::Lbfgs;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, concatenate};

    fn training_data() -> (Array2<f64>, Array1<f64>) {
        let x = array![[0.0], [0.4], [0.9], [1.4], [2.0], [2.6], [3.1], [3.6]];
        let y = x.column(0).mapv(|v: f64| (1.1 * v).sin());
        (x, y)
    }

    fn tight_hp() -> Hyperparameters {
        let mut hp = Hyperparameters::default();
        hp.set_scalar("noise", -6.0);
        hp
    }

    #[test]
    fn test_interpolates_training_points_at_low_noise() {
        let (x, y) = training_data();
        let mut model = GaussianProcess::new(Box::new(SquaredExponential::new()));
        model.set_hyperparameters(tight_hp());
        model.train(x.view(), y.view()).unwrap();
        let pred = model.predict(x.view()).unwrap();
        for i in 0..y.len() {
            assert_abs_diff_eq!(pred[i], y[i], epsilon = 1e-3);
        }
    }

    #[test]
    fn test_predict_is_idempotent() {
        let (x, y) = training_data();
        let mut model = GaussianProcess::new(Box::new(SquaredExponential::new()));
        model.set_hyperparameters(tight_hp());
        model.train(x.view(), y.view()).unwrap();
        let xt = array![[0.2], [1.1], [2.9]];
        let a = model.predict(xt.view()).unwrap();
        let b = model.predict(xt.view()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_variance_nonnegative_and_small_at_training_points() {
        let (x, y) = training_data();
        let mut model = GaussianProcess::new(Box::new(SquaredExponential::new()));
        model.set_hyperparameters(tight_hp());
        model.train(x.view(), y.view()).unwrap();
        let (_, var_train) = model.predict_with_variance(x.view()).unwrap();
        let far = array![[30.0]];
        let (_, var_far) = model.predict_with_variance(far.view()).unwrap();
        for v in var_train.iter() {
            assert!(*v >= 0.0);
            assert!(*v < 1e-2);
        }
        // Far from the data the variance reverts to the prior scale.
        assert_abs_diff_eq!(var_far[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_untrained_predict_fails() {
        let model = GaussianProcess::new(Box::new(SquaredExponential::new()));
        let xt = array![[0.0]];
        assert!(model.predict(xt.view()).is_err());
    }

    #[test]
    fn test_hyperparameter_change_drops_trained_state() {
        let (x, y) = training_data();
        let mut model = GaussianProcess::new(Box::new(SquaredExponential::new()));
        model.train(x.view(), y.view()).unwrap();
        assert!(model.is_trained());
        model.set_hyperparameters(tight_hp());
        assert!(!model.is_trained());
    }

    #[test]
    fn test_target_length_mismatch_is_fatal() {
        let (x, _) = training_data();
        let y = array![0.0, 1.0];
        let mut model = GaussianProcess::new(Box::new(SquaredExponential::new()));
        let err = model.train(x.view(), y.view()).unwrap_err();
        assert!(matches!(err, GpFitError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_derivative_observations_sharpen_gradients() {
        // Quadratic with exact gradient observations
        let x = array![[0.0], [0.5], [1.0], [1.5], [2.0]];
        let values = x.column(0).mapv(|v: f64| v * v);
        let grads = x.column(0).mapv(|v: f64| 2.0 * v);
        let y = concatenate![Axis(0), values, grads];
        let mut model = GaussianProcess::new(Box::new(SquaredExponential::with_derivatives()));
        model.set_hyperparameters(tight_hp());
        model.train(x.view(), y.view()).unwrap();
        let xt = array![[0.8], [1.2]];
        let pred = model.predict(xt.view()).unwrap();
        let dpred = model.predict_gradients(xt.view()).unwrap();
        for (i, row) in xt.rows().into_iter().enumerate() {
            let v = row[0];
            assert_abs_diff_eq!(pred[i], v * v, epsilon = 5e-2);
            assert_abs_diff_eq!(dpred[[i, 0]], 2.0 * v, epsilon = 1e-1);
        }
    }

    #[test]
    fn test_student_t_variance_inflation_positive() {
        let (x, y) = training_data();
        let mut gp = GaussianProcess::new(Box::new(SquaredExponential::new()));
        let mut tp = StudentTProcess::new(Box::new(SquaredExponential::new()));
        gp.set_hyperparameters(tight_hp());
        tp.set_hyperparameters(tight_hp());
        gp.train(x.view(), y.view()).unwrap();
        tp.train(x.view(), y.view()).unwrap();
        let xt = array![[1.25]];
        let (m_gp, v_gp) = gp.predict_with_variance(xt.view()).unwrap();
        let (m_tp, v_tp) = tp.predict_with_variance(xt.view()).unwrap();
        // Same mean, rescaled variance
        assert_abs_diff_eq!(m_gp[0], m_tp[0], epsilon = 1e-10);
        assert!(v_tp[0] > 0.0);
        assert!((v_tp[0] / v_gp[0].max(1e-300)).is_finite());
    }

    #[test]
    fn test_optimize_improves_and_retrains() {
        let (x, y) = training_data();
        let mut model = GaussianProcess::new(Box::new(SquaredExponential::new()));
        let fitter = HyperparameterFitter {
            objective: Box::new(MaximumLogLikelihood::default()),
            optimizer: Box::new(Lbfgs::default()),
            boundary: Some(crate::boundary::Boundary::Educated),
        };
        let result = model.optimize(x.view(), y.view(), &fitter, true).unwrap();
        assert!(result.solution.fun.is_finite());
        assert!(model.is_trained());
        // Fitted model stays close to the targets at the training points.
        let pred = model.predict(x.view()).unwrap();
        let rmse = (&pred - &y).mapv(|v| v * v).mean().unwrap().sqrt();
        assert!(rmse < 0.2);
    }

    #[test]
    fn test_optimize_without_retrain_adopts_but_leaves_untrained() {
        let (x, y) = training_data();
        let mut model = GaussianProcess::new(Box::new(SquaredExponential::new()));
        let hp_before = model.hyperparameters().to_vector().0;
        let fitter = HyperparameterFitter {
            objective: Box::new(MaximumLogLikelihood::default()),
            optimizer: Box::new(Lbfgs::default()),
            boundary: Some(crate::boundary::Boundary::Educated),
        };
        let result = model
            .optimize(x.view(), y.view(), &fitter, false)
            .unwrap();
        assert!(!model.is_trained());
        assert!(model.predict(x.view()).is_err());
        // The fitted hyperparameters are live on the model.
        assert_eq!(model.hyperparameters().to_vector().0, result.hp.to_vector().0);
        assert!(model.hyperparameters().to_vector().0 != hp_before);
        // Training afterwards is the caller's call.
        model.train(x.view(), y.view()).unwrap();
        assert!(model.is_trained());
    }

    #[test]
    fn test_prior_mean_average_shifts_far_field() {
        let (x, y) = training_data();
        let offset_y = &y + 5.0;
        let mut model = GaussianProcess::new(Box::new(SquaredExponential::new()));
        model.set_prior_mean(PriorMean::Average);
        model.set_hyperparameters(tight_hp());
        model.train(x.view(), offset_y.view()).unwrap();
        let far = array![[40.0]];
        let pred = model.predict(far.view()).unwrap();
        assert_abs_diff_eq!(pred[0], offset_y.mean().unwrap(), epsilon = 1e-6);
    }
}
