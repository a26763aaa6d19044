//! A module for covariance kernels of the process.
//!
//! A kernel builds the correlation matrix between two feature sets given the
//! log-space hyperparameters, optionally extended with derivative blocks when
//! the process learns from gradient observations. The extended matrix is laid
//! out value-block first: rows `0..n` are value observations, row
//! `n + i*d + k` is the derivative of sample `i` along feature direction `k`.
//!
//! The squared exponential kernel is implemented.

use ndarray::{Array1, Array2, ArrayView2};
use std::fmt;

use crate::errors::{GpFitError, Result};
use crate::hyperparameters::Hyperparameters;

/// A trait for covariance kernels used in GP/TP regression.
///
/// All matrices are unit-prefactor correlations; the `prefactor` and `noise`
/// hyperparameters are applied by the objective functions and models.
pub trait Kernel: Sync + Send + fmt::Debug {
    /// Correlation matrix between two feature sets, both sides extended with
    /// derivative blocks when the kernel uses derivatives.
    ///
    /// Fails with [`GpFitError::InvalidHyperparameter`] when a required
    /// hyperparameter name is absent.
    fn correlation(
        &self,
        x1: ArrayView2<f64>,
        x2: ArrayView2<f64>,
        hp: &Hyperparameters,
    ) -> Result<Array2<f64>>;

    /// Self-correlation matrix of `x` and, when `jac` is set, its derivative
    /// with respect to each component of each kernel hyperparameter.
    ///
    /// The gradient list per name is aligned with the flat components of that
    /// hyperparameter in the search vector.
    #[allow(clippy::type_complexity)]
    fn correlation_with_gradients(
        &self,
        x: ArrayView2<f64>,
        hp: &Hyperparameters,
        jac: bool,
    ) -> Result<(Array2<f64>, Vec<(String, Vec<Array2<f64>>)>)>;

    /// Cross-correlation between test and training sets; the training side is
    /// extended per `uses_derivatives`, the test side only when
    /// `derivatives_left` is set (derivative predictions).
    fn cross_correlation(
        &self,
        xt: ArrayView2<f64>,
        xtrain: ArrayView2<f64>,
        hp: &Hyperparameters,
        derivatives_left: bool,
    ) -> Result<Array2<f64>>;

    /// Prior self-correlation diagonal at test points (extended rows when
    /// `derivatives_left`), used for predictive variances.
    fn self_diagonal(
        &self,
        xt: ArrayView2<f64>,
        hp: &Hyperparameters,
        derivatives_left: bool,
    ) -> Result<Array1<f64>>;

    /// Whether correlation matrices carry derivative blocks
    fn uses_derivatives(&self) -> bool;

    /// Extended dimension per sample given the feature dimension
    fn block_dim(&self, n_features: usize) -> usize {
        if self.uses_derivatives() {
            1 + n_features
        } else {
            1
        }
    }

    /// Names of the kernel hyperparameters
    fn hyperparameter_names(&self) -> Vec<&'static str>;
}

/// Squared exponential kernel
///
/// `k(x, x') = exp(-0.5 * sum_k ((x_k - x'_k) / l_k)^2)` with
/// `l = exp(theta_length)`; `length` may be a scalar or one value per feature
/// dimension. Derivative blocks require a scalar length.
#[derive(Clone, Copy, Debug, Default)]
pub struct SquaredExponential {
    use_derivatives: bool,
}

impl SquaredExponential {
    /// Value-only squared exponential kernel
    pub fn new() -> Self {
        SquaredExponential {
            use_derivatives: false,
        }
    }

    /// Squared exponential kernel with derivative observation blocks
    pub fn with_derivatives() -> Self {
        SquaredExponential {
            use_derivatives: true,
        }
    }

    /// Length-scales per feature dimension, expanded from the hyperparameters
    fn length_scales(&self, hp: &Hyperparameters, n_features: usize) -> Result<Array1<f64>> {
        let theta = hp.require("length")?;
        let ls = match theta.len() {
            1 => Array1::from_elem(n_features, theta[0].exp()),
            n if n == n_features => theta.mapv(f64::exp),
            n => {
                return Err(GpFitError::DimensionMismatch {
                    what: "length hyperparameter".to_string(),
                    expected: n_features,
                    actual: n,
                })
            }
        };
        if self.use_derivatives && theta.len() != 1 {
            return Err(GpFitError::InvalidValueError(
                "derivative blocks require a scalar length hyperparameter".to_string(),
            ));
        }
        Ok(ls)
    }

    /// Correlation with optional derivative-block extension per side
    fn build(
        &self,
        x1: ArrayView2<f64>,
        x2: ArrayView2<f64>,
        ls: &Array1<f64>,
        left_ext: bool,
        right_ext: bool,
    ) -> Array2<f64> {
        let (n1, n2, d) = (x1.nrows(), x2.nrows(), x1.ncols());
        let d1 = if left_ext { d } else { 0 };
        let d2 = if right_ext { d } else { 0 };
        let mut out = Array2::zeros((n1 + n1 * d1, n2 + n2 * d2));
        let l2 = ls[0] * ls[0];
        for i in 0..n1 {
            for j in 0..n2 {
                let mut s = 0.0;
                for k in 0..d {
                    let dx = (x1[[i, k]] - x2[[j, k]]) / ls[k];
                    s += dx * dx;
                }
                let kf = (-0.5 * s).exp();
                out[[i, j]] = kf;
                if right_ext {
                    for m in 0..d {
                        let qm = (x1[[i, m]] - x2[[j, m]]) / l2;
                        out[[i, n2 + j * d + m]] = qm * kf;
                    }
                }
                if left_ext {
                    for k in 0..d {
                        let qk = (x1[[i, k]] - x2[[j, k]]) / l2;
                        out[[n1 + i * d + k, j]] = -qk * kf;
                        if right_ext {
                            for m in 0..d {
                                let qm = (x1[[i, m]] - x2[[j, m]]) / l2;
                                let delta = if k == m { 1.0 / l2 } else { 0.0 };
                                out[[n1 + i * d + k, n2 + j * d + m]] = (delta - qk * qm) * kf;
                            }
                        }
                    }
                }
            }
        }
        out
    }

    /// Derivative of the extended self-correlation with respect to `ln l`
    /// (scalar length)
    fn build_length_gradient(&self, x: ArrayView2<f64>, ls: &Array1<f64>) -> Array2<f64> {
        let (n, d) = (x.nrows(), x.ncols());
        let ext = self.use_derivatives;
        let dd = if ext { d } else { 0 };
        let mut out = Array2::zeros((n + n * dd, n + n * dd));
        let l2 = ls[0] * ls[0];
        for i in 0..n {
            for j in 0..n {
                let mut s = 0.0;
                for k in 0..d {
                    let dx = (x[[i, k]] - x[[j, k]]) / ls[k];
                    s += dx * dx;
                }
                let kf = (-0.5 * s).exp();
                out[[i, j]] = s * kf;
                if ext {
                    for m in 0..d {
                        let qm = (x[[i, m]] - x[[j, m]]) / l2;
                        out[[i, n + j * d + m]] = qm * kf * (s - 2.0);
                        out[[n + i * d + m, j]] = -qm * kf * (s - 2.0);
                    }
                    for k in 0..d {
                        let qk = (x[[i, k]] - x[[j, k]]) / l2;
                        for m in 0..d {
                            let qm = (x[[i, m]] - x[[j, m]]) / l2;
                            let delta = if k == m { 1.0 / l2 } else { 0.0 };
                            out[[n + i * d + k, n + j * d + m]] =
                                delta * kf * (s - 2.0) - qk * qm * kf * (s - 4.0);
                        }
                    }
                }
            }
        }
        out
    }

    /// Per-component ARD gradient of the value-only self-correlation
    fn build_ard_gradients(&self, x: ArrayView2<f64>, ls: &Array1<f64>) -> Vec<Array2<f64>> {
        let (n, d) = (x.nrows(), x.ncols());
        let mut grads = vec![Array2::zeros((n, n)); d];
        for i in 0..n {
            for j in 0..n {
                let mut s = 0.0;
                for k in 0..d {
                    let dx = (x[[i, k]] - x[[j, k]]) / ls[k];
                    s += dx * dx;
                }
                let kf = (-0.5 * s).exp();
                for (k, grad) in grads.iter_mut().enumerate() {
                    let dx = (x[[i, k]] - x[[j, k]]) / ls[k];
                    grad[[i, j]] = dx * dx * kf;
                }
            }
        }
        grads
    }
}

impl Kernel for SquaredExponential {
    fn correlation(
        &self,
        x1: ArrayView2<f64>,
        x2: ArrayView2<f64>,
        hp: &Hyperparameters,
    ) -> Result<Array2<f64>> {
        let ls = self.length_scales(hp, x1.ncols())?;
        Ok(self.build(x1, x2, &ls, self.use_derivatives, self.use_derivatives))
    }

    fn correlation_with_gradients(
        &self,
        x: ArrayView2<f64>,
        hp: &Hyperparameters,
        jac: bool,
    ) -> Result<(Array2<f64>, Vec<(String, Vec<Array2<f64>>)>)> {
        let ls = self.length_scales(hp, x.ncols())?;
        let r = self.build(x, x, &ls, self.use_derivatives, self.use_derivatives);
        if !jac {
            return Ok((r, vec![]));
        }
        let n_components = hp.require("length")?.len();
        let grads = if n_components == 1 {
            vec![self.build_length_gradient(x, &ls)]
        } else {
            self.build_ard_gradients(x, &ls)
        };
        Ok((r, vec![("length".to_string(), grads)]))
    }

    fn cross_correlation(
        &self,
        xt: ArrayView2<f64>,
        xtrain: ArrayView2<f64>,
        hp: &Hyperparameters,
        derivatives_left: bool,
    ) -> Result<Array2<f64>> {
        if xt.ncols() != xtrain.ncols() {
            return Err(GpFitError::DimensionMismatch {
                what: "test feature dimension".to_string(),
                expected: xtrain.ncols(),
                actual: xt.ncols(),
            });
        }
        let ls = self.length_scales(hp, xtrain.ncols())?;
        Ok(self.build(xt, xtrain, &ls, derivatives_left, self.use_derivatives))
    }

    fn self_diagonal(
        &self,
        xt: ArrayView2<f64>,
        hp: &Hyperparameters,
        derivatives_left: bool,
    ) -> Result<Array1<f64>> {
        let (n, d) = (xt.nrows(), xt.ncols());
        let ls = self.length_scales(hp, d)?;
        let dd = if derivatives_left { d } else { 0 };
        let mut diag = Array1::ones(n + n * dd);
        if derivatives_left {
            let l2 = ls[0] * ls[0];
            diag.slice_mut(ndarray::s![n..]).fill(1.0 / l2);
        }
        Ok(diag)
    }

    fn uses_derivatives(&self) -> bool {
        self.use_derivatives
    }

    fn hyperparameter_names(&self) -> Vec<&'static str> {
        vec!["length"]
    }
}

impl fmt::Display for SquaredExponential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SquaredExponential")
    }
}
