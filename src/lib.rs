//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! and Student-t process regression over scalar targets and, optionally,
//! their derivatives, together with a pluggable hyperparameter-fitting
//! subsystem.
//!
//! The regression models are implemented by [`GaussianProcess`] and
//! [`StudentTProcess`]: training factorizes the regularized covariance with
//! a Cholesky decomposition and prediction returns the posterior mean and
//! clipped variance. All positivity-constrained hyperparameters (length,
//! noise, prefactor) live in natural-log space in a named
//! [`Hyperparameters`] set.
//!
//! Hyperparameter fitting composes three orthogonal families through
//! [`HyperparameterFitter`]:
//!
//! * objective functions ([`objectives`]): marginal likelihood for both
//!   process families, the prefactor-profiled likelihood, leave-one-out
//!   losses and eigendecomposition-based factorized likelihoods that
//!   re-evaluate cheaply across the noise hyperparameter;
//! * optimizers ([`optimizers`]): L-BFGS, COBYLA, golden-section and grid
//!   line searches, full grids, random sampling, simulated annealing and
//!   basin hopping, plus the factorized 1-D search with closed-form
//!   profiling;
//! * boundary policies ([`boundary`]): fixed, machine-precision or
//!   data-driven bounds, optionally remapped through a logistic variable
//!   transformation for unconstrained optimizers.
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod boundary;
mod errors;
pub mod hpfitter;
mod hyperparameters;
pub mod kernels;
mod means;
mod models;
pub mod objectives;
pub mod optimizers;
pub mod pdistributions;

pub use boundary::{Boundary, FittedTransform, VariableTransformation};
pub use errors::{GpFitError, Result};
pub use hpfitter::{FitResult, HyperparameterFitter};
pub use hyperparameters::{HpIndex, Hyperparameters};
pub use kernels::{Kernel, SquaredExponential};
pub use means::PriorMean;
pub use models::{GaussianProcess, Process, StudentTProcess};
pub use objectives::{ObjectiveFunction, ProcessRecipe};
pub use optimizers::{Optimizer, Solution};
pub use pdistributions::{PriorCollection, PriorDistribution};
