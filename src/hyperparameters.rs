//! Named hyperparameter sets and their flat-vector exchange format.
//!
//! Hyperparameters are stored in natural-log space: `length` is the log of the
//! kernel length-scale, `prefactor` the log of the signal standard deviation
//! and `noise` the log of the noise-to-prefactor ratio. The fitting subsystem
//! works on a flat `Array1<f64>` and an index that maps each name back to its
//! slice of that vector.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use ndarray::{concatenate, Array1, Axis};

use crate::errors::{GpFitError, Result};

/// Default log length-scale
pub const DEFAULT_LENGTH: f64 = 0.0;
/// Default log relative-noise
pub const DEFAULT_NOISE: f64 = -4.0;
/// Default log prefactor
pub const DEFAULT_PREFACTOR: f64 = 0.0;

/// An ordered mapping from hyperparameter name to its log-space values.
///
/// Names are kept sorted so that the flattening order is deterministic:
/// `length < noise < prefactor < …` in lexicographic order.
#[derive(Clone, Debug, PartialEq)]
pub struct Hyperparameters {
    values: BTreeMap<String, Array1<f64>>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        let mut hp = Hyperparameters {
            values: BTreeMap::new(),
        };
        hp.set("length", Array1::from_elem(1, DEFAULT_LENGTH));
        hp.set("noise", Array1::from_elem(1, DEFAULT_NOISE));
        hp.set("prefactor", Array1::from_elem(1, DEFAULT_PREFACTOR));
        hp
    }
}

impl Hyperparameters {
    /// An empty set
    pub fn new() -> Self {
        Hyperparameters {
            values: BTreeMap::new(),
        }
    }

    /// Set a scalar hyperparameter (log space)
    pub fn set_scalar(&mut self, name: &str, value: f64) -> &mut Self {
        self.set(name, Array1::from_elem(1, value))
    }

    /// Set a vector hyperparameter (log space)
    pub fn set(&mut self, name: &str, value: Array1<f64>) -> &mut Self {
        self.values.insert(name.to_string(), value);
        self
    }

    /// Get a hyperparameter by name
    pub fn get(&self, name: &str) -> Option<&Array1<f64>> {
        self.values.get(name)
    }

    /// Get a hyperparameter, failing with [`GpFitError::InvalidHyperparameter`] when absent
    pub fn require(&self, name: &str) -> Result<&Array1<f64>> {
        self.values
            .get(name)
            .ok_or_else(|| GpFitError::InvalidHyperparameter(name.to_string()))
    }

    /// Get the first component of a hyperparameter, failing when absent
    pub fn require_scalar(&self, name: &str) -> Result<f64> {
        let v = self.require(name)?;
        if v.is_empty() {
            return Err(GpFitError::InvalidHyperparameter(name.to_string()));
        }
        Ok(v[0])
    }

    /// Iterate over (name, values) pairs in flattening order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Array1<f64>)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of named hyperparameters
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Derive a new set with the given entries replacing existing ones
    pub fn with(&self, other: &Hyperparameters) -> Hyperparameters {
        let mut out = self.clone();
        for (name, value) in other.iter() {
            out.set(name, value.to_owned());
        }
        out
    }

    /// Export to a flat vector and the index mapping names to vector slices
    pub fn to_vector(&self) -> (Array1<f64>, HpIndex) {
        if self.values.is_empty() {
            return (Array1::zeros(0), HpIndex { ranges: vec![] });
        }
        let mut ranges = Vec::with_capacity(self.values.len());
        let mut offset = 0;
        let parts: Vec<_> = self
            .values
            .iter()
            .map(|(name, v)| {
                ranges.push((name.clone(), offset..offset + v.len()));
                offset += v.len();
                v.view()
            })
            .collect();
        let flat = if parts.is_empty() {
            Array1::zeros(0)
        } else {
            concatenate(Axis(0), &parts).expect("1-d views concatenate")
        };
        (flat, HpIndex { ranges })
    }

    /// Rebuild a named set from a flat vector and its index
    pub fn from_vector(theta: &Array1<f64>, index: &HpIndex) -> Result<Hyperparameters> {
        if theta.len() != index.dim() {
            return Err(GpFitError::DimensionMismatch {
                what: "hyperparameter vector".to_string(),
                expected: index.dim(),
                actual: theta.len(),
            });
        }
        let mut hp = Hyperparameters::new();
        for (name, range) in &index.ranges {
            hp.set(name, theta.slice(ndarray::s![range.clone()]).to_owned());
        }
        Ok(hp)
    }
}

impl fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Hyperparameters(")?;
        for (i, (name, v)) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={v}")?;
        }
        write!(f, ")")
    }
}

/// Mapping from hyperparameter names to slices of the flat search vector
#[derive(Clone, Debug, PartialEq)]
pub struct HpIndex {
    ranges: Vec<(String, Range<usize>)>,
}

impl HpIndex {
    /// Total dimension of the flat vector
    pub fn dim(&self) -> usize {
        self.ranges.last().map(|(_, r)| r.end).unwrap_or(0)
    }

    /// Slice range of a given name
    pub fn range(&self, name: &str) -> Option<Range<usize>> {
        self.ranges
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r.clone())
    }

    /// Iterate over (name, range) pairs in vector order
    pub fn iter(&self) -> impl Iterator<Item = (&str, Range<usize>)> {
        self.ranges.iter().map(|(n, r)| (n.as_str(), r.clone()))
    }
}
