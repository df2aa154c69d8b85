//! Core RBM parameter model.
//!
//! This module provides the parameter data model shared by every part of the
//! training engine:
//! - [`UnitGroup`]: labelled units with bias (and log-variance for gaussian groups)
//! - [`LinkMatrix`]: visible × hidden adjacency and weights
//! - [`ParameterStore`]: the validated pair of groups plus their links
//!
//! ## Energy
//!
//! For binary visible units the model assigns
//! ```text
//! E(v, h) = -bᵥ·v - bₕ·h - vᵀ W h
//! ```
//! Gaussian visible units replace the visible term by
//! `Σᵢ (vᵢ - bᵢ)² / 2σᵢ²` and scale the interaction by `1/σᵢ²`, with
//! `σᵢ² = exp(log_variance[i])`.

pub mod units;

use ndarray::{Array1, Array2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub use units::{sigmoid, UnitKind};

/// Error type for RBM operations.
#[derive(Debug, Error)]
pub enum RbmError {
    /// Label or shape mismatch between units and links
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),
    /// Matrix handed to the model has the wrong number of columns
    #[error("Invalid shape: {0}")]
    InvalidShape(String),
    /// Dataset fails the model's precondition
    #[error("Invalid dataset: {0}")]
    InvalidDataset(String),
    /// Configuration value out of range
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Unsupported algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("Unsupported metric '{0}'")]
    UnsupportedMetric(String),
    /// Schedule carries parameters, but none for this model type
    #[error("Schedule '{schedule}' does not include model type '{model_type}'")]
    MissingSchedule { schedule: String, model_type: String },
    /// Non-finite values produced by an update
    #[error("Numeric instability: {0}")]
    NumericInstability(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type RbmResult<T> = Result<T, RbmError>;

/// A group of units sharing one activation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitGroup {
    /// Group name, e.g. `"visible"`
    pub name: String,
    /// Whether the group is observed (data) or latent
    pub visible: bool,
    /// Activation kind
    pub kind: UnitKind,
    /// Unit labels, unique within the group
    pub labels: Vec<String>,
    /// Bias per unit
    pub bias: Array1<f32>,
    /// Logarithmic variance per unit; present exactly for gaussian groups
    pub log_variance: Option<Array1<f32>>,
}

/// Additive update of a unit group's parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitDelta {
    pub bias: Array1<f32>,
    pub log_variance: Option<Array1<f32>>,
}

impl UnitDelta {
    /// True if no entry is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.bias.iter().all(|x| x.is_finite())
            && self
                .log_variance
                .as_ref()
                .map_or(true, |l| l.iter().all(|x| x.is_finite()))
    }
}

impl UnitGroup {
    /// Create a group with zero biases (and zero log-variance for gaussian units).
    ///
    /// # Errors
    /// - `InvalidTopology` if `labels` is empty or contains duplicates
    pub fn new(
        name: impl Into<String>,
        visible: bool,
        kind: UnitKind,
        labels: Vec<String>,
    ) -> RbmResult<Self> {
        let n = labels.len();
        let group = Self {
            name: name.into(),
            visible,
            kind,
            labels,
            bias: Array1::zeros(n),
            log_variance: match kind {
                UnitKind::Gauss => Some(Array1::zeros(n)),
                UnitKind::Sigmoid => None,
            },
        };
        group.validate()?;
        Ok(group)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }

    /// Per-unit variance `exp(log_variance)`, if the group has one.
    pub fn variance(&self) -> Option<Array1<f32>> {
        self.log_variance.as_ref().map(|l| l.mapv(f32::exp))
    }

    /// Check label uniqueness and parameter lengths.
    pub fn validate(&self) -> RbmResult<()> {
        if self.labels.is_empty() {
            return Err(RbmError::InvalidTopology(format!(
                "unit group '{}' has no units",
                self.name
            )));
        }
        let mut seen = HashSet::with_capacity(self.labels.len());
        for label in &self.labels {
            if !seen.insert(label.as_str()) {
                return Err(RbmError::InvalidTopology(format!(
                    "duplicate unit label '{}' in group '{}'",
                    label, self.name
                )));
            }
        }
        if self.bias.len() != self.labels.len() {
            return Err(RbmError::InvalidTopology(format!(
                "group '{}': {} labels but {} biases",
                self.name,
                self.labels.len(),
                self.bias.len()
            )));
        }
        match (self.kind, &self.log_variance) {
            (UnitKind::Gauss, Some(lvar)) if lvar.len() != self.labels.len() => {
                Err(RbmError::InvalidTopology(format!(
                    "group '{}': {} labels but {} log-variances",
                    self.name,
                    self.labels.len(),
                    lvar.len()
                )))
            }
            (UnitKind::Gauss, None) => Err(RbmError::InvalidTopology(format!(
                "gaussian group '{}' has no log-variance",
                self.name
            ))),
            (UnitKind::Sigmoid, Some(_)) => Err(RbmError::InvalidTopology(format!(
                "sigmoid group '{}' must not carry a log-variance",
                self.name
            ))),
            _ => Ok(()),
        }
    }

    /// Add a delta to bias (and log-variance).
    ///
    /// # Errors
    /// - `InvalidShape` if the delta does not match the group size
    pub fn update(&mut self, delta: &UnitDelta) -> RbmResult<()> {
        if delta.bias.len() != self.len() {
            return Err(RbmError::InvalidShape(format!(
                "bias delta for '{}': expected {}, got {}",
                self.name,
                self.len(),
                delta.bias.len()
            )));
        }
        self.bias += &delta.bias;
        if let (Some(lvar), Some(dl)) = (self.log_variance.as_mut(), delta.log_variance.as_ref()) {
            if dl.len() != lvar.len() {
                return Err(RbmError::InvalidShape(format!(
                    "log-variance delta for '{}': expected {}, got {}",
                    self.name,
                    lvar.len(),
                    dl.len()
                )));
            }
            *lvar += dl;
        }
        Ok(())
    }
}

/// Links from the visible to the hidden group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkMatrix {
    pub source: String,
    pub target: String,
    /// `adjacency[[i, j]]`: visible unit i is linked to hidden unit j
    pub adjacency: Array2<bool>,
    /// `weight[[i, j]]`, shape `(|visible|, |hidden|)`
    pub weight: Array2<f32>,
}

impl LinkMatrix {
    /// Fully connected links with zero weights.
    pub fn dense(source: impl Into<String>, target: impl Into<String>, shape: (usize, usize)) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            adjacency: Array2::from_elem(shape, true),
            weight: Array2::zeros(shape),
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.weight.dim()
    }

    /// Population variance of all weights.
    pub fn weight_variance(&self) -> f32 {
        self.weight.var(0.0)
    }

    /// Number of active links.
    pub fn active(&self) -> usize {
        self.adjacency.iter().filter(|&&a| a).count()
    }

    pub fn update(&mut self, delta: &Array2<f32>) -> RbmResult<()> {
        if delta.dim() != self.weight.dim() {
            return Err(RbmError::InvalidShape(format!(
                "weight delta: expected {:?}, got {:?}",
                self.weight.dim(),
                delta.dim()
            )));
        }
        self.weight += delta;
        Ok(())
    }
}

/// Description of a single link, see [`ParameterStore::link_info`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkInfo {
    pub adjacency: bool,
    pub weight: f32,
    /// Weight normalized by the mean absolute weight over active links
    pub normal: f32,
}

/// Validated parameters of a two-layer model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterStore {
    pub visible: UnitGroup,
    pub hidden: UnitGroup,
    pub links: LinkMatrix,
}

impl ParameterStore {
    /// Assemble a store from two groups and their links.
    ///
    /// # Errors
    /// - `InvalidTopology` on label, visibility or shape mismatch
    pub fn new(visible: UnitGroup, hidden: UnitGroup, links: LinkMatrix) -> RbmResult<Self> {
        let store = Self {
            visible,
            hidden,
            links,
        };
        store.validate()?;
        Ok(store)
    }

    /// Dense store with zero parameters.
    pub fn dense(visible: UnitGroup, hidden: UnitGroup) -> RbmResult<Self> {
        let links = LinkMatrix::dense(
            visible.name.clone(),
            hidden.name.clone(),
            (visible.len(), hidden.len()),
        );
        Self::new(visible, hidden, links)
    }

    pub fn validate(&self) -> RbmResult<()> {
        self.visible.validate()?;
        self.hidden.validate()?;
        if !self.visible.visible || self.hidden.visible {
            return Err(RbmError::InvalidTopology(
                "expected exactly one visible and one hidden group".to_string(),
            ));
        }
        let shape = (self.visible.len(), self.hidden.len());
        if self.links.weight.dim() != shape || self.links.adjacency.dim() != shape {
            return Err(RbmError::InvalidTopology(format!(
                "links: expected {:?}, got weight {:?} / adjacency {:?}",
                shape,
                self.links.weight.dim(),
                self.links.adjacency.dim()
            )));
        }
        if self.links.source != self.visible.name || self.links.target != self.hidden.name {
            return Err(RbmError::InvalidTopology(format!(
                "links connect '{}' → '{}', groups are '{}' / '{}'",
                self.links.source, self.links.target, self.visible.name, self.hidden.name
            )));
        }
        Ok(())
    }

    /// Reject batches whose column count differs from the visible group.
    pub fn check_batch(&self, data: &Array2<f32>) -> RbmResult<()> {
        if data.ncols() != self.visible.len() {
            return Err(RbmError::InvalidShape(format!(
                "batch has {} columns, model has {} visible units",
                data.ncols(),
                self.visible.len()
            )));
        }
        Ok(())
    }

    /// Hidden expectation given visible values.
    ///
    /// Input from a gaussian visible group is divided by its variance.
    pub fn expect_hidden(&self, v: &Array2<f32>) -> RbmResult<Array2<f32>> {
        self.check_batch(v)?;
        let input = scaled_input(&self.visible, v);
        let act = input.dot(&self.links.weight) + &self.hidden.bias;
        Ok(self.hidden.kind.expect(act))
    }

    /// Visible expectation given hidden values.
    pub fn expect_visible(&self, h: &Array2<f32>) -> RbmResult<Array2<f32>> {
        if h.ncols() != self.hidden.len() {
            return Err(RbmError::InvalidShape(format!(
                "hidden values have {} columns, model has {} hidden units",
                h.ncols(),
                self.hidden.len()
            )));
        }
        let input = scaled_input(&self.hidden, h);
        let act = input.dot(&self.links.weight.t()) + &self.visible.bias;
        Ok(self.visible.kind.expect(act))
    }

    pub fn sample_hidden<R: Rng + ?Sized>(&self, h_expect: &Array2<f32>, rng: &mut R) -> Array2<f32> {
        self.hidden
            .kind
            .sample(h_expect, self.hidden.log_variance.as_ref(), rng)
    }

    pub fn sample_visible<R: Rng + ?Sized>(&self, v_expect: &Array2<f32>, rng: &mut R) -> Array2<f32> {
        self.visible
            .kind
            .sample(v_expect, self.visible.log_variance.as_ref(), rng)
    }

    /// Active links as `(visible, hidden)` label pairs.
    pub fn links(&self) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(self.links.active());
        for ((i, j), &a) in self.links.adjacency.indexed_iter() {
            if a {
                out.push((self.visible.labels[i].clone(), self.hidden.labels[j].clone()));
            }
        }
        out
    }

    /// Remove all links of a unit. Returns false if the label is unknown.
    pub fn unlink_unit(&mut self, label: &str) -> bool {
        if let Some(i) = self.visible.index_of(label) {
            self.links.adjacency.row_mut(i).fill(false);
            return true;
        }
        if let Some(j) = self.hidden.index_of(label) {
            self.links.adjacency.column_mut(j).fill(false);
            return true;
        }
        false
    }

    /// Clear adjacency for the given links, in either orientation.
    ///
    /// Returns the number of links removed; unknown links are skipped with a warning.
    pub fn remove_links(&mut self, links: &[(String, String)]) -> usize {
        let mut removed = 0;
        for (a, b) in links {
            match self.link_index(a, b) {
                Some((i, j)) if self.links.adjacency[[i, j]] => {
                    self.links.adjacency[[i, j]] = false;
                    removed += 1;
                }
                _ => log::warn!("could not delete link ({a} → {b}): link could not be found"),
            }
        }
        removed
    }

    /// Adjacency, weight and normalized weight of a link, in either orientation.
    pub fn link_info(&self, a: &str, b: &str) -> Option<LinkInfo> {
        let (i, j) = self.link_index(a, b)?;
        let weight = self.links.weight[[i, j]];
        let abs_sum: f32 = self.links.weight.iter().map(|w| w.abs()).sum();
        #[allow(clippy::cast_precision_loss)]
        let normal = if abs_sum > 0.0 {
            self.links.active() as f32 / abs_sum * weight
        } else {
            0.0
        };
        Some(LinkInfo {
            adjacency: self.links.adjacency[[i, j]],
            weight,
            normal,
        })
    }

    fn link_index(&self, a: &str, b: &str) -> Option<(usize, usize)> {
        match (self.visible.index_of(a), self.hidden.index_of(b)) {
            (Some(i), Some(j)) => Some((i, j)),
            _ => Some((self.visible.index_of(b)?, self.hidden.index_of(a)?)),
        }
    }
}

/// Values of `group` as seen by the opposite layer.
fn scaled_input(group: &UnitGroup, values: &Array2<f32>) -> Array2<f32> {
    match group.variance() {
        Some(var) if group.kind == UnitKind::Gauss => values / &var.insert_axis(Axis(0)),
        _ => values.clone(),
    }
}
