//! Dataset and network interfaces consumed by the training engine.
//!
//! Loading, caching and file formats live outside this crate. The engine
//! only needs a [`Dataset`] that hands out sample matrices and a
//! [`Network`] that lists grouped unit labels. [`MemoryDataset`] and
//! [`Topology`] are in-memory implementations used by the binary and tests.

use crate::core::{RbmError, RbmResult};
use ndarray::{Array2, Axis};
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Source of training samples.
pub trait Dataset {
    /// Return `size` randomly drawn samples, or all samples for `None`.
    ///
    /// Rows are samples, columns follow [`Dataset::column_labels`].
    fn get_data(&mut self, size: Option<usize>) -> RbmResult<Array2<f32>>;

    /// Ordered column labels.
    fn column_labels(&self) -> Vec<String>;
}

/// A named group of network nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeGroup {
    pub name: String,
    pub visible: bool,
    pub labels: Vec<String>,
}

/// Source of grouped node labels.
pub trait Network {
    fn node_groups(&self) -> Vec<NodeGroup>;
}

/// Plain list of node groups.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub groups: Vec<NodeGroup>,
}

impl Topology {
    /// Two-layer topology with the given visible labels and `hidden` generated labels.
    pub fn layered(visible: Vec<String>, hidden: usize) -> Self {
        Self {
            groups: vec![
                NodeGroup {
                    name: "visible".to_string(),
                    visible: true,
                    labels: visible,
                },
                NodeGroup {
                    name: "hidden".to_string(),
                    visible: false,
                    labels: (1..=hidden).map(|i| format!("h:h{i}")).collect(),
                },
            ],
        }
    }
}

impl Network for Topology {
    fn node_groups(&self) -> Vec<NodeGroup> {
        self.groups.clone()
    }
}

/// One stratum of a [`MemoryDataset`].
#[derive(Debug, Clone)]
pub struct DataSource {
    pub name: String,
    pub data: Array2<f32>,
    /// Share of every drawn minibatch taken from this source
    pub fraction: f32,
}

/// In-memory dataset with stratified sampling over its sources.
#[derive(Debug, Clone)]
pub struct MemoryDataset {
    labels: Vec<String>,
    sources: Vec<DataSource>,
    rng: ChaCha8Rng,
}

impl MemoryDataset {
    /// Single-source dataset.
    pub fn new(labels: Vec<String>, data: Array2<f32>, seed: u64) -> RbmResult<Self> {
        Self::with_sources(
            labels,
            vec![DataSource {
                name: "default".to_string(),
                data,
                fraction: 1.0,
            }],
            seed,
        )
    }

    /// Dataset drawing each minibatch from several sources by fraction.
    ///
    /// # Errors
    /// - `InvalidDataset` on column mismatch, empty sources or fractions not summing to 1
    pub fn with_sources(labels: Vec<String>, sources: Vec<DataSource>, seed: u64) -> RbmResult<Self> {
        if sources.is_empty() {
            return Err(RbmError::InvalidDataset("dataset has no sources".to_string()));
        }
        for src in &sources {
            if src.data.ncols() != labels.len() {
                return Err(RbmError::InvalidDataset(format!(
                    "source '{}' has {} columns, expected {}",
                    src.name,
                    src.data.ncols(),
                    labels.len()
                )));
            }
            if src.data.nrows() == 0 {
                return Err(RbmError::InvalidDataset(format!("source '{}' is empty", src.name)));
            }
            if !(src.fraction.is_finite() && src.fraction >= 0.0) {
                return Err(RbmError::InvalidDataset(format!(
                    "source '{}' has invalid fraction {}",
                    src.name, src.fraction
                )));
            }
        }
        let total: f32 = sources.iter().map(|s| s.fraction).sum();
        if (total - 1.0).abs() > 1e-3 {
            return Err(RbmError::InvalidDataset(format!(
                "source fractions sum to {total}, expected 1"
            )));
        }
        Ok(Self {
            labels,
            sources,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn len(&self) -> usize {
        self.sources.iter().map(|s| s.data.nrows()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split `size` over the sources by fraction; rounding remainders go to the largest shares.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn stratify(&self, size: usize) -> Vec<usize> {
        let exact: Vec<f32> = self.sources.iter().map(|s| s.fraction * size as f32).collect();
        let mut counts: Vec<usize> = exact.iter().map(|x| x.floor() as usize).collect();
        let mut missing = size.saturating_sub(counts.iter().sum());
        let mut order: Vec<usize> = (0..counts.len()).collect();
        order.sort_by(|&a, &b| {
            let ra = exact[a] - exact[a].floor();
            let rb = exact[b] - exact[b].floor();
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        });
        for &i in order.iter().cycle() {
            if missing == 0 {
                break;
            }
            if self.sources[i].fraction > 0.0 {
                counts[i] += 1;
                missing -= 1;
            }
        }
        counts
    }
}

impl Dataset for MemoryDataset {
    fn get_data(&mut self, size: Option<usize>) -> RbmResult<Array2<f32>> {
        let Some(size) = size else {
            let views: Vec<_> = self.sources.iter().map(|s| s.data.view()).collect();
            return ndarray::concatenate(Axis(0), &views)
                .map_err(|e| RbmError::InvalidDataset(e.to_string()));
        };

        let counts = self.stratify(size);
        let mut rows = Vec::with_capacity(size);
        for (src, &count) in self.sources.iter().zip(&counts) {
            let n = src.data.nrows();
            if count <= n {
                rows.extend(sample(&mut self.rng, n, count).into_iter().map(|i| src.data.row(i)));
            } else {
                // more rows requested than available: draw with replacement
                for _ in 0..count {
                    rows.push(src.data.row(self.rng.gen_range(0..n)));
                }
            }
        }
        if rows.is_empty() {
            return Ok(Array2::zeros((0, self.labels.len())));
        }
        ndarray::stack(Axis(0), &rows).map_err(|e| RbmError::InvalidDataset(e.to_string()))
    }

    fn column_labels(&self) -> Vec<String> {
        self.labels.clone()
    }
}

/// Check that every value is exactly 0 or 1.
pub fn check_binary(data: &Array2<f32>) -> RbmResult<()> {
    match data.iter().find(|&&x| x != 0.0 && x != 1.0) {
        Some(x) => Err(RbmError::InvalidDataset(format!(
            "binary data expected, found value {x}"
        ))),
        None => Ok(()),
    }
}

/// Check that the data has absolute mean below `max_mean` and standard deviation below `max_sdev`.
pub fn check_gauss_normalized(data: &Array2<f32>, max_mean: f32, max_sdev: f32) -> RbmResult<()> {
    let mean = data.mean().ok_or_else(|| RbmError::InvalidDataset("dataset is empty".to_string()))?;
    if !mean.is_finite() || mean.abs() >= max_mean {
        return Err(RbmError::InvalidDataset(format!(
            "data is not gauss normalized: mean value is {mean:.3}"
        )));
    }
    let sdev = data.std(0.0);
    if !sdev.is_finite() || sdev >= max_sdev {
        return Err(RbmError::InvalidDataset(format!(
            "data is not gauss normalized: standard deviation is {sdev:.3}"
        )));
    }
    Ok(())
}
