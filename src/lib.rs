//! # RBM (Restricted Boltzmann Machines)
//!
//! Contrastive divergence training for restricted Boltzmann machines with
//! binary (RBM) or gaussian (GRBM) visible units and binary hidden units.
//!
//! ## Overview
//!
//! An RBM is a two-layer energy model. Training moves the parameters so that
//! the statistics of the data (positive phase) and of short Gibbs chains
//! started from the data (negative phase) agree. On top of plain CD-k the
//! engine supports denoising (input corruption), a Kullback-Leibler sparsity
//! penalty on the hidden units, layer-wise freezing of parameter classes and
//! variance maximizing rate adaption.
//!
//! ## Structure
//!
//! - [`core`]: parameter store, unit groups, links, errors
//! - [`config`]: per-model defaults, instance overrides and schedules
//! - [`sampling`]: CD-k sampling with m chains
//! - [`training`]: update rules, corruption, rate adaption, progress tracking
//! - [`model`]: the [`Rbm`] model and its optimization loop
//! - [`eval`]: inspection metrics and reconstruction
//! - [`data`]: dataset and network interfaces with in-memory implementations
//! - [`checkpoint`]: JSON checkpoints
//!
//! ## Example
//!
//! ```no_run
//! use rbm::{MemoryDataset, ModelKind, NoAbort, Rbm, Schedule};
//!
//! let labels: Vec<String> = (1..=4).map(|i| format!("v{i}")).collect();
//! let data = ndarray::Array2::from_shape_fn((200, 4), |(i, j)| ((i >> (j / 2)) & 1) as f32);
//! let mut dataset = MemoryDataset::new(labels.clone(), data, 0)?;
//! let mut model = Rbm::new(ModelKind::Rbm, labels, vec!["h1".into(), "h2".into()], 0)?;
//! model.init_params(&mut dataset)?;
//! assert!(model.optimize(&mut dataset, &Schedule::trivial("default"), &mut NoAbort));
//! # Ok::<(), rbm::RbmError>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod data;
pub mod eval;
pub mod model;
pub mod sampling;
pub mod training;

pub use crate::core::{
    LinkInfo, LinkMatrix, ParameterStore, RbmError, RbmResult, UnitDelta, UnitGroup, UnitKind,
};
pub use checkpoint::{load_checkpoint, save_checkpoint, CheckpointData};
pub use config::{
    Algorithm, ConfigOverrides, CorruptionKind, InitConfig, ModelKind, OptimizationConfig,
    ParamClass, Schedule,
};
pub use data::{DataSource, Dataset, MemoryDataset, Network, NodeGroup, Topology};
pub use eval::Metric;
pub use model::{ModelParams, OptimizeReport, Rbm};
pub use sampling::CdSample;
pub use training::{
    AbortSignal, CancellationToken, Deltas, EpochMetrics, LogObserver, NoAbort, ProgressObserver,
    ProgressTracker, RateController, TrackerEvent, TrackerPhase,
};
