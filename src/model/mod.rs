//! The trainable model and its outer optimization loop.
//!
//! [`Rbm`] owns a [`ParameterStore`], its instance configuration and a
//! seeded random generator. [`Rbm::optimize`] resolves the effective
//! configuration for a [`Schedule`], checks the dataset and runs the
//! contrastive divergence epochs until the tracker reports exhaustion or
//! abort.

use crate::config::{
    ConfigOverrides, CorruptionKind, InitConfig, ModelKind, OptimizationConfig, Schedule,
};
use crate::core::{LinkInfo, ParameterStore, RbmError, RbmResult, UnitGroup, UnitKind};
use crate::data::{check_binary, check_gauss_normalized, Dataset, Network};
use crate::eval;
use crate::training::{
    self, AbortSignal, LogObserver, ProgressObserver, ProgressTracker, RateController,
    TrackerEvent,
};
use ndarray::{Array2, Axis, Zip};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Deep copy of a model's parameters, see [`Rbm::get_params`].
pub type ModelParams = ParameterStore;

/// Largest tolerated absolute mean of gaussian visible data.
const GAUSS_MAX_MEAN: f32 = 0.05;
/// Largest tolerated standard deviation of gaussian visible data.
const GAUSS_MAX_SDEV: f32 = 1.05;

/// Summary of one optimization run.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizeReport {
    /// Epochs performed
    pub epochs: usize,
    /// The run was stopped by the abort signal
    pub aborted: bool,
    /// Epochs whose update was dropped because it was not finite
    pub skipped_updates: usize,
    /// Update rate after the last epoch
    pub final_rate: f32,
    /// Mean absolute difference of data and model statistics in the last epoch
    pub reconstruction_error: Option<f32>,
    /// `(progress in percent, metric value)` per inspection
    pub inspections: Vec<(f32, f32)>,
}

/// Restricted Boltzmann machine with binary or gaussian visible units.
#[derive(Debug, Clone)]
pub struct Rbm {
    name: String,
    kind: ModelKind,
    params: ParameterStore,
    config: ConfigOverrides,
    init: InitConfig,
    rng: ChaCha8Rng,
}

impl Rbm {
    /// Create a model with zero parameters and dense links.
    ///
    /// # Errors
    /// - `InvalidTopology` for empty or duplicate labels
    pub fn new(
        kind: ModelKind,
        visible: Vec<String>,
        hidden: Vec<String>,
        seed: u64,
    ) -> RbmResult<Self> {
        Self::from_groups(kind, ("visible", visible), ("hidden", hidden), seed)
    }

    /// Create a model from a network with one visible and one hidden group.
    ///
    /// # Errors
    /// - `InvalidTopology` unless the network has exactly one group of each
    pub fn from_network<N: Network + ?Sized>(
        kind: ModelKind,
        network: &N,
        seed: u64,
    ) -> RbmResult<Self> {
        let groups = network.node_groups();
        let mut visible = groups.iter().filter(|g| g.visible);
        let mut hidden = groups.iter().filter(|g| !g.visible);
        let (Some(v), None, Some(h), None) =
            (visible.next(), visible.next(), hidden.next(), hidden.next())
        else {
            return Err(RbmError::InvalidTopology(format!(
                "{kind} requires exactly one visible and one hidden node group, got {}",
                groups.len()
            )));
        };

        Self::from_groups(
            kind,
            (v.name.as_str(), v.labels.clone()),
            (h.name.as_str(), h.labels.clone()),
            seed,
        )
    }

    /// Dense model over one named visible and one named hidden group.
    fn from_groups(
        kind: ModelKind,
        (visible_name, visible): (&str, Vec<String>),
        (hidden_name, hidden): (&str, Vec<String>),
        seed: u64,
    ) -> RbmResult<Self> {
        let visible = UnitGroup::new(visible_name, true, kind.visible_kind(), visible)?;
        let hidden = UnitGroup::new(hidden_name, false, UnitKind::Sigmoid, hidden)?;
        Ok(Self {
            name: kind.type_name().to_string(),
            kind,
            params: ParameterStore::dense(visible, hidden)?,
            config: ConfigOverrides::default(),
            init: InitConfig::default(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Create a model for `network` and check that `dataset` provides its visible units.
    ///
    /// # Errors
    /// - `InvalidTopology` on group structure or column label mismatch
    pub fn configure<N: Network + ?Sized, D: Dataset + ?Sized>(
        kind: ModelKind,
        network: &N,
        dataset: &D,
        seed: u64,
    ) -> RbmResult<Self> {
        let model = Self::from_network(kind, network, seed)?;
        model.check_columns(dataset)?;
        Ok(model)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Instance configuration, applied over the model type defaults.
    pub fn with_config(mut self, config: ConfigOverrides) -> Self {
        self.config = config;
        self
    }

    pub fn with_init(mut self, init: InitConfig) -> Self {
        self.init = init;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn params(&self) -> &ParameterStore {
        &self.params
    }

    pub fn config(&self) -> &ConfigOverrides {
        &self.config
    }

    pub fn set_config(&mut self, config: ConfigOverrides) {
        self.config = config;
    }

    // ========================================================================
    // Parameters
    // ========================================================================

    /// Initialize parameters from the statistics of `dataset`.
    ///
    /// Weights are drawn from `N(0, w_sigma)` and zeroed for inactive links.
    /// Sigmoid visible biases are the logit of the (clamped) column mean,
    /// gaussian visible biases the column mean with log-variance
    /// `ln(column variance)`. Hidden biases start at zero.
    ///
    /// # Errors
    /// - `InvalidShape` if the dataset does not match the visible units
    /// - `InvalidConfig` for a negative or non-finite `w_sigma`
    pub fn init_params<D: Dataset + ?Sized>(&mut self, dataset: &mut D) -> RbmResult<()> {
        let data = dataset.get_data(None)?;
        self.params.check_batch(&data)?;
        let mean = data
            .mean_axis(Axis(0))
            .ok_or_else(|| RbmError::InvalidDataset("dataset is empty".to_string()))?;

        let normal = Normal::new(0.0f32, self.init.w_sigma).map_err(|e| {
            RbmError::InvalidConfig(format!("w_sigma {}: {e}", self.init.w_sigma))
        })?;
        let mut weight = Array2::random_using(self.params.links.dim(), normal, &mut self.rng);
        Zip::from(&mut weight)
            .and(&self.params.links.adjacency)
            .for_each(|w, &active| {
                if !active {
                    *w = 0.0;
                }
            });

        let mut params = self.params.clone();
        match params.visible.kind {
            UnitKind::Sigmoid => {
                params.visible.bias = mean.mapv(|p| {
                    let p = p.clamp(0.01, 0.99);
                    (p / (1.0 - p)).ln()
                });
            }
            UnitKind::Gauss => {
                let var = data.var_axis(Axis(0), 0.0);
                params.visible.log_variance = Some(var.mapv(|v| v.max(1e-6).ln()));
                params.visible.bias = mean;
            }
        }
        params.hidden.bias.fill(0.0);
        params.links.weight = weight;
        params.validate()?;
        self.params = params;
        log::debug!("initialized parameters of '{}'", self.name);
        Ok(())
    }

    /// Deep copy of the current parameters.
    pub fn get_params(&self) -> ModelParams {
        self.params.clone()
    }

    /// Overwrite parameters of units and links whose labels match.
    ///
    /// Returns false, leaving the model unchanged, if `params` is invalid or
    /// its unit kinds differ from the model's.
    pub fn set_params(&mut self, params: &ModelParams) -> bool {
        match self.try_set_params(params) {
            Ok(()) => true,
            Err(err) => {
                log::error!("could not set parameters of '{}': {err}", self.name);
                false
            }
        }
    }

    fn try_set_params(&mut self, params: &ModelParams) -> RbmResult<()> {
        params.validate()?;
        if params.visible.kind != self.params.visible.kind
            || params.hidden.kind != self.params.hidden.kind
        {
            return Err(RbmError::InvalidTopology(format!(
                "parameters have unit kinds {}/{}, model has {}/{}",
                params.visible.kind.name(),
                params.hidden.kind.name(),
                self.params.visible.kind.name(),
                self.params.hidden.kind.name()
            )));
        }

        let mut next = self.params.clone();
        overwrite_units(&mut next.visible, &params.visible);
        overwrite_units(&mut next.hidden, &params.hidden);
        let hidden_map: Vec<Option<usize>> = next
            .hidden
            .labels
            .iter()
            .map(|l| params.hidden.index_of(l))
            .collect();
        for (i, label) in next.visible.labels.iter().enumerate() {
            let Some(k) = params.visible.index_of(label) else {
                continue;
            };
            for (j, l) in hidden_map.iter().enumerate() {
                if let Some(l) = *l {
                    next.links.adjacency[[i, j]] = params.links.adjacency[[k, l]];
                    next.links.weight[[i, j]] = params.links.weight[[k, l]];
                }
            }
        }
        next.validate()?;
        self.params = next;
        Ok(())
    }

    // ========================================================================
    // Links
    // ========================================================================

    /// Active links as `(visible, hidden)` label pairs.
    pub fn links(&self) -> Vec<(String, String)> {
        self.params.links()
    }

    /// Prune all links of a unit.
    pub fn unlink_unit(&mut self, label: &str) -> bool {
        self.params.unlink_unit(label)
    }

    pub fn remove_links(&mut self, links: &[(String, String)]) -> usize {
        self.params.remove_links(links)
    }

    pub fn link_info(&self, a: &str, b: &str) -> Option<LinkInfo> {
        self.params.link_info(a, b)
    }

    // ========================================================================
    // Mapping
    // ========================================================================

    /// Visible expectation of the hidden expectation of `data`.
    pub fn reconstruct(&self, data: &Array2<f32>) -> RbmResult<Array2<f32>> {
        eval::reconstruct(&self.params, data)
    }

    /// Hidden expectation of `data`.
    pub fn map_data(&self, data: &Array2<f32>) -> RbmResult<Array2<f32>> {
        self.params.expect_hidden(data)
    }

    // ========================================================================
    // Dataset checks
    // ========================================================================

    fn check_columns<D: Dataset + ?Sized>(&self, dataset: &D) -> RbmResult<()> {
        let columns = dataset.column_labels();
        if columns != self.params.visible.labels {
            return Err(RbmError::InvalidTopology(format!(
                "dataset columns {:?} do not match visible units {:?}",
                columns, self.params.visible.labels
            )));
        }
        Ok(())
    }

    /// Check the dataset precondition of the model type.
    ///
    /// Binary models require values in {0, 1}; gaussian models require
    /// gauss normalized data (|mean| < 0.05, standard deviation < 1.05).
    ///
    /// # Errors
    /// - `InvalidDataset` if the precondition does not hold
    pub fn check_dataset<D: Dataset + ?Sized>(&self, dataset: &mut D) -> RbmResult<()> {
        let data = dataset.get_data(None)?;
        self.params.check_batch(&data)?;
        match self.kind {
            ModelKind::Rbm => check_binary(&data),
            ModelKind::Grbm => check_gauss_normalized(&data, GAUSS_MAX_MEAN, GAUSS_MAX_SDEV),
        }
    }

    // ========================================================================
    // Optimization
    // ========================================================================

    /// Optimize parameters with `dataset` under `schedule`.
    ///
    /// Progress is reported through [`LogObserver`]. Returns false if the run
    /// could not be started or failed; the error is logged. A user abort is
    /// a success.
    pub fn optimize<D: Dataset + ?Sized>(
        &mut self,
        dataset: &mut D,
        schedule: &Schedule,
        abort: &mut dyn AbortSignal,
    ) -> bool {
        let mut observer = LogObserver;
        match self.try_optimize(dataset, schedule, abort, &mut observer) {
            Ok(report) => {
                log::info!(
                    "optimization of '{}' finished after {} updates{}",
                    self.name,
                    report.epochs,
                    if report.aborted { " (aborted)" } else { "" }
                );
                true
            }
            Err(err) => {
                log::error!("optimization of '{}' failed: {err}", self.name);
                false
            }
        }
    }

    /// Optimize parameters and return a report of the run.
    ///
    /// # Algorithm
    /// 1. resolve defaults ← instance config ← schedule overrides
    /// 2. check dataset columns and, unless disabled, the dataset precondition
    /// 3. for each iteration and epoch: refresh the minibatch every
    ///    `minibatch_interval` epochs, adapt the rate if due, run one CD
    ///    epoch, trigger the tracker
    ///
    /// Epochs whose update is not finite leave the parameters unchanged and
    /// are counted in [`OptimizeReport::skipped_updates`].
    ///
    /// # Errors
    /// Configuration and dataset errors are returned before any parameter
    /// is changed.
    pub fn try_optimize<D: Dataset + ?Sized>(
        &mut self,
        dataset: &mut D,
        schedule: &Schedule,
        abort: &mut dyn AbortSignal,
        observer: &mut dyn ProgressObserver,
    ) -> RbmResult<OptimizeReport> {
        let config = OptimizationConfig::resolve(self.kind, &self.config, schedule)?;
        self.check_columns(&*dataset)?;
        if config.check_dataset {
            self.check_dataset(dataset)?;
        }

        log::info!(
            "optimize '{}' ({}) using schedule '{}': {:?}, {} updates × {} iterations",
            self.name,
            self.kind,
            schedule.name,
            config.algorithm,
            config.updates,
            config.iterations
        );
        if config.vmra_enabled() {
            log::info!("using variance maximizing rate adaption");
        }
        if config.kl_enable {
            log::info!("using Kullback-Leibler penalty for sparse coding");
        }
        if config.corruption_enable && config.corruption_type != CorruptionKind::None {
            log::info!(
                "using {:?} corruption with factor {}",
                config.corruption_type,
                config.corruption_factor
            );
        }
        if config.sa_enable {
            log::debug!("simulated annealing is configured but does not affect updates");
        }

        let test_data = if config.inspect {
            Some(dataset.get_data(None)?)
        } else {
            None
        };
        let mut tracker = ProgressTracker::new(&config, abort, observer);
        if let Some(data) = test_data {
            tracker = tracker.with_test_data(data);
        }
        let mut controller = config
            .vmra_enabled()
            .then(|| RateController::from_config(&config));

        let mut rate = config.update_rate;
        let mut skipped_updates = 0;
        let mut reconstruction_error = None;
        let mut batch = Array2::zeros((0, self.params.visible.len()));

        'run: for iteration in 0..config.iterations {
            for epoch in 0..config.updates {
                let step = iteration * config.updates + epoch;
                if epoch % config.minibatch_interval == 0 {
                    batch = dataset.get_data(Some(config.minibatch_size))?;
                }

                if let Some(controller) = controller.as_mut() {
                    if controller.is_due(step) {
                        if let Some(adapted) = controller.maybe_adapt(&self.params.links) {
                            log::debug!("epoch {step}: update rate {rate} → {adapted}");
                            rate = adapted;
                        }
                    }
                }

                match training::cd_epoch(&mut self.params, &batch, &config, rate, &mut self.rng) {
                    Ok(metrics) => reconstruction_error = Some(metrics.reconstruction_error),
                    Err(RbmError::NumericInstability(msg)) => {
                        skipped_updates += 1;
                        log::warn!("epoch {step}: {msg}; update skipped");
                    }
                    Err(err) => return Err(err),
                }

                match tracker.trigger(&self.params) {
                    TrackerEvent::Continue => {}
                    TrackerEvent::Abort | TrackerEvent::Finished => break 'run,
                }
            }
        }

        Ok(OptimizeReport {
            epochs: tracker.epoch(),
            aborted: tracker.is_aborted(),
            skipped_updates,
            final_rate: rate,
            reconstruction_error,
            inspections: tracker.into_inspection_log(),
        })
    }
}

/// Copy bias and log-variance of units whose labels appear in `source`.
fn overwrite_units(target: &mut UnitGroup, source: &UnitGroup) {
    for (i, label) in target.labels.iter().enumerate() {
        let Some(k) = source.index_of(label) else {
            continue;
        };
        target.bias[i] = source.bias[k];
        if let (Some(dst), Some(src)) = (target.log_variance.as_mut(), source.log_variance.as_ref()) {
            dst[i] = src[k];
        }
    }
}
