//! Optimization configuration and schedules.
//!
//! The effective [`OptimizationConfig`] of a run is resolved by right-merging
//! three layers: the model type's defaults, the model instance's
//! [`ConfigOverrides`], and the overrides a [`Schedule`] carries for that
//! model type. Names (algorithm, metric, corruption) are parsed while
//! resolving, so an unknown name fails before any epoch runs.

use crate::core::{RbmError, RbmResult, UnitKind};
use crate::eval::Metric;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Model variant, selected by the kind of the visible units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Binary visible and hidden units
    Rbm,
    /// Gaussian visible units, binary hidden units
    Grbm,
}

impl ModelKind {
    /// Type name used as the schedule key.
    pub fn type_name(&self) -> &'static str {
        match self {
            ModelKind::Rbm => "rbm",
            ModelKind::Grbm => "grbm",
        }
    }

    pub fn visible_kind(&self) -> UnitKind {
        match self {
            ModelKind::Rbm => UnitKind::Sigmoid,
            ModelKind::Grbm => UnitKind::Gauss,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Parameter classes that an update may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamClass {
    Visible,
    Hidden,
    Links,
}

/// Optimization algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Contrastive divergence
    Cd,
    /// Contrastive divergence with variance maximizing rate adaption
    Vrcd,
}

impl FromStr for Algorithm {
    type Err = RbmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cd" => Ok(Algorithm::Cd),
            "vrcd" => Ok(Algorithm::Vrcd),
            _ => Err(RbmError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Noise model used to corrupt training batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionKind {
    None,
    /// Set entries to zero with probability `factor`
    Mask,
    /// Add gaussian noise with standard deviation `factor`
    Gauss,
    /// Replace entries by 0 or 1 (equally likely) with probability `factor`
    SaltAndPepper,
}

impl FromStr for CorruptionKind {
    type Err = RbmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CorruptionKind::None),
            "mask" => Ok(CorruptionKind::Mask),
            "gauss" => Ok(CorruptionKind::Gauss),
            "salt_and_pepper" | "salt & pepper" => Ok(CorruptionKind::SaltAndPepper),
            _ => Err(RbmError::InvalidConfig(format!("unknown corruption type '{s}'"))),
        }
    }
}

/// Parameter initialization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    /// Standard deviation of the initial weights
    pub w_sigma: f32,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self { w_sigma: 0.5 }
    }
}

/// Fully resolved configuration of one optimization run.
#[derive(Debug, Clone)]
pub struct OptimizationConfig {
    /// Run the model's dataset precondition before training
    pub check_dataset: bool,
    /// Parameter classes that are left untouched (layer-wise pretraining)
    pub ignore_units: Vec<ParamClass>,
    /// Number of times the whole epoch loop is repeated
    pub iterations: usize,
    /// Number of update steps (epochs) per iteration
    pub updates: usize,
    pub minibatch_size: usize,
    /// Epochs a minibatch is reused before it is refreshed
    pub minibatch_interval: usize,
    pub algorithm: Algorithm,
    /// Gibbs steps per chain (k)
    pub cd_steps: usize,
    /// Independent chains averaged per epoch (m)
    pub cd_iterations: usize,
    /// Global update rate
    pub update_rate: f32,
    pub factor_weights: f32,
    pub factor_hbias: f32,
    pub factor_vbias: f32,
    /// Factor for visible log-variance updates (gaussian visible units)
    pub factor_vlvar: f32,
    /// Simulated annealing; accepted but currently has no effect on updates
    pub sa_enable: bool,
    pub sa_init_temperature: f32,
    pub sa_annealing_factor: f32,
    /// Kullback-Leibler sparsity penalty on hidden biases
    pub kl_enable: bool,
    pub kl_rate: f32,
    /// Target mean activation of hidden units
    pub kl_expect: f32,
    pub corruption_enable: bool,
    pub corruption_type: CorruptionKind,
    pub corruption_factor: f32,
    /// Only update weights of active links
    pub use_adjacency: bool,
    pub vmra_enable: bool,
    /// Window length of the weight variance history
    pub vmra_length: usize,
    /// Epochs between two rate adaptions
    pub vmra_interval: usize,
    /// Epochs before the first rate adaption
    pub vmra_wait: usize,
    /// Gain applied to the variance slope
    pub vmra_factor: f32,
    pub vmra_min_rate: f32,
    pub vmra_max_rate: f32,
    pub inspect: bool,
    pub inspect_function: Metric,
    /// Seconds between two inspections
    pub inspect_interval: f64,
    pub estimate_time: bool,
    /// Seconds of warm-up before the duration estimate
    pub estimate_wait: f64,
}

impl OptimizationConfig {
    /// Defaults of a model type.
    pub fn defaults(kind: ModelKind) -> Self {
        let base = Self {
            check_dataset: true,
            ignore_units: Vec::new(),
            iterations: 1,
            updates: 100_000,
            minibatch_size: 100,
            minibatch_interval: 10,
            algorithm: Algorithm::Cd,
            cd_steps: 1,
            cd_iterations: 1,
            update_rate: 0.1,
            factor_weights: 1.0,
            factor_hbias: 0.1,
            factor_vbias: 0.1,
            factor_vlvar: 0.01,
            sa_enable: true,
            sa_init_temperature: 1.0,
            sa_annealing_factor: 1.0,
            kl_enable: true,
            kl_rate: 0.0,
            kl_expect: 0.5,
            corruption_enable: true,
            corruption_type: CorruptionKind::Mask,
            corruption_factor: 0.5,
            use_adjacency: false,
            vmra_enable: false,
            vmra_length: 3,
            vmra_interval: 10,
            vmra_wait: 0,
            vmra_factor: 10.0,
            vmra_min_rate: 0.0005,
            vmra_max_rate: 0.02,
            inspect: true,
            inspect_function: Metric::Accuracy,
            inspect_interval: 10.0,
            estimate_time: true,
            estimate_wait: 20.0,
        };
        match kind {
            ModelKind::Rbm => base,
            ModelKind::Grbm => Self {
                update_rate: 0.001,
                minibatch_size: 500,
                minibatch_interval: 1,
                corruption_enable: false,
                corruption_type: CorruptionKind::None,
                corruption_factor: 0.0,
                inspect_interval: 20.0,
                ..base
            },
        }
    }

    /// Resolve the effective configuration of a run.
    ///
    /// # Errors
    /// - `MissingSchedule` if the schedule has parameters but none for `kind`
    /// - `UnsupportedAlgorithm` / `UnsupportedMetric` for unknown names
    /// - `InvalidConfig` for out-of-range values
    pub fn resolve(
        kind: ModelKind,
        instance: &ConfigOverrides,
        schedule: &Schedule,
    ) -> RbmResult<Self> {
        let mut config = Self::defaults(kind);
        config.merge(instance)?;
        if let Some(params) = &schedule.params {
            let overrides = params.get(kind.type_name()).ok_or_else(|| {
                RbmError::MissingSchedule {
                    schedule: schedule.name.clone(),
                    model_type: kind.type_name().to_string(),
                }
            })?;
            config.merge(overrides)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Overwrite every field that is set in `o`.
    pub fn merge(&mut self, o: &ConfigOverrides) -> RbmResult<()> {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = &o.$field { self.$field = v.clone(); })*
            };
        }
        take!(
            check_dataset,
            ignore_units,
            iterations,
            updates,
            minibatch_size,
            minibatch_interval,
            cd_steps,
            cd_iterations,
            update_rate,
            factor_weights,
            factor_hbias,
            factor_vbias,
            factor_vlvar,
            sa_enable,
            sa_init_temperature,
            sa_annealing_factor,
            kl_enable,
            kl_rate,
            kl_expect,
            corruption_enable,
            corruption_factor,
            use_adjacency,
            vmra_enable,
            vmra_length,
            vmra_interval,
            vmra_wait,
            vmra_factor,
            vmra_min_rate,
            vmra_max_rate,
            inspect,
            inspect_interval,
            estimate_time,
            estimate_wait,
        );
        if let Some(name) = &o.algorithm {
            self.algorithm = name.parse()?;
        }
        if let Some(name) = &o.corruption_type {
            self.corruption_type = name.parse()?;
        }
        if let Some(name) = &o.inspect_function {
            self.inspect_function = name.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> RbmResult<()> {
        let positive = [
            ("iterations", self.iterations),
            ("minibatch_size", self.minibatch_size),
            ("minibatch_interval", self.minibatch_interval),
            ("cd_steps", self.cd_steps),
            ("cd_iterations", self.cd_iterations),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RbmError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if !(self.update_rate.is_finite() && self.update_rate >= 0.0) {
            return Err(RbmError::InvalidConfig(format!(
                "update_rate must be finite and >= 0, got {}",
                self.update_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.kl_expect) {
            return Err(RbmError::InvalidConfig(format!(
                "kl_expect must lie in [0, 1], got {}",
                self.kl_expect
            )));
        }
        if self.corruption_factor < 0.0 {
            return Err(RbmError::InvalidConfig(
                "corruption_factor must be >= 0".to_string(),
            ));
        }
        if self.vmra_enabled() {
            if self.vmra_length < 2 {
                return Err(RbmError::InvalidConfig(
                    "vmra_length must be >= 2 to fit a slope".to_string(),
                ));
            }
            if self.vmra_interval == 0 {
                return Err(RbmError::InvalidConfig("vmra_interval must be > 0".to_string()));
            }
            if self.vmra_min_rate > self.vmra_max_rate {
                return Err(RbmError::InvalidConfig(format!(
                    "vmra_min_rate {} exceeds vmra_max_rate {}",
                    self.vmra_min_rate, self.vmra_max_rate
                )));
            }
        }
        Ok(())
    }

    /// Rate adaption is on, either explicitly or through the `vrcd` algorithm.
    pub fn vmra_enabled(&self) -> bool {
        self.vmra_enable || self.algorithm == Algorithm::Vrcd
    }

    pub fn ignores(&self, class: ParamClass) -> bool {
        self.ignore_units.contains(&class)
    }
}

/// Partial configuration; every set field replaces the underlying value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverrides {
    pub check_dataset: Option<bool>,
    pub ignore_units: Option<Vec<ParamClass>>,
    pub iterations: Option<usize>,
    pub updates: Option<usize>,
    pub minibatch_size: Option<usize>,
    pub minibatch_interval: Option<usize>,
    pub algorithm: Option<String>,
    pub cd_steps: Option<usize>,
    pub cd_iterations: Option<usize>,
    pub update_rate: Option<f32>,
    pub factor_weights: Option<f32>,
    pub factor_hbias: Option<f32>,
    pub factor_vbias: Option<f32>,
    pub factor_vlvar: Option<f32>,
    pub sa_enable: Option<bool>,
    pub sa_init_temperature: Option<f32>,
    pub sa_annealing_factor: Option<f32>,
    pub kl_enable: Option<bool>,
    pub kl_rate: Option<f32>,
    pub kl_expect: Option<f32>,
    pub corruption_enable: Option<bool>,
    pub corruption_type: Option<String>,
    pub corruption_factor: Option<f32>,
    pub use_adjacency: Option<bool>,
    pub vmra_enable: Option<bool>,
    pub vmra_length: Option<usize>,
    pub vmra_interval: Option<usize>,
    pub vmra_wait: Option<usize>,
    pub vmra_factor: Option<f32>,
    pub vmra_min_rate: Option<f32>,
    pub vmra_max_rate: Option<f32>,
    pub inspect: Option<bool>,
    pub inspect_function: Option<String>,
    pub inspect_interval: Option<f64>,
    pub estimate_time: Option<bool>,
    pub estimate_wait: Option<f64>,
}

/// Optimization schedule, possibly covering several model types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schedule {
    pub name: String,
    /// Overrides keyed by model type name (`"rbm"`, `"grbm"`)
    #[serde(default)]
    pub params: Option<HashMap<String, ConfigOverrides>>,
}

impl Schedule {
    /// Schedule without parameters: defaults and instance config apply.
    pub fn trivial(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: None,
        }
    }

    /// Schedule with overrides for a single model type.
    pub fn with_params(name: impl Into<String>, kind: ModelKind, overrides: ConfigOverrides) -> Self {
        let mut params = HashMap::new();
        params.insert(kind.type_name().to_string(), overrides);
        Self {
            name: name.into(),
            params: Some(params),
        }
    }

    pub fn from_json(text: &str) -> RbmResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
