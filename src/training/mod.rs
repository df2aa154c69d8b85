//! Parameter updates, rate adaption and progress tracking.
//!
//! One contrastive divergence epoch is
//!
//! 1. corrupt the cached minibatch ([`corruption`])
//! 2. collect positive and negative statistics ([`crate::sampling`])
//! 3. compute per-class deltas ([`compute_deltas`])
//! 4. add them to the parameters ([`apply_deltas`])
//!
//! The global update rate may be changed between epochs by the
//! [`rate::RateController`]; the [`tracker::ProgressTracker`] is triggered
//! once per epoch and decides about abort and inspection.

pub mod corruption;
pub mod rate;
pub mod tracker;

use crate::config::{OptimizationConfig, ParamClass};
use crate::core::{ParameterStore, RbmError, RbmResult, UnitDelta, UnitKind};
use crate::sampling::{self, CdSample};
use ndarray::{Array1, Array2, Axis};
use rand::Rng;

pub use corruption::corrupt;
pub use rate::RateController;
pub use tracker::{
    AbortSignal, CancellationToken, LogObserver, NoAbort, ProgressObserver, ProgressTracker,
    TrackerEvent, TrackerPhase,
};

/// Additive parameter update of one epoch.
///
/// A class listed in `ignore_units` has no delta.
#[derive(Debug, Clone, PartialEq)]
pub struct Deltas {
    pub visible: Option<UnitDelta>,
    pub hidden: Option<UnitDelta>,
    pub weight: Option<Array2<f32>>,
}

impl Deltas {
    /// True if no delta contains NaN or infinite entries.
    pub fn is_finite(&self) -> bool {
        self.visible.as_ref().map_or(true, UnitDelta::is_finite)
            && self.hidden.as_ref().map_or(true, UnitDelta::is_finite)
            && self
                .weight
                .as_ref()
                .map_or(true, |w| w.iter().all(|x| x.is_finite()))
    }
}

/// Statistics of one training epoch.
#[derive(Debug, Clone, Copy)]
pub struct EpochMetrics {
    /// Mean absolute difference of data and model visible statistics
    pub reconstruction_error: f32,
    /// Number of samples in the minibatch
    pub batch_size: usize,
}

// ============================================================================
// Update rules
// ============================================================================

/// Compute the deltas of one epoch from its CD statistics.
///
/// # Algorithm
///
/// With `N` samples, rate `r` and per-class factors:
///
/// ```text
/// Δb_v = r·f_vbias · mean(v_data - v_model)
/// Δb_h = r·f_hbias · mean(h_data - h_model)
/// ΔW   = r·f_weights · (v_dataᵀ h_data - v_modelᵀ h_model) / N
/// ```
///
/// Gaussian visible units divide `Δb_v` and the rows of `ΔW` by
/// `σ² = exp(log_variance)` and additionally update the log-variance:
///
/// ```text
/// e(x)   = mean(0.5·(x - b_v)² - x ∘ (h Wᵀ))      per visible unit
/// Δlog σ² = r·f_vlvar · (e(v_data) - e(v_model)) / σ²
/// ```
///
/// With KL sparsity enabled the hidden delta is reduced by
/// `max(r, kl_rate) · (mean(h_data) - kl_expect)`; with `use_adjacency`
/// the weight delta of inactive links is zero.
pub fn compute_deltas(
    params: &ParameterStore,
    sample: &CdSample,
    config: &OptimizationConfig,
    rate: f32,
) -> RbmResult<Deltas> {
    params.check_batch(&sample.v_data)?;
    params.check_batch(&sample.v_model)?;
    let n = sample.batch_size();
    if n == 0 {
        return Err(RbmError::InvalidShape("empty minibatch".to_string()));
    }

    let visible = if config.ignores(ParamClass::Visible) {
        None
    } else {
        Some(delta_visible(params, sample, config, rate))
    };

    let hidden = if config.ignores(ParamClass::Hidden) {
        None
    } else {
        Some(delta_hidden(sample, config, rate))
    };

    let weight = if config.ignores(ParamClass::Links) {
        None
    } else {
        Some(delta_link(params, sample, config, rate))
    };

    Ok(Deltas {
        visible,
        hidden,
        weight,
    })
}

fn mean_rows(x: &Array2<f32>) -> Array1<f32> {
    x.mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(x.ncols()))
}

fn delta_visible(
    params: &ParameterStore,
    sample: &CdSample,
    config: &OptimizationConfig,
    rate: f32,
) -> UnitDelta {
    let diff = mean_rows(&sample.v_data) - mean_rows(&sample.v_model);
    let visible = &params.visible;
    match (visible.kind, visible.variance()) {
        (UnitKind::Gauss, Some(var)) => {
            let bias = rate * config.factor_vbias * &diff / &var;
            let data_energy = visible_energy(params, &sample.v_data, &sample.h_data);
            let model_energy = visible_energy(params, &sample.v_model, &sample.h_model);
            let log_variance = rate * config.factor_vlvar * (data_energy - model_energy) / &var;
            UnitDelta {
                bias,
                log_variance: Some(log_variance),
            }
        }
        _ => UnitDelta {
            bias: rate * config.factor_vbias * diff,
            log_variance: None,
        },
    }
}

/// Per-unit mean of `0.5·(v - b)² - v ∘ (h Wᵀ)`.
fn visible_energy(params: &ParameterStore, v: &Array2<f32>, h: &Array2<f32>) -> Array1<f32> {
    let centered = v - &params.visible.bias;
    let quad = centered.mapv(|x| 0.5 * x * x);
    let interaction = v * &h.dot(&params.links.weight.t());
    mean_rows(&(quad - interaction))
}

fn delta_hidden(sample: &CdSample, config: &OptimizationConfig, rate: f32) -> UnitDelta {
    let h_data = mean_rows(&sample.h_data);
    let mut bias = rate * config.factor_hbias * (&h_data - &mean_rows(&sample.h_model));
    if config.kl_enable {
        let kl_rate = rate.max(config.kl_rate);
        bias -= &(kl_rate * (h_data - config.kl_expect));
    }
    UnitDelta {
        bias,
        log_variance: None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn delta_link(
    params: &ParameterStore,
    sample: &CdSample,
    config: &OptimizationConfig,
    rate: f32,
) -> Array2<f32> {
    let n = sample.batch_size() as f32;
    let data = sample.v_data.t().dot(&sample.h_data);
    let model = sample.v_model.t().dot(&sample.h_model);
    let mut delta = (data - model) * (rate * config.factor_weights / n);

    if let (UnitKind::Gauss, Some(var)) = (params.visible.kind, params.visible.variance()) {
        delta /= &var.insert_axis(Axis(1));
    }
    if config.use_adjacency {
        ndarray::Zip::from(&mut delta)
            .and(&params.links.adjacency)
            .for_each(|d, &active| {
                if !active {
                    *d = 0.0;
                }
            });
    }
    delta
}

/// Add `deltas` to `params`.
///
/// Nothing is changed if any delta is non-finite.
///
/// # Errors
/// - `NumericInstability` if a delta contains NaN or infinite values
/// - `InvalidShape` if a delta does not match the parameters
pub fn apply_deltas(params: &mut ParameterStore, deltas: &Deltas) -> RbmResult<()> {
    if !deltas.is_finite() {
        return Err(RbmError::NumericInstability(
            "update contains non-finite values".to_string(),
        ));
    }
    if let Some(w) = &deltas.weight {
        if w.dim() != params.links.dim() {
            return Err(RbmError::InvalidShape(format!(
                "weight delta: expected {:?}, got {:?}",
                params.links.dim(),
                w.dim()
            )));
        }
    }

    if let Some(d) = &deltas.visible {
        params.visible.update(d)?;
    }
    if let Some(d) = &deltas.hidden {
        params.hidden.update(d)?;
    }
    if let Some(w) = &deltas.weight {
        params.links.update(w)?;
    }
    Ok(())
}

// ============================================================================
// Epoch
// ============================================================================

/// Run one CD epoch on `batch` and update `params`.
///
/// # Errors
/// - `InvalidShape` if the batch does not match the visible units
/// - `NumericInstability` if the update would introduce non-finite
///   parameters; `params` is left unchanged in that case
pub fn cd_epoch<R: Rng + ?Sized>(
    params: &mut ParameterStore,
    batch: &Array2<f32>,
    config: &OptimizationConfig,
    rate: f32,
    rng: &mut R,
) -> RbmResult<EpochMetrics> {
    let data = if config.corruption_enable {
        corrupt(batch, config.corruption_type, config.corruption_factor, rng)
    } else {
        batch.clone()
    };
    let sample = sampling::sample(params, data, config.cd_steps, config.cd_iterations, rng)?;
    let deltas = compute_deltas(params, &sample, config, rate)?;
    apply_deltas(params, &deltas)?;

    let residual = &sample.v_data - &sample.v_model;
    Ok(EpochMetrics {
        reconstruction_error: residual.mapv(f32::abs).mean().unwrap_or(0.0),
        batch_size: sample.batch_size(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CorruptionKind, ModelKind};
    use crate::core::UnitGroup;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn store(kind: UnitKind) -> ParameterStore {
        let visible = UnitGroup::new("visible", true, kind, vec!["a".into(), "b".into()]).unwrap();
        let hidden = UnitGroup::new("hidden", false, UnitKind::Sigmoid, vec!["h".into()]).unwrap();
        ParameterStore::dense(visible, hidden).unwrap()
    }

    fn plain_config() -> OptimizationConfig {
        let mut cfg = OptimizationConfig::defaults(ModelKind::Rbm);
        cfg.kl_enable = false;
        cfg.corruption_enable = false;
        cfg.factor_weights = 1.0;
        cfg.factor_vbias = 1.0;
        cfg.factor_hbias = 1.0;
        cfg.factor_vlvar = 1.0;
        cfg
    }

    fn fixed_sample() -> CdSample {
        CdSample {
            v_data: arr2(&[[1.0, 0.0], [1.0, 1.0]]),
            h_data: arr2(&[[1.0], [0.5]]),
            v_model: arr2(&[[0.5, 0.5], [0.5, 0.5]]),
            h_model: arr2(&[[0.5], [0.5]]),
        }
    }

    #[test]
    fn test_binary_deltas() {
        let p = store(UnitKind::Sigmoid);
        let d = compute_deltas(&p, &fixed_sample(), &plain_config(), 1.0).unwrap();

        let vb = d.visible.expect("visible delta").bias;
        assert_abs_diff_eq!(vb, arr1(&[0.5f32, 0.0]), epsilon = 1e-6);
        let hb = d.hidden.expect("hidden delta").bias;
        assert_abs_diff_eq!(hb, arr1(&[0.25f32]), epsilon = 1e-6);
        // data: [1.5, 0.5], model: [0.5, 0.5], averaged over 2 samples
        let w = d.weight.expect("weight delta");
        assert_abs_diff_eq!(w, arr2(&[[0.5f32], [0.0]]), epsilon = 1e-6);
    }

    #[test]
    fn test_rate_and_factors_scale_deltas() {
        let p = store(UnitKind::Sigmoid);
        let mut cfg = plain_config();
        cfg.factor_weights = 0.5;
        let d = compute_deltas(&p, &fixed_sample(), &cfg, 0.1).unwrap();
        assert_abs_diff_eq!(d.weight.unwrap()[[0, 0]], 0.025, epsilon = 1e-6);
        assert_abs_diff_eq!(d.visible.unwrap().bias[0], 0.05, epsilon = 1e-6);
    }

    #[test]
    fn test_kl_sparsity_pulls_towards_target() {
        let p = store(UnitKind::Sigmoid);
        let mut cfg = plain_config();
        cfg.kl_enable = true;
        cfg.kl_rate = 0.5;
        cfg.kl_expect = 0.25;
        let d = compute_deltas(&p, &fixed_sample(), &cfg, 0.1).unwrap();
        // base 0.1 · 0.25, sparsity max(0.1, 0.5) · (0.75 - 0.25)
        assert_abs_diff_eq!(d.hidden.unwrap().bias[0], 0.025 - 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_ignored_classes_have_no_delta() {
        let p = store(UnitKind::Sigmoid);
        let mut cfg = plain_config();
        cfg.ignore_units = vec![ParamClass::Visible, ParamClass::Links];
        let d = compute_deltas(&p, &fixed_sample(), &cfg, 1.0).unwrap();
        assert!(d.visible.is_none());
        assert!(d.weight.is_none());
        assert!(d.hidden.is_some());
    }

    #[test]
    fn test_adjacency_masks_weight_delta() {
        let mut p = store(UnitKind::Sigmoid);
        p.links.adjacency[[0, 0]] = false;
        let mut cfg = plain_config();
        cfg.use_adjacency = true;
        let d = compute_deltas(&p, &fixed_sample(), &cfg, 1.0).unwrap();
        assert_eq!(d.weight.unwrap()[[0, 0]], 0.0);
    }

    #[test]
    fn test_gauss_deltas_are_scaled_by_variance() {
        let mut p = store(UnitKind::Gauss);
        p.visible.log_variance = Some(arr1(&[(2.0f32).ln(), 0.0]));
        let d = compute_deltas(&p, &fixed_sample(), &plain_config(), 1.0).unwrap();
        let visible = d.visible.unwrap();
        assert_abs_diff_eq!(visible.bias, arr1(&[0.25f32, 0.0]), epsilon = 1e-6);
        assert_abs_diff_eq!(d.weight.unwrap(), arr2(&[[0.25f32], [0.0]]), epsilon = 1e-6);

        // zero weights: e(x) = mean(0.5·x²); data [0.5, 0.25], model [0.125, 0.125]
        let lvar = visible.log_variance.expect("log-variance delta");
        assert_abs_diff_eq!(lvar, arr1(&[0.1875f32, 0.125]), epsilon = 1e-6);
    }

    #[test]
    fn test_apply_rejects_non_finite() {
        let mut p = store(UnitKind::Sigmoid);
        let before = p.clone();
        let deltas = Deltas {
            visible: Some(UnitDelta {
                bias: arr1(&[1.0, 1.0]),
                log_variance: None,
            }),
            hidden: None,
            weight: Some(arr2(&[[f32::NAN], [0.0]])),
        };
        assert!(matches!(
            apply_deltas(&mut p, &deltas),
            Err(RbmError::NumericInstability(_))
        ));
        assert_eq!(p, before);
    }

    #[test]
    fn test_apply_adds_deltas() {
        let mut p = store(UnitKind::Sigmoid);
        let d = compute_deltas(&p, &fixed_sample(), &plain_config(), 1.0).unwrap();
        apply_deltas(&mut p, &d).unwrap();
        assert_abs_diff_eq!(p.visible.bias, arr1(&[0.5f32, 0.0]), epsilon = 1e-6);
        assert_abs_diff_eq!(p.links.weight, arr2(&[[0.5f32], [0.0]]), epsilon = 1e-6);
    }

    #[test]
    fn test_cd_epoch_keeps_shapes() {
        let mut p = store(UnitKind::Sigmoid);
        let mut cfg = plain_config();
        cfg.corruption_enable = true;
        cfg.corruption_type = CorruptionKind::Mask;
        cfg.cd_steps = 2;
        cfg.cd_iterations = 2;
        let batch = arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]]);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let m = cd_epoch(&mut p, &batch, &cfg, 0.1, &mut rng).unwrap();
        assert_eq!(m.batch_size, 3);
        assert!(m.reconstruction_error.is_finite());
        assert_eq!(p.links.dim(), (2, 1));
        assert_eq!(p.visible.bias.len(), 2);
        assert_eq!(p.hidden.bias.len(), 1);
    }

    #[test]
    fn test_cd_epoch_with_all_classes_ignored_is_noop() {
        let mut p = store(UnitKind::Sigmoid);
        p.links.weight = arr2(&[[0.3], [-0.2]]);
        let before = p.clone();
        let mut cfg = plain_config();
        cfg.ignore_units = vec![ParamClass::Visible, ParamClass::Hidden, ParamClass::Links];
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        cd_epoch(&mut p, &arr2(&[[1.0, 0.0]]), &cfg, 0.5, &mut rng).unwrap();
        assert_eq!(p, before);
    }
}
