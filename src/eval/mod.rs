//! Inspection metrics evaluated on held-out data.

use crate::core::{ParameterStore, RbmError, RbmResult, UnitKind};
use ndarray::{Array2, Axis};
use std::fmt;
use std::str::FromStr;

/// Metric used by the progress tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    /// Mean absolute reconstruction error
    Error,
    /// Mean squared reconstruction error
    Mse,
    /// Per-unit coefficient of determination of the reconstruction, averaged
    Accuracy,
    /// Mean free energy of the data
    Energy,
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Error => "error",
            Metric::Mse => "mse",
            Metric::Accuracy => "accuracy",
            Metric::Energy => "energy",
        }
    }

    /// Evaluate the metric for `data` under the current parameters.
    ///
    /// # Errors
    /// - `InvalidShape` if `data` does not match the visible units
    #[allow(clippy::cast_precision_loss)]
    pub fn evaluate(&self, params: &ParameterStore, data: &Array2<f32>) -> RbmResult<f32> {
        if data.nrows() == 0 {
            return Err(RbmError::InvalidShape("no samples to evaluate".to_string()));
        }
        match self {
            Metric::Error => {
                let residual = data - &reconstruct(params, data)?;
                Ok(residual.mapv(f32::abs).mean().unwrap_or(0.0))
            }
            Metric::Mse => {
                let residual = data - &reconstruct(params, data)?;
                Ok(residual.mapv(|x| x * x).mean().unwrap_or(0.0))
            }
            Metric::Accuracy => {
                let residual = data - &reconstruct(params, data)?;
                let mean = data.mean_axis(Axis(0)).unwrap_or_default();
                let res_ss = residual.mapv(|x| x * x).sum_axis(Axis(0));
                let tot_ss = (data - &mean).mapv(|x| x * x).sum_axis(Axis(0));
                let per_unit = ndarray::Zip::from(&res_ss).and(&tot_ss).map_collect(|&r, &t| {
                    if t > f32::EPSILON {
                        1.0 - r / t
                    } else if r <= f32::EPSILON {
                        1.0
                    } else {
                        0.0
                    }
                });
                Ok(per_unit.mean().unwrap_or(0.0))
            }
            Metric::Energy => Ok(free_energy(params, data)?.mean().unwrap_or(0.0)),
        }
    }
}

impl FromStr for Metric {
    type Err = RbmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Metric::Error),
            "mse" => Ok(Metric::Mse),
            "accuracy" => Ok(Metric::Accuracy),
            "energy" => Ok(Metric::Energy),
            _ => Err(RbmError::UnsupportedMetric(s.to_string())),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Visible expectation of the hidden expectation of `data`.
pub fn reconstruct(params: &ParameterStore, data: &Array2<f32>) -> RbmResult<Array2<f32>> {
    let h = params.expect_hidden(data)?;
    params.expect_visible(&h)
}

/// Free energy per sample.
///
/// Binary visible: `F(v) = -bᵥ·v - Σⱼ softplus(cⱼ + (vW)ⱼ)`.
/// Gaussian visible: `F(v) = Σᵢ (vᵢ - bᵢ)² / 2σᵢ² - Σⱼ softplus(cⱼ + ((v/σ²)W)ⱼ)`.
pub fn free_energy(params: &ParameterStore, data: &Array2<f32>) -> RbmResult<ndarray::Array1<f32>> {
    params.check_batch(data)?;
    let visible = &params.visible;
    let (visible_term, input) = match (visible.kind, visible.variance()) {
        (UnitKind::Gauss, Some(var)) => {
            let var_row = var.insert_axis(Axis(0));
            let centered = data - &visible.bias;
            let quad = (&centered * &centered / (&var_row * 2.0)).sum_axis(Axis(1));
            (quad, data / &var_row)
        }
        _ => (-data.dot(&visible.bias), data.clone()),
    };
    let act = input.dot(&params.links.weight) + &params.hidden.bias;
    let hidden_term = act.mapv(softplus).sum_axis(Axis(1));
    Ok(visible_term - hidden_term)
}

fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::UnitGroup;
    use approx::assert_abs_diff_eq;

    fn params(kind: UnitKind) -> ParameterStore {
        let visible = UnitGroup::new("visible", true, kind, vec!["a".into(), "b".into()]).unwrap();
        let hidden = UnitGroup::new("hidden", false, UnitKind::Sigmoid, vec!["h".into()]).unwrap();
        ParameterStore::dense(visible, hidden).unwrap()
    }

    #[test]
    fn test_parse_metric() {
        assert_eq!("Accuracy".parse::<Metric>().unwrap(), Metric::Accuracy);
        assert!(matches!("f1".parse::<Metric>(), Err(RbmError::UnsupportedMetric(_))));
    }

    #[test]
    fn test_error_of_zero_model() {
        // zero weights and biases reconstruct every visible unit as 0.5
        let p = params(UnitKind::Sigmoid);
        let data = ndarray::arr2(&[[0.0, 1.0], [1.0, 1.0]]);
        let err = Metric::Error.evaluate(&p, &data).unwrap();
        assert_abs_diff_eq!(err, 0.5, epsilon = 1e-6);
        let mse = Metric::Mse.evaluate(&p, &data).unwrap();
        assert_abs_diff_eq!(mse, 0.25, epsilon = 1e-6);
    }

    #[test]
    fn test_accuracy_of_perfect_gauss_reconstruction() {
        // gaussian visible reconstruction of a zero model is the bias
        let mut p = params(UnitKind::Gauss);
        p.visible.bias = ndarray::arr1(&[1.0, 2.0]);
        let data = ndarray::arr2(&[[1.0, 2.0], [1.0, 2.0]]);
        let acc = Metric::Accuracy.evaluate(&p, &data).unwrap();
        assert_abs_diff_eq!(acc, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_free_energy_binary() {
        let p = params(UnitKind::Sigmoid);
        let data = ndarray::arr2(&[[1.0, 0.0]]);
        let f = free_energy(&p, &data).unwrap();
        assert_abs_diff_eq!(f[0], -(2.0f32).ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(
            Metric::Energy.evaluate(&p, &data).unwrap(),
            -(2.0f32).ln(),
            epsilon = 1e-6
        );
    }

    #[test]
    fn test_softplus_is_stable() {
        assert_abs_diff_eq!(softplus(0.0), (2.0f32).ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(softplus(100.0), 100.0, epsilon = 1e-4);
        assert!(softplus(-100.0) >= 0.0);
    }

    #[test]
    fn test_empty_data_rejected() {
        let p = params(UnitKind::Sigmoid);
        assert!(Metric::Error.evaluate(&p, &Array2::zeros((0, 2))).is_err());
    }
}
