//! Unit activation and sampling primitives.
//!
//! Every unit group is either sigmoidal (binary, Bernoulli distributed) or
//! gaussian (continuous, normally distributed around a linear expectation).

use ndarray::{Array1, Array2, Zip};
use ndarray_rand::rand_distr::StandardNormal;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Activation kind of a unit group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Logistic expectation, Bernoulli samples
    Sigmoid,
    /// Linear expectation, gaussian samples with variance `exp(log_variance)`
    Gauss,
}

impl UnitKind {
    /// Map the summed input (bias included) of a group to its expectation.
    pub fn expect(&self, activation: Array2<f32>) -> Array2<f32> {
        match self {
            UnitKind::Sigmoid => activation.mapv_into(sigmoid),
            UnitKind::Gauss => activation,
        }
    }

    /// Draw a stochastic sample around the given expectation.
    ///
    /// `log_variance` is only read by gaussian groups; a missing vector is
    /// treated as unit variance.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        expect: &Array2<f32>,
        log_variance: Option<&Array1<f32>>,
        rng: &mut R,
    ) -> Array2<f32> {
        match self {
            UnitKind::Sigmoid => expect.mapv(|p| if rng.gen::<f32>() < p { 1.0 } else { 0.0 }),
            UnitKind::Gauss => {
                let sdev: Array1<f32> = match log_variance {
                    Some(lvar) => lvar.mapv(|l| (0.5 * l).exp()),
                    None => Array1::ones(expect.ncols()),
                };
                let mut out = expect.clone();
                for mut row in out.rows_mut() {
                    Zip::from(&mut row).and(&sdev).for_each(|x, &s| {
                        let z: f32 = rng.sample(StandardNormal);
                        *x += s * z;
                    });
                }
                out
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UnitKind::Sigmoid => "sigmoid",
            UnitKind::Gauss => "gauss",
        }
    }
}

/// Logistic function.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
