//! Contrastive divergence sampling.
//!
//! # Algorithm
//!
//! Given a batch of visible data, CD-k with m chains returns
//! `(v_data, h_data, v_model, h_model)`:
//!
//! ```text
//! h_data = E[h | v_data]
//! for each of m chains:
//!     h = sample(h_data)
//!     repeat k times:
//!         v = E[v | h]
//!         h = E[h | v]              (last step)
//!         h = E[h | sample(v)]      (other steps), then h = sample(h)
//!     v_model += v / m
//!     h_model += h / m
//! ```
//!
//! The last step keeps expectations instead of samples to reduce sampling
//! noise in the negative phase.

use crate::core::{ParameterStore, RbmResult};
use ndarray::Array2;
use rand::Rng;

/// Positive and negative phase statistics of one CD step.
#[derive(Debug, Clone, PartialEq)]
pub struct CdSample {
    /// Visible data (possibly corrupted)
    pub v_data: Array2<f32>,
    /// Hidden expectation for `v_data`
    pub h_data: Array2<f32>,
    /// Visible model statistic after k Gibbs steps, averaged over m chains
    pub v_model: Array2<f32>,
    /// Hidden expectation for the model statistic
    pub h_model: Array2<f32>,
}

impl CdSample {
    pub fn batch_size(&self) -> usize {
        self.v_data.nrows()
    }
}

/// Run CD-k sampling with `m` chains.
///
/// `k = 1, m = 1` takes a fast path equivalent to a single chain.
///
/// # Errors
/// - `InvalidShape` if `data` does not match the visible units
pub fn sample<R: Rng + ?Sized>(
    params: &ParameterStore,
    data: Array2<f32>,
    k: usize,
    m: usize,
    rng: &mut R,
) -> RbmResult<CdSample> {
    let h_data = params.expect_hidden(&data)?;

    if k == 1 && m == 1 {
        let h_sample = params.sample_hidden(&h_data, rng);
        let v_model = params.expect_visible(&h_sample)?;
        let h_model = params.expect_hidden(&v_model)?;
        return Ok(CdSample {
            v_data: data,
            h_data,
            v_model,
            h_model,
        });
    }

    let (v_model, h_model) = gibbs_chains(params, &h_data, k, m, rng)?;
    Ok(CdSample {
        v_data: data,
        h_data,
        v_model,
        h_model,
    })
}

/// Average the final `(v, h)` expectations of `m` Gibbs chains of `k` steps.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn gibbs_chains<R: Rng + ?Sized>(
    params: &ParameterStore,
    h_data: &Array2<f32>,
    k: usize,
    m: usize,
    rng: &mut R,
) -> RbmResult<(Array2<f32>, Array2<f32>)> {
    let batch = h_data.nrows();
    let mut v_model = Array2::zeros((batch, params.visible.len()));
    let mut h_model = Array2::zeros(h_data.dim());
    let chains = m as f32;

    for _ in 0..m {
        let mut h_expect = h_data.clone();
        let mut v_expect = Array2::zeros((batch, params.visible.len()));
        for step in 0..k {
            let h_sample = params.sample_hidden(&h_expect, rng);
            v_expect = params.expect_visible(&h_sample)?;
            h_expect = if step + 1 == k {
                params.expect_hidden(&v_expect)?
            } else {
                let v_sample = params.sample_visible(&v_expect, rng);
                params.expect_hidden(&v_sample)?
            };
        }
        v_model.scaled_add(1.0 / chains, &v_expect);
        h_model.scaled_add(1.0 / chains, &h_expect);
    }

    Ok((v_model, h_model))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{UnitGroup, UnitKind};
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn params(seed: u64) -> ParameterStore {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let visible = UnitGroup::new(
            "visible",
            true,
            UnitKind::Sigmoid,
            (0..4).map(|i| format!("v{i}")).collect(),
        )
        .unwrap();
        let hidden = UnitGroup::new(
            "hidden",
            false,
            UnitKind::Sigmoid,
            (0..3).map(|i| format!("h{i}")).collect(),
        )
        .unwrap();
        let mut p = ParameterStore::dense(visible, hidden).unwrap();
        p.links.weight = Array2::random_using((4, 3), Uniform::new(-1.0f32, 1.0), &mut rng);
        p
    }

    fn batch() -> Array2<f32> {
        ndarray::arr2(&[
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 1.0],
            [1.0, 1.0, 1.0, 1.0],
        ])
    }

    #[test]
    fn test_sample_shapes() {
        let p = params(1);
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        for (k, m) in [(1, 1), (3, 1), (1, 4), (2, 2)] {
            let s = sample(&p, batch(), k, m, &mut rng).unwrap();
            assert_eq!(s.v_data, batch());
            assert_eq!(s.h_data.dim(), (3, 3));
            assert_eq!(s.v_model.dim(), (3, 4));
            assert_eq!(s.h_model.dim(), (3, 3));
            assert!(s.v_model.iter().all(|&x| (0.0..=1.0).contains(&x)));
        }
    }

    #[test]
    fn test_sample_is_reproducible() {
        let p = params(1);
        for (k, m) in [(1, 1), (2, 3)] {
            let a = sample(&p, batch(), k, m, &mut ChaCha8Rng::seed_from_u64(42)).unwrap();
            let b = sample(&p, batch(), k, m, &mut ChaCha8Rng::seed_from_u64(42)).unwrap();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_single_chain_matches_fast_path() {
        let p = params(3);
        let fast = sample(&p, batch(), 1, 1, &mut ChaCha8Rng::seed_from_u64(9)).unwrap();
        let (v_model, h_model) =
            gibbs_chains(&p, &fast.h_data, 1, 1, &mut ChaCha8Rng::seed_from_u64(9)).unwrap();
        assert_eq!(fast.v_model, v_model);
        assert_eq!(fast.h_model, h_model);
    }

    #[test]
    fn test_bad_batch_shape() {
        let p = params(1);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(sample(&p, Array2::zeros((2, 5)), 1, 1, &mut rng).is_err());
    }
}
