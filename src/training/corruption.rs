//! Input corruption for denoising contrastive divergence.

use crate::config::CorruptionKind;
use ndarray::Array2;
use ndarray_rand::rand_distr::StandardNormal;
use rand::Rng;

/// Return a corrupted copy of `data`.
///
/// - `Mask`: each entry is set to 0 with probability `factor`
/// - `Gauss`: gaussian noise with standard deviation `factor` is added
/// - `SaltAndPepper`: each entry is replaced by 0 or 1 with probability `factor`
pub fn corrupt<R: Rng + ?Sized>(
    data: &Array2<f32>,
    kind: CorruptionKind,
    factor: f32,
    rng: &mut R,
) -> Array2<f32> {
    match kind {
        CorruptionKind::None => data.clone(),
        CorruptionKind::Mask => data.mapv(|x| if rng.gen::<f32>() < factor { 0.0 } else { x }),
        CorruptionKind::Gauss => data.mapv(|x| {
            let z: f32 = rng.sample(StandardNormal);
            x + factor * z
        }),
        CorruptionKind::SaltAndPepper => data.mapv(|x| {
            if rng.gen::<f32>() < factor {
                if rng.gen::<bool>() {
                    1.0
                } else {
                    0.0
                }
            } else {
                x
            }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_none_is_identity() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let data = Array2::from_elem((3, 3), 0.7f32);
        assert_eq!(corrupt(&data, CorruptionKind::None, 0.9, &mut rng), data);
    }

    #[test]
    fn test_mask_zeroes_a_fraction() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let data = Array2::ones((100, 20));
        let out = corrupt(&data, CorruptionKind::Mask, 0.5, &mut rng);
        let zeros = out.iter().filter(|&&x| x == 0.0).count();
        assert!((800..1200).contains(&zeros), "zeros = {zeros}");
        assert!(out.iter().all(|&x| x == 0.0 || x == 1.0));
    }

    #[test]
    fn test_mask_factor_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let data = Array2::ones((10, 10));
        assert_eq!(corrupt(&data, CorruptionKind::Mask, 0.0, &mut rng), data);
        assert!(corrupt(&data, CorruptionKind::Mask, 1.0, &mut rng)
            .iter()
            .all(|&x| x == 0.0));
    }

    #[test]
    fn test_salt_and_pepper_stays_binary() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let data = Array2::from_elem((50, 10), 0.5f32);
        let out = corrupt(&data, CorruptionKind::SaltAndPepper, 0.3, &mut rng);
        assert!(out.iter().all(|&x| x == 0.0 || x == 0.5 || x == 1.0));
        assert!(out.iter().any(|&x| x == 1.0));
        assert!(out.iter().any(|&x| x == 0.0));
    }

    #[test]
    fn test_gauss_noise_changes_values() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let data = Array2::zeros((200, 5));
        let out = corrupt(&data, CorruptionKind::Gauss, 0.1, &mut rng);
        let sd = out.std(0.0);
        assert!((sd - 0.1).abs() < 0.02, "sd = {sd}");
    }
}
