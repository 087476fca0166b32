//! Modulated colored noise generator.
//!
//! Ambient noise is modelled as Gaussian noise whose per-sample mean is
//! itself a low-pass-filtered random process: a wandering "cutoff" envelope
//! drives the sample distribution, giving noise with a slowly moving
//! spectral character rather than flat white noise. Each block is zero-mean
//! and peak-normalized to the configured amplitude.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::biquad::{Biquad, BiquadCoeffs};
use crate::block::{Block, BLOCK_SIZE, SAMPLE_RATE, ZERO_BLOCK};
use crate::config::NoiseConfig;

const SIGMA_FLOOR: f32 = 1e-6;

/// Stateful per-block noise source.
pub struct NoiseGenerator {
    params: NoiseConfig,
    /// Shapes the cutoff envelope across blocks.
    color_filter: Biquad,
    rng: StdRng,
}

impl NoiseGenerator {
    /// Build a generator. A fixed `seed` makes the stream deterministic.
    pub fn new(params: NoiseConfig, seed: Option<u64>) -> Self {
        let color_filter = Biquad::new(BiquadCoeffs::low_pass(
            params.fc_lpf_hz,
            SAMPLE_RATE as f32,
        ));
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            params,
            color_filter,
            rng,
        }
    }

    pub fn params(&self) -> &NoiseConfig {
        &self.params
    }

    /// Generate the next noise block.
    pub fn next_block(&mut self) -> Block {
        // A sample_sigma of zero means the synthetic noise is disabled; the
        // final normalization would scale everything to silence anyway.
        if self.params.sample_sigma == 0.0 {
            return ZERO_BLOCK;
        }

        let sigma_fc = self.params.sigma_fc_hz.max(SIGMA_FLOOR);
        let sample_sigma = self.params.sample_sigma.max(SIGMA_FLOOR);

        // Wandering cutoff envelope: folded Gaussian around the mean cutoff,
        // smoothed by the stateful color filter.
        let mut fc_raw = ZERO_BLOCK;
        for value in fc_raw.iter_mut() {
            let z: f32 = self.rng.sample(StandardNormal);
            *value = (self.params.fc_mean_hz + sigma_fc * z).abs();
        }
        let fc_smooth = self.color_filter.filter_block(&fc_raw);

        // Noise samples centered on the envelope.
        let mut noise = ZERO_BLOCK;
        for (sample, &fc) in noise.iter_mut().zip(fc_smooth.iter()) {
            let z: f32 = self.rng.sample(StandardNormal);
            *sample = fc.abs() + sample_sigma * z;
        }

        // Normalize to audio range: remove the DC offset left by the
        // envelope, then scale the peak to the configured amplitude.
        let mean: f32 = noise.iter().sum::<f32>() / BLOCK_SIZE as f32;
        for sample in noise.iter_mut() {
            *sample -= mean;
        }
        let peak = crate::block::peak(&noise);
        if peak > 1e-12 {
            let scale = self.params.sample_sigma / peak;
            for sample in noise.iter_mut() {
                *sample *= scale;
            }
        }

        noise
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> NoiseConfig {
        NoiseConfig {
            fc_mean_hz: 500.0,
            sigma_fc_hz: 50.0,
            fc_lpf_hz: 30.0,
            sample_sigma: 0.01,
        }
    }

    #[test]
    fn test_blocks_are_zero_mean_and_peak_normalized() {
        let mut generator = NoiseGenerator::new(test_params(), Some(7));
        for _ in 0..20 {
            let block = generator.next_block();
            let mean: f32 = block.iter().sum::<f32>() / BLOCK_SIZE as f32;
            assert!(mean.abs() < 1e-6, "mean {mean}");
            let peak = crate::block::peak(&block);
            assert!((peak - 0.01).abs() < 1e-6, "peak {peak}");
        }
    }

    #[test]
    fn test_zero_sample_sigma_is_silence() {
        let mut params = test_params();
        params.sample_sigma = 0.0;
        let mut generator = NoiseGenerator::new(params, Some(7));
        for _ in 0..5 {
            assert_eq!(generator.next_block(), ZERO_BLOCK);
        }
    }

    #[test]
    fn test_seeded_streams_are_reproducible() {
        let mut a = NoiseGenerator::new(test_params(), Some(42));
        let mut b = NoiseGenerator::new(test_params(), Some(42));
        for _ in 0..5 {
            assert_eq!(a.next_block(), b.next_block());
        }

        let mut c = NoiseGenerator::new(test_params(), Some(43));
        assert_ne!(a.next_block(), c.next_block());
    }

    #[test]
    fn test_blocks_vary_over_time() {
        let mut generator = NoiseGenerator::new(test_params(), Some(1));
        let first = generator.next_block();
        let second = generator.next_block();
        assert_ne!(first, second);
    }
}
