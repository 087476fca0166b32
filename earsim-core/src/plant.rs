//! Acoustic plant of the in-ear device.
//!
//! Four static paths couple the ambient noise and the speaker to the two
//! microphones, with a speaker-coloration stage in front of the acoustic
//! paths:
//!
//! ```text
//! outside = H * n + C * speaker(u)
//! inear   = P * n + S * speaker(u)
//! ```
//!
//! The secondary path S (speaker to in-ear microphone) is not static: real
//! devices see it drift as the fit around the ear changes. Each tick S is
//! re-derived from an immutable anchor plus low-pass-filtered noise,
//! renormalized to the anchor's energy, and clamped.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::biquad::Biquad;
use crate::block::{Block, BLOCK_SIZE, IR_SIZE, ZERO_BLOCK};
use crate::config::Config;
use crate::convolver::FftConvolver;

const NORM_EPSILON: f32 = 1e-12;

fn l2_norm(ir: &[f32]) -> f32 {
    ir.iter().map(|&x| x * x).sum::<f32>().sqrt()
}

/// The full propagation model: five convolvers plus the S drift process.
pub struct PlantEngine {
    h: FftConvolver,
    p: FftConvolver,
    c: FftConvolver,
    speaker: FftConvolver,
    s: FftConvolver,

    /// Current secondary path, re-installed into `s` on every drift step.
    s_ir: Vec<f32>,
    /// Drift anchor, captured once at construction.
    s_true: Vec<f32>,
    s_true_norm: f32,

    noise_gain: f32,
    s_dynamics: Biquad,
    rng: StdRng,

    // Scratch blocks for propagation.
    u_spk: Block,
    y_h: Block,
    y_p: Block,
    y_c: Block,
    y_s: Block,
}

impl PlantEngine {
    pub fn new(config: &Config) -> Result<Self> {
        let s_true = config.effective_s_true().to_vec();
        let s_true_norm = l2_norm(&s_true);
        debug!(
            s_norm = s_true_norm,
            noise_gain = config.dynamics.noise_gain,
            "building plant"
        );

        let rng = match config.seed {
            // Decorrelate from the ambient-noise stream, which uses the
            // seed directly.
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(0x5eed)),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            h: FftConvolver::with_impulse_response(&config.paths.h)?,
            p: FftConvolver::with_impulse_response(&config.paths.p)?,
            c: FftConvolver::with_impulse_response(&config.paths.c)?,
            speaker: FftConvolver::with_impulse_response(&config.paths.speaker)?,
            s: FftConvolver::with_impulse_response(&config.state.s)?,
            s_ir: config.state.s.clone(),
            s_true,
            s_true_norm,
            noise_gain: config.dynamics.noise_gain,
            s_dynamics: Biquad::new(config.state.s_dynamics),
            rng,
            u_spk: ZERO_BLOCK,
            y_h: ZERO_BLOCK,
            y_p: ZERO_BLOCK,
            y_c: ZERO_BLOCK,
            y_s: ZERO_BLOCK,
        })
    }

    /// Advance the secondary-path drift by one tick and install the result.
    pub fn update_s(&mut self) -> Result<()> {
        // Filtered white noise across the whole impulse response, generated
        // block-by-block through the stateful dynamics filter.
        let mut w_lp = vec![0.0f32; IR_SIZE];
        for chunk in w_lp.chunks_exact_mut(BLOCK_SIZE) {
            let mut w_block = ZERO_BLOCK;
            for sample in w_block.iter_mut() {
                *sample = self.rng.gen_range(-1.0..1.0);
            }
            chunk.copy_from_slice(&self.s_dynamics.filter_block(&w_block));
        }

        for (tap, (&anchor, &w)) in self
            .s_ir
            .iter_mut()
            .zip(self.s_true.iter().zip(w_lp.iter()))
        {
            *tap = anchor + self.noise_gain * w;
        }

        // Keep the drifted path at the anchor's energy, then clamp so a
        // misconfigured gain cannot blow up the loop.
        let norm = l2_norm(&self.s_ir);
        if self.s_true_norm > NORM_EPSILON && norm > NORM_EPSILON {
            let scale = self.s_true_norm / norm;
            for tap in self.s_ir.iter_mut() {
                *tap *= scale;
            }
        }
        for tap in self.s_ir.iter_mut() {
            *tap = tap.clamp(-1.0, 1.0);
        }

        self.s.set_impulse_response(&self.s_ir)
    }

    /// Run one block through the plant.
    ///
    /// `u` is the delayed control command, `n` the ambient noise.
    pub fn propagate(
        &mut self,
        u: &Block,
        n: &Block,
        outside: &mut Block,
        inear: &mut Block,
    ) -> Result<()> {
        // Speaker coloration first, then the two speaker paths.
        self.speaker.step(u, &mut self.u_spk)?;
        self.c.step(&self.u_spk, &mut self.y_c)?;
        self.s.step(&self.u_spk, &mut self.y_s)?;

        // Noise paths.
        self.h.step(n, &mut self.y_h)?;
        self.p.step(n, &mut self.y_p)?;

        for i in 0..BLOCK_SIZE {
            outside[i] = self.y_h[i] + self.y_c[i];
            inear[i] = self.y_p[i] + self.y_s[i];
        }

        Ok(())
    }

    /// Current (drifted) secondary path.
    pub fn secondary_path(&self) -> &[f32] {
        &self.s_ir
    }

    /// L2 norm of the current secondary path.
    pub fn secondary_path_norm(&self) -> f32 {
        l2_norm(&self.s_ir)
    }

    /// L2 norm of the drift anchor.
    pub fn true_path_norm(&self) -> f32 {
        self.s_true_norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::delta_ir;

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.seed = Some(99);
        config.noise.sample_sigma = 0.0;
        config
    }

    #[test]
    fn test_delta_paths_propagate_directly() {
        let mut config = quiet_config();
        config.paths.h = delta_ir(1.0);
        config.paths.p = delta_ir(0.0);
        config.paths.c = delta_ir(0.0);
        config.paths.speaker = delta_ir(0.0);
        config.state.s = delta_ir(0.0);
        config.dynamics.noise_gain = 0.0;

        let mut plant = PlantEngine::new(&config).unwrap();

        let mut n = ZERO_BLOCK;
        n[0] = 1.0;
        let mut outside = ZERO_BLOCK;
        let mut inear = ZERO_BLOCK;
        plant
            .propagate(&ZERO_BLOCK, &n, &mut outside, &mut inear)
            .unwrap();

        assert!((outside[0] - 1.0).abs() < 1e-4);
        for i in 1..BLOCK_SIZE {
            assert!(outside[i].abs() < 1e-4, "outside[{i}] = {}", outside[i]);
        }
        assert!(crate::block::peak(&inear) < 1e-4);

        // Everything decays to silence on the following block.
        plant
            .propagate(&ZERO_BLOCK, &ZERO_BLOCK, &mut outside, &mut inear)
            .unwrap();
        assert!(crate::block::peak(&outside) < 1e-4);
        assert!(crate::block::peak(&inear) < 1e-4);
    }

    #[test]
    fn test_identity_pipeline_adds_control_to_noise() {
        let mut config = quiet_config();
        config.paths.h = delta_ir(1.0);
        config.paths.p = delta_ir(1.0);
        config.paths.c = delta_ir(1.0);
        config.paths.speaker = delta_ir(1.0);
        config.state.s = delta_ir(1.0);
        config.dynamics.noise_gain = 0.0;

        let mut plant = PlantEngine::new(&config).unwrap();

        let mut n = ZERO_BLOCK;
        for (i, sample) in n.iter_mut().enumerate() {
            *sample = (i as f32 * 0.05).sin() * 0.3;
        }
        let u = [1.0f32; BLOCK_SIZE];

        let mut outside = ZERO_BLOCK;
        let mut inear = ZERO_BLOCK;
        plant.propagate(&u, &n, &mut outside, &mut inear).unwrap();

        for i in 0..BLOCK_SIZE {
            assert!(
                (inear[i] - (n[i] + 1.0)).abs() < 1e-3,
                "inear[{i}] = {} vs {}",
                inear[i],
                n[i] + 1.0
            );
        }
    }

    #[test]
    fn test_drift_preserves_secondary_path_energy() {
        let mut config = quiet_config();
        config.dynamics.noise_gain = 0.01;
        let mut plant = PlantEngine::new(&config).unwrap();
        let anchor_norm = plant.true_path_norm();

        for _ in 0..200 {
            plant.update_s().unwrap();
            let norm = plant.secondary_path_norm();
            assert!(
                (norm - anchor_norm).abs() / anchor_norm < 0.01,
                "norm {norm} drifted from {anchor_norm}"
            );
        }
    }

    #[test]
    fn test_drift_actually_moves_the_path() {
        let mut config = quiet_config();
        config.dynamics.noise_gain = 0.01;
        let mut plant = PlantEngine::new(&config).unwrap();
        let before = plant.secondary_path().to_vec();
        plant.update_s().unwrap();
        assert_ne!(before, plant.secondary_path());
    }

    #[test]
    fn test_drifted_taps_stay_clamped() {
        let mut config = quiet_config();
        // Absurd gain to force the clamp.
        config.dynamics.noise_gain = 100.0;
        let mut plant = PlantEngine::new(&config).unwrap();
        for _ in 0..10 {
            plant.update_s().unwrap();
            for &tap in plant.secondary_path() {
                assert!((-1.0..=1.0).contains(&tap));
            }
        }
    }

    #[test]
    fn test_zero_noise_gain_holds_s_at_anchor() {
        let mut config = quiet_config();
        config.dynamics.noise_gain = 0.0;
        let mut plant = PlantEngine::new(&config).unwrap();
        let anchor = plant.secondary_path().to_vec();
        for _ in 0..5 {
            plant.update_s().unwrap();
        }
        assert_eq!(anchor, plant.secondary_path());
    }

    #[test]
    fn test_zero_noise_gain_snaps_s_to_the_anchor() {
        // A path that starts away from its anchor must land on the anchor
        // after one drift step once the noise term vanishes.
        let mut config = quiet_config();
        config.dynamics.noise_gain = 0.0;
        config.state.s = delta_ir(0.9);
        config.state.s_true = Some(delta_ir(0.5));
        let mut plant = PlantEngine::new(&config).unwrap();

        assert!((plant.secondary_path()[0] - 0.9).abs() < 1e-7);
        plant.update_s().unwrap();

        let s = plant.secondary_path();
        assert!((s[0] - 0.5).abs() < 1e-7, "s[0] = {}", s[0]);
        assert!(s[1..].iter().all(|&tap| tap.abs() < 1e-7));
        assert!((plant.secondary_path_norm() - plant.true_path_norm()).abs() < 1e-6);
    }
}
