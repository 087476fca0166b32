use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::biquad::BiquadCoeffs;
use crate::block::IR_SIZE;

/// Complete engine configuration: timing, plant paths, secondary-path
/// dynamics, ambient-noise shaping, and the audio source driving the clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub timing: TimingConfig,
    pub dynamics: DynamicsConfig,
    pub noise: NoiseConfig,
    pub paths: PathsConfig,
    pub state: StateConfig,
    pub source: AudioSourceConfig,
    /// Seed for the simulation RNGs. `None` seeds from entropy.
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Modelled end-to-end loop latency in blocks (speaker command to
    /// audible effect). Depth of the control delay ring.
    pub system_latency_blocks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicsConfig {
    /// Amplitude of the secondary-path drift added per tick.
    pub noise_gain: f32,
}

/// Parameters of the modulated colored noise generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Mean of the per-sample cutoff process in Hz.
    pub fc_mean_hz: f32,
    /// Standard deviation of the cutoff process in Hz.
    pub sigma_fc_hz: f32,
    /// Color filter cutoff shaping the noise spectrum, in Hz.
    pub fc_lpf_hz: f32,
    /// Target peak amplitude of each noise block. Zero disables the
    /// synthetic noise entirely.
    pub sample_sigma: f32,
}

/// The four static acoustic paths, each a length-[`IR_SIZE`] impulse
/// response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Ambient noise to outside microphone.
    pub h: Vec<f32>,
    /// Ambient noise to in-ear microphone.
    pub p: Vec<f32>,
    /// Speaker acoustic leakage to outside microphone.
    pub c: Vec<f32>,
    /// Speaker coloration applied to the control command.
    pub speaker: Vec<f32>,
}

/// Initial state of the evolving secondary path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Initial secondary path (speaker to in-ear microphone).
    pub s: Vec<f32>,
    /// Drift anchor. Defaults to `s` when absent.
    pub s_true: Option<Vec<f32>>,
    /// Coefficients of the Butterworth low-pass shaping the drift noise.
    pub s_dynamics: BiquadCoeffs,
}

/// Selects the collaborator that drives the block clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AudioSourceConfig {
    /// Timer-driven source delivering silent input blocks.
    Synthetic {
        /// Pace ticks at the real block period. `false` runs the
        /// simulation as fast as the plant computes.
        realtime: bool,
    },
    /// WAV file played as the external input, one block per period.
    WavFile {
        input_path: PathBuf,
        /// Optional recording of the engine output (what the ear hears).
        output_path: Option<PathBuf>,
        /// Restart from the beginning when the file ends.
        loop_input: bool,
    },
}

/// Length-[`IR_SIZE`] impulse response with a single leading tap.
pub fn delta_ir(gain: f32) -> Vec<f32> {
    let mut ir = vec![0.0; IR_SIZE];
    ir[0] = gain;
    ir
}

impl Default for Config {
    fn default() -> Self {
        // Demo plant: direct noise paths, mild speaker leakage, and a
        // secondary path slightly below unity.
        Self {
            timing: TimingConfig {
                system_latency_blocks: 3,
            },
            dynamics: DynamicsConfig { noise_gain: 0.001 },
            noise: NoiseConfig {
                fc_mean_hz: 500.0,
                sigma_fc_hz: 50.0,
                fc_lpf_hz: 30.0,
                sample_sigma: 0.01,
            },
            paths: PathsConfig {
                h: delta_ir(1.0),
                p: delta_ir(0.8),
                c: delta_ir(0.1),
                speaker: delta_ir(1.0),
            },
            state: StateConfig {
                s: delta_ir(0.9),
                s_true: None,
                s_dynamics: BiquadCoeffs::identity(),
            },
            source: AudioSourceConfig::Synthetic { realtime: true },
            seed: None,
        }
    }
}

impl Config {
    /// Demo plant fed from a WAV file. The file is the ambient noise, so
    /// the synthetic generator is silenced.
    pub fn wav_playback(input_path: impl Into<PathBuf>, output_path: Option<PathBuf>) -> Self {
        let mut config = Self::default();
        config.noise.fc_mean_hz = 0.0;
        config.noise.sigma_fc_hz = 0.0;
        config.noise.sample_sigma = 0.0;
        config.source = AudioSourceConfig::WavFile {
            input_path: input_path.into(),
            output_path,
            loop_input: false,
        };
        config
    }

    /// Load a configuration from a JSON file, then apply environment
    /// overrides (`EARSIM_LATENCY_BLOCKS`, `EARSIM_SEED`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&content).context("failed to parse config JSON")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `EARSIM_*` environment overrides in place.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("EARSIM_LATENCY_BLOCKS") {
            if let Ok(blocks) = value.parse::<usize>() {
                self.timing.system_latency_blocks = blocks;
            }
        }
        if let Ok(value) = std::env::var("EARSIM_SEED") {
            if let Ok(seed) = value.parse::<u64>() {
                self.seed = Some(seed);
            }
        }
    }

    /// Check the configuration for faults that must stop engine startup.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.timing.system_latency_blocks >= 1,
            "system_latency_blocks must be at least 1"
        );

        for (name, ir) in [
            ("paths.h", &self.paths.h),
            ("paths.p", &self.paths.p),
            ("paths.c", &self.paths.c),
            ("paths.speaker", &self.paths.speaker),
            ("state.s", &self.state.s),
        ] {
            ensure!(
                ir.len() == IR_SIZE,
                "{name} has {} taps (expected {})",
                ir.len(),
                IR_SIZE
            );
        }
        if let Some(s_true) = &self.state.s_true {
            ensure!(
                s_true.len() == IR_SIZE,
                "state.s_true has {} taps (expected {})",
                s_true.len(),
                IR_SIZE
            );
        }

        ensure!(
            self.noise.sample_sigma >= 0.0 && self.noise.sample_sigma.is_finite(),
            "noise.sample_sigma must be finite and non-negative"
        );
        ensure!(
            self.noise.sigma_fc_hz >= 0.0 && self.noise.sigma_fc_hz.is_finite(),
            "noise.sigma_fc_hz must be finite and non-negative"
        );
        ensure!(
            self.noise.fc_lpf_hz.is_finite(),
            "noise.fc_lpf_hz must be finite"
        );
        ensure!(
            self.dynamics.noise_gain.is_finite(),
            "dynamics.noise_gain must be finite"
        );

        if let AudioSourceConfig::WavFile { input_path, .. } = &self.source {
            ensure!(
                !input_path.as_os_str().is_empty(),
                "wav_file source needs an input path"
            );
        }

        Ok(())
    }

    /// Effective drift anchor: `s_true` when set, otherwise the initial `s`.
    pub fn effective_s_true(&self) -> &[f32] {
        self.state.s_true.as_deref().unwrap_or(&self.state.s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_wrong_path_length_is_rejected() {
        let mut config = Config::default();
        config.paths.h = vec![1.0; 12];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_latency_is_rejected() {
        let mut config = Config::default();
        config.timing.system_latency_blocks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_sigma_is_rejected() {
        let mut config = Config::default();
        config.noise.sample_sigma = -0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wav_preset_silences_synthetic_noise() {
        let config = Config::wav_playback("noise.wav", None);
        assert_eq!(config.noise.sample_sigma, 0.0);
        assert!(matches!(
            config.source,
            AudioSourceConfig::WavFile { loop_input: false, .. }
        ));
        config.validate().unwrap();
    }

    #[test]
    fn test_effective_s_true_falls_back_to_initial_s() {
        let mut config = Config::default();
        assert_eq!(config.effective_s_true(), config.state.s.as_slice());

        config.state.s_true = Some(delta_ir(0.5));
        assert_eq!(config.effective_s_true()[0], 0.5);
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.timing.system_latency_blocks, 3);
        assert_eq!(parsed.paths.p[0], 0.8);
    }
}
