//! # earsim-core
//!
//! Core library of earsim, a real-time active noise cancellation
//! simulation harness for in-ear devices.
//!
//! This library provides:
//! - A linear acoustic plant: four static impulse-response paths coupling
//!   ambient noise and the speaker to an outside and an in-ear microphone,
//!   plus a slowly drifting secondary path
//! - Overlap-add FFT convolution sized for one block against one impulse
//!   response
//! - A latency-compensated control loop: the plant runs at a hard block
//!   cadence on the audio thread while the user's controller runs on its
//!   own thread under a one-block deadline, coupled through a delay ring
//! - Modulated colored noise with a wandering spectral envelope
//! - Pluggable audio sources (timer-driven synthetic, WAV file) that clock
//!   the whole simulation
//!
//! ## Example Usage
//!
//! ```no_run
//! use earsim_core::{AncEngine, Config};
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::default();
//! let mut engine = AncEngine::new(config)?;
//!
//! // The controller sees each microphone observation and answers with a
//! // speaker command that becomes audible `system_latency_blocks` later.
//! engine.set_process_mics(|mics, control| {
//!     for (out, &err) in control.iter_mut().zip(mics.inear.iter()) {
//!         *out = -err;
//!     }
//! });
//!
//! engine.start()?;
//! while let Some(mics) = engine.get_mics() {
//!     println!("block {}: in-ear rms {}", mics.seq, earsim_core::rms(&mics.inear));
//! }
//! engine.stop();
//! # Ok(())
//! # }
//! ```

pub mod biquad;
pub mod block;
pub mod config;
pub mod convolver;
pub mod delay_ring;
pub mod engine;
pub mod latest_slot;
pub mod noise;
pub mod plant;
pub mod source;

pub use biquad::{Biquad, BiquadCoeffs};
pub use block::{
    peak, rms, Block, MicBlock, Sample, BLOCK_PERIOD_US, BLOCK_SIZE, FFT_SIZE, IR_SIZE,
    MIC_QUEUE_CAPACITY, SAMPLE_RATE, ZERO_BLOCK,
};
pub use config::{delta_ir, AudioSourceConfig, Config, NoiseConfig, PathsConfig};
pub use convolver::FftConvolver;
pub use delay_ring::DelayRing;
pub use engine::{AncEngine, EngineState, MicLevels, ProcessMicsFn};
pub use latest_slot::LatestSlot;
pub use noise::NoiseGenerator;
pub use plant::PlantEngine;
pub use source::{create_source, AudioCallback, AudioSource, SyntheticSource, WavFileSource};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_construction_from_default_config() {
        let engine = AncEngine::new(Config::default());
        assert!(engine.is_ok());
    }

    #[test]
    fn test_reexported_constants_are_consistent() {
        assert_eq!(FFT_SIZE, 2048);
        assert!(FFT_SIZE >= BLOCK_SIZE + IR_SIZE - 1);
    }
}
