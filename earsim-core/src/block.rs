//! # Audio Block Format
//!
//! The fixed frame format shared by every component in earsim. All audio
//! moves through the engine as mono blocks of [`BLOCK_SIZE`] f32 samples at
//! [`SAMPLE_RATE`] Hz; acoustic paths are impulse responses of [`IR_SIZE`]
//! samples convolved block-by-block.

use std::time::Instant;

/// Standard audio sample type.
pub type Sample = f32;

/// Samples per audio block (~5.3 ms at 48 kHz).
pub const BLOCK_SIZE: usize = 256;

/// Engine sample rate in Hz.
pub const SAMPLE_RATE: u32 = 48_000;

/// Impulse response length in samples (~21 ms at 48 kHz).
pub const IR_SIZE: usize = 1024;

/// FFT size for fast convolution: smallest power of two that fits a full
/// linear convolution of one block with one impulse response.
pub const FFT_SIZE: usize = 2048;

/// Number of complex bins in a real FFT of [`FFT_SIZE`] samples.
pub const SPECTRUM_SIZE: usize = FFT_SIZE / 2 + 1;

/// Convolution tail carried between blocks.
pub const OVERLAP_SIZE: usize = IR_SIZE - 1;

/// Wall-clock duration of one block in microseconds (~5333 us).
pub const BLOCK_PERIOD_US: u64 = (BLOCK_SIZE as u64 * 1_000_000) / SAMPLE_RATE as u64;

/// Capacity of the mic queue feeding the controller worker.
pub const MIC_QUEUE_CAPACITY: usize = 32;

const _: () = assert!(FFT_SIZE >= BLOCK_SIZE + IR_SIZE - 1);
const _: () = assert!(FFT_SIZE.is_power_of_two());
const _: () = assert!(IR_SIZE % BLOCK_SIZE == 0);

/// One block of mono audio samples in [-1, 1].
pub type Block = [Sample; BLOCK_SIZE];

/// An all-zero block.
pub const ZERO_BLOCK: Block = [0.0; BLOCK_SIZE];

/// The paired microphone observation produced by one plant tick.
#[derive(Debug, Clone, Copy)]
pub struct MicBlock {
    /// Outside (reference) microphone.
    pub outside: Block,
    /// In-ear (error) microphone.
    pub inear: Block,
    /// Monotonic capture time of the tick.
    pub timestamp: Instant,
    /// Strictly increasing sequence number, starting at 1.
    pub seq: u64,
}

impl MicBlock {
    /// Silent observation with sequence number zero.
    pub fn silent() -> Self {
        Self {
            outside: ZERO_BLOCK,
            inear: ZERO_BLOCK,
            timestamp: Instant::now(),
            seq: 0,
        }
    }
}

/// RMS level of a block.
pub fn rms(block: &Block) -> f32 {
    let sum_squares: f32 = block.iter().map(|&x| x * x).sum();
    (sum_squares / BLOCK_SIZE as f32).sqrt()
}

/// Peak absolute level of a block.
pub fn peak(block: &Block) -> f32 {
    block.iter().fold(0.0, |max, &x| max.max(x.abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_geometry() {
        // One block with one IR must fit the FFT without circular wrap.
        assert!(FFT_SIZE >= BLOCK_SIZE + IR_SIZE - 1);
        assert_eq!(BLOCK_PERIOD_US, 5333);
        assert_eq!(SPECTRUM_SIZE, 1025);
    }

    #[test]
    fn test_levels() {
        let mut block = ZERO_BLOCK;
        assert_eq!(rms(&block), 0.0);
        assert_eq!(peak(&block), 0.0);

        block.fill(0.5);
        assert!((rms(&block) - 0.5).abs() < 1e-6);
        assert_eq!(peak(&block), 0.5);

        block[0] = -0.9;
        assert_eq!(peak(&block), 0.9);
    }

    #[test]
    fn test_silent_mic_block() {
        let mb = MicBlock::silent();
        assert_eq!(mb.seq, 0);
        assert_eq!(peak(&mb.outside), 0.0);
        assert_eq!(peak(&mb.inear), 0.0);
    }
}
