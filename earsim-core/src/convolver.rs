//! Fast fixed-length FIR convolution using the overlap-add FFT method.
//!
//! Each convolver models one acoustic path: a length-[`IR_SIZE`] impulse
//! response applied to a stream of length-[`BLOCK_SIZE`] blocks. The impulse
//! response spectrum is cached at [`FftConvolver::set_impulse_response`] time,
//! so a steady-state step is two FFTs and one pointwise multiply.

use std::sync::Arc;

use anyhow::{ensure, Result};
use num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::block::{Block, BLOCK_SIZE, FFT_SIZE, IR_SIZE, OVERLAP_SIZE, SPECTRUM_SIZE};

/// Streaming overlap-add convolver for one impulse response.
pub struct FftConvolver {
    fft_forward: Arc<dyn RealToComplex<f32>>,
    fft_inverse: Arc<dyn ComplexToReal<f32>>,
    fft_scratch: Vec<Complex<f32>>,

    /// Cached spectrum of the zero-padded impulse response.
    ir_spectrum: Vec<Complex<f32>>,
    ir: Vec<f32>,

    /// Convolution tail of the previous block, added into the next output.
    overlap: Vec<f32>,

    time_buf: Vec<f32>,
    freq_buf: Vec<Complex<f32>>,
}

impl FftConvolver {
    /// Create a convolver with the zero impulse response installed. Until an
    /// impulse response is set, every output block is silence.
    pub fn new() -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let fft_forward = planner.plan_fft_forward(FFT_SIZE);
        let fft_inverse = planner.plan_fft_inverse(FFT_SIZE);
        let scratch_len = fft_forward
            .get_scratch_len()
            .max(fft_inverse.get_scratch_len());

        Self {
            fft_forward,
            fft_inverse,
            fft_scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            ir_spectrum: vec![Complex::new(0.0, 0.0); SPECTRUM_SIZE],
            ir: vec![0.0; IR_SIZE],
            overlap: vec![0.0; OVERLAP_SIZE],
            time_buf: vec![0.0; FFT_SIZE],
            freq_buf: vec![Complex::new(0.0, 0.0); SPECTRUM_SIZE],
        }
    }

    /// Create a convolver with `ir` already installed.
    pub fn with_impulse_response(ir: &[f32]) -> Result<Self> {
        let mut convolver = Self::new();
        convolver.set_impulse_response(ir)?;
        Ok(convolver)
    }

    /// Install a new impulse response and precompute its spectrum.
    ///
    /// The overlap state is kept so a path can be replaced mid-stream
    /// without a discontinuity from discarded tail energy.
    pub fn set_impulse_response(&mut self, ir: &[f32]) -> Result<()> {
        ensure!(
            ir.len() == IR_SIZE,
            "impulse response length {} (expected {})",
            ir.len(),
            IR_SIZE
        );

        self.ir.copy_from_slice(ir);

        self.time_buf.fill(0.0);
        self.time_buf[..IR_SIZE].copy_from_slice(ir);
        self.fft_forward.process_with_scratch(
            &mut self.time_buf,
            &mut self.ir_spectrum,
            &mut self.fft_scratch,
        )?;

        Ok(())
    }

    /// Currently installed impulse response.
    pub fn impulse_response(&self) -> &[f32] {
        &self.ir
    }

    /// Convolve one input block, writing one output block.
    pub fn step(&mut self, input: &Block, output: &mut Block) -> Result<()> {
        // Forward transform of the zero-padded input.
        self.time_buf.fill(0.0);
        self.time_buf[..BLOCK_SIZE].copy_from_slice(input);
        self.fft_forward.process_with_scratch(
            &mut self.time_buf,
            &mut self.freq_buf,
            &mut self.fft_scratch,
        )?;

        // Pointwise multiply with the cached impulse response spectrum.
        for (bin, h) in self.freq_buf.iter_mut().zip(self.ir_spectrum.iter()) {
            *bin *= *h;
        }

        // Back to the time domain; realfft leaves the result unnormalized.
        self.fft_inverse.process_with_scratch(
            &mut self.freq_buf,
            &mut self.time_buf,
            &mut self.fft_scratch,
        )?;
        let scale = 1.0 / FFT_SIZE as f32;

        for i in 0..BLOCK_SIZE {
            let y = self.time_buf[i] * scale;
            output[i] = if i < OVERLAP_SIZE {
                y + self.overlap[i]
            } else {
                y
            };
        }

        // Save the tail for the next block.
        for i in 0..OVERLAP_SIZE {
            self.overlap[i] = self.time_buf[BLOCK_SIZE + i] * scale;
        }

        Ok(())
    }
}

impl Default for FftConvolver {
    fn default() -> Self {
        Self::new()
    }
}
