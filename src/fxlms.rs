//! Reference filtered-x LMS controller for the demo runner.
//!
//! Classic single-channel FxLMS: an adaptive FIR filter produces the
//! anti-noise command from the outside (reference) microphone, while the
//! in-ear (error) microphone drives a normalized per-sample weight update.
//! The reference is pre-filtered through an estimate of the secondary path
//! so the gradient sees the signal the way the ear does.

use anyhow::Result;

use earsim_core::{Block, FftConvolver, BLOCK_SIZE, IR_SIZE, ZERO_BLOCK};

pub struct FxLms {
    /// Adaptive weight vector.
    w: Vec<f32>,
    /// Reference history, newest first.
    x_hist: Vec<f32>,
    /// Filtered-reference history, newest first.
    xf_hist: Vec<f32>,
    /// Secondary-path estimate applied to the reference.
    s_hat: FftConvolver,
    /// Adaptation step size.
    mu: f32,
}

impl FxLms {
    pub fn new(s_hat_ir: &[f32], mu: f32) -> Result<Self> {
        Ok(Self {
            w: vec![0.0; IR_SIZE],
            x_hist: vec![0.0; IR_SIZE],
            xf_hist: vec![0.0; IR_SIZE],
            s_hat: FftConvolver::with_impulse_response(s_hat_ir)?,
            mu,
        })
    }

    /// Consume one microphone observation, produce one anti-noise block.
    pub fn process_block(
        &mut self,
        outside: &Block,
        inear: &Block,
        control: &mut Block,
    ) -> Result<()> {
        let mut xf_block = ZERO_BLOCK;
        self.s_hat.step(outside, &mut xf_block)?;

        for n in 0..BLOCK_SIZE {
            // Shift histories, newest sample at index 0.
            self.x_hist.rotate_right(1);
            self.x_hist[0] = outside[n];
            self.xf_hist.rotate_right(1);
            self.xf_hist[0] = xf_block[n];

            // FIR output, negated to cancel.
            let y: f32 = self.w.iter().zip(&self.x_hist).map(|(w, x)| w * x).sum();
            control[n] = -y;

            // Normalized LMS update against the in-ear error.
            let e = inear[n];
            let xf_pow: f32 = self.xf_hist.iter().map(|x| x * x).sum::<f32>() + 1e-6;
            let step = self.mu / xf_pow * e;
            for (w, xf) in self.w.iter_mut().zip(&self.xf_hist) {
                *w -= step * xf;
            }
        }

        Ok(())
    }

    /// L2 norm of the adaptive weights.
    pub fn weight_norm(&self) -> f32 {
        self.w.iter().map(|w| w * w).sum::<f32>().sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use earsim_core::{delta_ir, peak};

    #[test]
    fn test_weights_adapt_and_stay_finite() {
        let mut fxlms = FxLms::new(&delta_ir(1.0), 1e-3).unwrap();
        assert_eq!(fxlms.weight_norm(), 0.0);

        let mut reference = ZERO_BLOCK;
        for (i, sample) in reference.iter_mut().enumerate() {
            *sample = (i as f32 * 0.2).sin() * 0.1;
        }
        let mut control = ZERO_BLOCK;

        for _ in 0..5 {
            // Error equals the reference: a correlated signal to chase.
            fxlms
                .process_block(&reference, &reference, &mut control)
                .unwrap();
        }

        let norm = fxlms.weight_norm();
        assert!(norm > 0.0, "weights never moved");
        assert!(norm.is_finite());
        assert!(peak(&control).is_finite());
    }

    #[test]
    fn test_zero_error_leaves_weights_untouched() {
        let mut fxlms = FxLms::new(&delta_ir(1.0), 1e-3).unwrap();
        let mut reference = ZERO_BLOCK;
        reference[0] = 0.5;
        let mut control = ZERO_BLOCK;

        fxlms
            .process_block(&reference, &ZERO_BLOCK, &mut control)
            .unwrap();
        assert_eq!(fxlms.weight_norm(), 0.0);
    }
}
