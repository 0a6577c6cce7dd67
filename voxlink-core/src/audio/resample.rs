//! Capture-side sample-rate conversion on top of rubato's `FastFixedIn`.
//!
//! The device rate (often 48 kHz) is streamed down to 16 kHz wire audio on
//! the capture thread. Playback converts inside the output mixer instead,
//! see `audio::output`.
//!
//! Equal rates short-circuit; no rubato state is built for them.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{LiveError, Result};

/// Streaming mono converter between two fixed rates.
pub struct RateConverter {
    stage: Option<Stage>,
}

/// Rubato state for a real conversion.
struct Stage {
    resampler: FastFixedIn<f32>,
    /// Input not yet forming a full block.
    pending: Vec<f32>,
    block_len: usize,
    /// `[1][output_frames_max]`, reused across blocks.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `block_len` is the number of input samples rubato consumes per step.
    ///
    /// # Errors
    /// `LiveError::Device` if rubato rejects the rate pair.
    pub fn new(from_rate: u32, to_rate: u32, block_len: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self { stage: None });
        }
        let resampler = build(from_rate, to_rate, block_len)?;
        let scratch = vec![vec![0f32; resampler.output_frames_max()]];
        info!(from_rate, to_rate, block_len, "capture resampling enabled");
        Ok(Self {
            stage: Some(Stage {
                resampler,
                pending: Vec::with_capacity(block_len * 2),
                block_len,
                scratch,
            }),
        })
    }

    /// Push samples in, get back whatever full blocks converted to.
    /// A trailing partial block waits for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(stage) = self.stage.as_mut() else {
            return samples.to_vec();
        };
        stage.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        let full = stage.pending.len() / stage.block_len * stage.block_len;
        for block in stage.pending[..full].chunks_exact(stage.block_len) {
            match stage
                .resampler
                .process_into_buffer(&[block], &mut stage.scratch, None)
            {
                Ok((_, written)) => out.extend_from_slice(&stage.scratch[0][..written]),
                Err(e) => error!(error = %e, "resampler block failed"),
            }
        }
        stage.pending.drain(..full);
        out
    }

    pub fn is_passthrough(&self) -> bool {
        self.stage.is_none()
    }
}

fn build(from_rate: u32, to_rate: u32, block_len: usize) -> Result<FastFixedIn<f32>> {
    let ratio = to_rate as f64 / from_rate as f64;
    FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, block_len, 1)
        .map_err(|e| LiveError::Device(format!("resampler init: {e}")))
}
