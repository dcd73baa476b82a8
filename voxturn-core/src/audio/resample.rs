//! Fixed-ratio sample-rate conversion on top of rubato's `FastFixedIn`.
//!
//! Two directions use it: microphone audio at the device rate is brought down
//! to the frame rate before framing, and synthesized replies (or WAV files)
//! are brought to whatever rate the speaker or frame spec wants. Both run off
//! the real-time callback, so allocating here is fine.
//!
//! Equal rates skip rubato entirely.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{info, warn};

use crate::error::{Result, VoxturnError};

/// Streaming mono f32 converter between two fixed rates.
pub struct RateConverter {
    resampler: Option<FastFixedIn<f32>>,
    /// Input not yet handed to rubato (always shorter than `block` after `process`).
    pending: Vec<f32>,
    block: usize,
    scratch: Vec<Vec<f32>>,
    /// to / from
    ratio: f64,
}

impl RateConverter {
    /// `block` is how many input samples rubato consumes per call.
    ///
    /// # Errors
    /// `VoxturnError::AudioDevice` if rubato rejects the parameters.
    pub fn new(from_rate: u32, to_rate: u32, block: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block,
                scratch: Vec::new(),
                ratio: 1.0,
            });
        }

        let ratio = f64::from(to_rate) / f64::from(from_rate);
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, block, 1)
            .map_err(|e| VoxturnError::AudioDevice(format!("resampler init: {e}")))?;
        let scratch = vec![vec![0f32; resampler.output_frames_max()]; 1];

        info!(from_rate, to_rate, block, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(block * 2),
            block,
            scratch,
            ratio,
        })
    }

    /// Feed samples and collect whatever whole blocks produced. A partial
    /// block stays buffered until the next call or [`finish`](Self::finish).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.resampler.is_none() {
            return samples.to_vec();
        }
        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        let whole = self.pending.len() / self.block * self.block;
        for start in (0..whole).step_by(self.block) {
            self.convert_block(start, &mut out);
        }
        self.pending.drain(..whole);
        out
    }

    fn convert_block(&mut self, start: usize, out: &mut Vec<f32>) {
        let Some(resampler) = self.resampler.as_mut() else {
            return;
        };
        let input = &self.pending[start..start + self.block];
        match resampler.process_into_buffer(&[input], &mut self.scratch, None) {
            Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
            // The block is dropped and leaves a short gap.
            Err(e) => warn!(error = %e, "resampler block failed"),
        }
    }

    /// Zero-pad and convert the buffered tail of a finite clip, trimming
    /// the output the padding accounts for.
    pub fn finish(&mut self) -> Vec<f32> {
        if self.resampler.is_none() || self.pending.is_empty() {
            self.pending.clear();
            return Vec::new();
        }
        let real = self.pending.len();
        self.pending.resize(self.block, 0.0);
        let mut out = self.process(&[]);
        let keep = (real as f64 * self.ratio).ceil() as usize;
        out.truncate(keep);
        out
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
