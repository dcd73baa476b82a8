//! Energy-based VAD: peak-amplitude noise gate, RMS threshold, hangover.
//!
//! ## Algorithm
//!
//! 1. If the frame's peak amplitude is below `amplitude_gate` → `Silence`
//!    (cheap rejection of line hiss before any energy maths).
//! 2. Compute RMS of the frame.
//! 3. If RMS ≥ `rms_threshold` → `Speech`, re-arm the hangover counter.
//! 4. If RMS < `rms_threshold` and hangover counter > 0 → `Speech`,
//!    decrement counter (keeps syllable endings inside the utterance).
//! 5. Otherwise → `Silence`.

use serde::{Deserialize, Serialize};

use super::FrameClassifier;
use crate::buffering::frame::Frame;
use crate::error::ClassifierError;

/// Tuning for [`EnergyVad`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct EnergyVadConfig {
    /// Peak |sample| below which a frame is silence outright.
    /// 100/32768 ≈ 0.003 matches a quiet telephone line.
    pub amplitude_gate: f32,
    /// RMS level at or above which a frame is speech. Typical 0.01–0.05.
    pub rms_threshold: f32,
    /// Silent frames still reported as speech after real speech ends.
    pub hangover_frames: u32,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            amplitude_gate: 0.003,
            rms_threshold: 0.01,
            hangover_frames: 3,
        }
    }
}

/// A simple energy-based frame classifier.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    config: EnergyVadConfig,
    hangover_counter: u32,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Self {
        Self {
            config,
            hangover_counter: 0,
        }
    }

    /// Root-mean-square of a sample slice.
    pub fn rms(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
        (sum_sq / samples.len() as f32).sqrt()
    }

    fn peak(samples: &[f32]) -> f32 {
        samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(EnergyVadConfig::default())
    }
}

impl FrameClassifier for EnergyVad {
    fn classify(&mut self, frame: &Frame) -> Result<bool, ClassifierError> {
        let samples = &frame.samples;

        let loud = !samples.is_empty()
            && Self::peak(samples) >= self.config.amplitude_gate
            && Self::rms(samples) >= self.config.rms_threshold;

        if loud {
            self.hangover_counter = self.config.hangover_frames;
            Ok(true)
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}
