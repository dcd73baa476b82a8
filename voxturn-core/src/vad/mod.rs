//! Voice Activity Detection (VAD).
//!
//! The `FrameClassifier` trait is the extensibility point: `EnergyVad` is the
//! default, any external or neural classifier can be injected without
//! touching segmentation. `VoiceActivityGate` wraps the classifier and applies
//! the fail-safe policy: a classifier failure counts as silence, so a broken
//! classifier ends utterances instead of holding them open forever.

pub mod energy;

use std::time::{Duration, Instant};

use tracing::warn;

use crate::buffering::frame::Frame;
use crate::error::ClassifierError;

pub use energy::{EnergyVad, EnergyVadConfig};

/// Whether a given audio frame contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    Speech,
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

impl From<bool> for VadDecision {
    fn from(is_speech: bool) -> Self {
        if is_speech {
            VadDecision::Speech
        } else {
            VadDecision::Silence
        }
    }
}

/// Contract for per-frame speech classifiers.
///
/// Implementors own any adaptive state (hangover counters, noise floors,
/// RNN hidden states). Must answer well within one frame duration.
pub trait FrameClassifier: Send + 'static {
    fn classify(&mut self, frame: &Frame) -> Result<bool, ClassifierError>;

    /// Reset internal state, e.g. when capture is muted during playback.
    fn reset(&mut self) {}
}

/// Builds a fresh classifier for each call.
pub type ClassifierFactory = std::sync::Arc<dyn Fn() -> Box<dyn FrameClassifier> + Send + Sync>;

/// Result of gating one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub decision: VadDecision,
    /// `true` when the classifier failed or blew its latency budget.
    pub degraded: bool,
}

impl GateDecision {
    pub fn is_speech(&self) -> bool {
        self.decision.is_speech()
    }
}

/// Stateless-per-frame wrapper around an injected [`FrameClassifier`].
pub struct VoiceActivityGate {
    classifier: Box<dyn FrameClassifier>,
    latency_budget: Duration,
    degraded_count: u64,
}

impl VoiceActivityGate {
    pub fn new(classifier: Box<dyn FrameClassifier>, latency_budget: Duration) -> Self {
        Self {
            classifier,
            latency_budget,
            degraded_count: 0,
        }
    }

    pub fn classify(&mut self, frame: &Frame) -> GateDecision {
        let started = Instant::now();
        let result = self.classifier.classify(frame);
        let elapsed = started.elapsed();

        match result {
            Ok(is_speech) => {
                let slow = elapsed > self.latency_budget;
                if slow {
                    self.degraded_count += 1;
                    warn!(
                        seq = frame.seq,
                        elapsed_us = elapsed.as_micros() as u64,
                        budget_us = self.latency_budget.as_micros() as u64,
                        "classifier exceeded frame latency budget"
                    );
                }
                GateDecision {
                    decision: is_speech.into(),
                    degraded: slow,
                }
            }
            Err(e) => {
                self.degraded_count += 1;
                warn!(seq = frame.seq, error = %e, "classification degraded, treating frame as silence");
                GateDecision {
                    decision: VadDecision::Silence,
                    degraded: true,
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.classifier.reset();
    }

    /// Total degraded classifications since the gate was created.
    pub fn degraded_count(&self) -> u64 {
        self.degraded_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl FrameClassifier for Failing {
        fn classify(&mut self, _frame: &Frame) -> Result<bool, ClassifierError> {
            Err(ClassifierError("model offline".into()))
        }
    }

    struct Slow;

    impl FrameClassifier for Slow {
        fn classify(&mut self, _frame: &Frame) -> Result<bool, ClassifierError> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(true)
        }
    }

    fn frame() -> Frame {
        Frame::new(0, vec![0.5; 480], 16_000)
    }

    #[test]
    fn classifier_failure_is_silence_and_degraded() {
        let mut gate = VoiceActivityGate::new(Box::new(Failing), Duration::from_millis(30));
        let decision = gate.classify(&frame());
        assert_eq!(decision.decision, VadDecision::Silence);
        assert!(decision.degraded);
        assert_eq!(gate.degraded_count(), 1);
    }

    #[test]
    fn slow_classifier_keeps_answer_but_flags_degraded() {
        let mut gate = VoiceActivityGate::new(Box::new(Slow), Duration::from_millis(1));
        let decision = gate.classify(&frame());
        assert!(decision.is_speech());
        assert!(decision.degraded);
    }

    #[test]
    fn healthy_classifier_passes_through() {
        let mut gate = VoiceActivityGate::new(
            Box::new(EnergyVad::new(EnergyVadConfig {
                hangover_frames: 0,
                ..EnergyVadConfig::default()
            })),
            Duration::from_millis(30),
        );
        assert!(gate.classify(&frame()).is_speech());
        let silent = Frame::new(1, vec![0.0; 480], 16_000);
        let decision = gate.classify(&silent);
        assert_eq!(decision.decision, VadDecision::Silence);
        assert!(!decision.degraded);
        assert_eq!(gate.degraded_count(), 0);
    }
}
