//! Deterministic offline services.
//!
//! Used for dry runs and simulations: they exercise the full
//! capture → pipeline → playback path without any network access.

use std::f32::consts::TAU;

use async_trait::async_trait;
use tracing::debug;

use super::{HistoryEntry, InferenceService, SynthesisService, Transcript, TranscriptionService};
use crate::buffering::frame::AudioClip;
use crate::error::ServiceError;
use crate::session::{Persona, VoiceId};

/// Describes the utterance instead of recognising it:
/// `"[stub: <N> samples @ <SR> Hz]"`.
#[derive(Debug, Default, Clone)]
pub struct StubTranscriber;

#[async_trait]
impl TranscriptionService for StubTranscriber {
    async fn transcribe(&self, audio: &AudioClip) -> Result<Transcript, ServiceError> {
        if audio.samples.len() < 160 {
            return Err(ServiceError::Empty);
        }
        Ok(Transcript::new(
            format!(
                "[stub: {} samples @ {} Hz]",
                audio.samples.len(),
                audio.sample_rate
            ),
            Some(1.0),
        ))
    }
}

/// Replies by quoting the prompt back, prefixed with the persona name.
#[derive(Debug, Default, Clone)]
pub struct EchoInference;

#[async_trait]
impl InferenceService for EchoInference {
    async fn infer(
        &self,
        prompt: &str,
        persona: &Persona,
        history: &[HistoryEntry],
    ) -> Result<String, ServiceError> {
        debug!(persona = %persona.name, history = history.len(), "echo inference");
        Ok(format!("{}: you said {}", persona.name, prompt))
    }
}

/// Renders text as a sine tone, 60 ms per character (capped at 5 s).
#[derive(Debug, Clone)]
pub struct ToneSynthesizer {
    pub sample_rate: u32,
    pub frequency_hz: f32,
}

impl Default for ToneSynthesizer {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frequency_hz: 440.0,
        }
    }
}

const MS_PER_CHAR: usize = 60;
const MAX_TONE_MS: usize = 5_000;

#[async_trait]
impl SynthesisService for ToneSynthesizer {
    async fn synthesize(&self, text: &str, voice: &VoiceId) -> Result<AudioClip, ServiceError> {
        let chars = text.trim().chars().count();
        if chars == 0 {
            return Err(ServiceError::Empty);
        }
        let ms = (chars * MS_PER_CHAR).min(MAX_TONE_MS);
        let len = self.sample_rate as usize * ms / 1000;
        let step = TAU * self.frequency_hz / self.sample_rate as f32;
        let samples = (0..len).map(|i| 0.2 * (step * i as f32).sin()).collect();
        debug!(%voice, ms, "tone synthesized");
        Ok(AudioClip::new(samples, self.sample_rate))
    }
}
