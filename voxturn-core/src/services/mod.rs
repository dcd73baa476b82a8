//! External AI collaborators.
//!
//! The core never runs a model itself. Speech-to-text, the language model and
//! text-to-speech are reached through these three traits; the pipeline owns
//! timeouts and cancellation, implementors only answer the request.
//!
//! `stub` holds deterministic offline implementations; `http` (feature
//! `http`) talks to Ollama and OpenAI-compatible audio endpoints.

pub mod stub;

#[cfg(feature = "http")]
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::buffering::frame::AudioClip;
use crate::error::ServiceError;
use crate::session::{Persona, VoiceId};

pub use stub::{EchoInference, StubTranscriber, ToneSynthesizer};

#[cfg(feature = "http")]
pub use http::{HttpServiceConfig, OllamaInference, OpenAiSynthesizer, OpenAiTranscriber};

/// Speech-to-text result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    /// In [0.0, 1.0] when the backend reports one.
    pub confidence: Option<f32>,
}

impl Transcript {
    pub fn new(text: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// One prior exchange, oldest first in history windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub user: String,
    pub assistant: String,
}

#[async_trait]
pub trait TranscriptionService: Send + Sync {
    async fn transcribe(&self, audio: &AudioClip) -> Result<Transcript, ServiceError>;

    /// Transcripts whose confidence is below this are rejected.
    fn min_confidence(&self) -> Option<f32> {
        None
    }
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    /// Prompt templating is the implementor's job; `persona` and `history`
    /// are passed through untouched.
    async fn infer(
        &self,
        prompt: &str,
        persona: &Persona,
        history: &[HistoryEntry],
    ) -> Result<String, ServiceError>;
}

#[async_trait]
pub trait SynthesisService: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &VoiceId) -> Result<AudioClip, ServiceError>;
}
