//! The three standard stages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Recovery, Stage, TurnContext};
use crate::error::{ServiceError, StageError, StageName};
use crate::persistence::ConversationStore;
use crate::services::{HistoryEntry, InferenceService, SynthesisService, TranscriptionService};
use crate::session::Turn;

/// Utterance audio → transcript. Untrusted transcripts abort the turn.
pub struct TranscribeStage {
    service: Arc<dyn TranscriptionService>,
    timeout: Duration,
}

impl TranscribeStage {
    pub fn new(service: Arc<dyn TranscriptionService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }
}

#[async_trait]
impl Stage for TranscribeStage {
    fn name(&self) -> StageName {
        StageName::Transcribe
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, turn: &mut Turn, _ctx: &TurnContext) -> Result<(), StageError> {
        let clip = turn.utterance.to_clip();
        let transcript = self
            .service
            .transcribe(&clip)
            .await
            .map_err(StageError::Transcription)?;

        let text = transcript.text.trim();
        if text.is_empty() {
            return Err(StageError::Transcription(ServiceError::Empty));
        }
        if let (Some(confidence), Some(threshold)) =
            (transcript.confidence, self.service.min_confidence())
        {
            if confidence < threshold {
                return Err(StageError::Transcription(ServiceError::LowConfidence {
                    confidence,
                    threshold,
                }));
            }
        }

        debug!(chars = text.len(), confidence = ?transcript.confidence, "transcribed");
        turn.transcript = Some(text.to_string());
        turn.transcript_confidence = transcript.confidence;
        Ok(())
    }

    fn recover(&self, _error: &StageError, _turn: &mut Turn) -> Recovery {
        Recovery::Abort
    }
}

/// Transcript + persona + history → reply text. Falls back to a fixed reply.
pub struct InferStage {
    service: Arc<dyn InferenceService>,
    store: Arc<dyn ConversationStore>,
    timeout: Duration,
    fallback_reply: String,
}

impl InferStage {
    pub fn new(
        service: Arc<dyn InferenceService>,
        store: Arc<dyn ConversationStore>,
        timeout: Duration,
        fallback_reply: impl Into<String>,
    ) -> Self {
        Self {
            service,
            store,
            timeout,
            fallback_reply: fallback_reply.into(),
        }
    }

    async fn history(&self, ctx: &TurnContext) -> Vec<HistoryEntry> {
        if ctx.history_window == 0 {
            return Vec::new();
        }
        let store = Arc::clone(&self.store);
        let session = ctx.session_id;
        let limit = ctx.history_window;
        match tokio::task::spawn_blocking(move || store.recent_history(session, limit)).await {
            Ok(Ok(history)) => history,
            Ok(Err(e)) => {
                warn!(error = %e, "history lookup failed, inferring without context");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "history lookup task failed");
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Stage for InferStage {
    fn name(&self) -> StageName {
        StageName::Infer
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, turn: &mut Turn, ctx: &TurnContext) -> Result<(), StageError> {
        let prompt = turn
            .transcript
            .clone()
            .ok_or(StageError::Inference(ServiceError::Empty))?;
        let history = self.history(ctx).await;

        let reply = self
            .service
            .infer(&prompt, &ctx.persona, &history)
            .await
            .map_err(StageError::Inference)?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(StageError::Inference(ServiceError::Empty));
        }

        debug!(history = history.len(), chars = reply.len(), "reply inferred");
        turn.reply_text = Some(reply.to_string());
        Ok(())
    }

    fn recover(&self, _error: &StageError, turn: &mut Turn) -> Recovery {
        turn.reply_text = Some(self.fallback_reply.clone());
        Recovery::Continue
    }
}

/// Reply text + voice → audio. Failure leaves the turn without audio.
pub struct SynthesizeStage {
    service: Arc<dyn SynthesisService>,
    timeout: Duration,
}

impl SynthesizeStage {
    pub fn new(service: Arc<dyn SynthesisService>, timeout: Duration) -> Self {
        Self { service, timeout }
    }
}

#[async_trait]
impl Stage for SynthesizeStage {
    fn name(&self) -> StageName {
        StageName::Synthesize
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, turn: &mut Turn, ctx: &TurnContext) -> Result<(), StageError> {
        let text = turn
            .reply_text
            .clone()
            .ok_or(StageError::Synthesis(ServiceError::Empty))?;
        let clip = self
            .service
            .synthesize(&text, &ctx.voice)
            .await
            .map_err(StageError::Synthesis)?;
        if clip.is_empty() {
            return Err(StageError::Synthesis(ServiceError::Empty));
        }
        debug!(ms = clip.duration().as_millis() as u64, "reply synthesized");
        turn.reply_audio = Some(clip);
        Ok(())
    }

    fn recover(&self, _error: &StageError, turn: &mut Turn) -> Recovery {
        turn.reply_audio = None;
        Recovery::Abort
    }
}
