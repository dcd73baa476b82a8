//! Per-turn processing pipeline.
//!
//! ## Stage sequence
//!
//! ```text
//! Utterance ─► Transcribe ─► Infer ─► Synthesize ─► Turn (Completed | Failed)
//!                  │            │          │
//!               abort       fallback     abort
//! ```
//!
//! Every stage runs under its own `tokio::time::timeout` and races the turn's
//! `CancellationToken`. A failed stage asks its own [`Stage::recover`] what
//! happens next, so a new stage can be slotted in without touching the
//! orchestrator. The pipeline always hands back a finalized [`Turn`].

pub mod stages;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{StageError, StageName};
use crate::persistence::ConversationStore;
use crate::services::{InferenceService, SynthesisService, TranscriptionService};
use crate::session::{Persona, SessionId, Turn, TurnStatus, VoiceId};

pub use stages::{InferStage, SynthesizeStage, TranscribeStage};

/// What the pipeline does after a stage error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Mark the turn failed; later stages do not run.
    Abort,
    /// The stage patched the turn with a fallback; keep going.
    Continue,
}

/// Read-only call context a stage may consult.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: SessionId,
    pub persona: Persona,
    pub voice: VoiceId,
    /// Number of prior exchanges passed to inference.
    pub history_window: usize,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> StageName;

    fn timeout(&self) -> Duration;

    async fn run(&self, turn: &mut Turn, ctx: &TurnContext) -> Result<(), StageError>;

    /// Called after `run` failed or timed out. Never called on cancellation.
    fn recover(&self, error: &StageError, turn: &mut Turn) -> Recovery;
}

/// Per-stage time limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub transcribe: Duration,
    pub infer: Duration,
    pub synthesize: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            transcribe: Duration::from_secs(15),
            infer: Duration::from_secs(30),
            synthesize: Duration::from_secs(20),
        }
    }
}

/// Ordered list of stages applied to each utterance.
#[derive(Clone)]
pub struct DialogueTurnPipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl DialogueTurnPipeline {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    /// Transcribe → Infer → Synthesize.
    pub fn standard(
        timeouts: StageTimeouts,
        fallback_reply: impl Into<String>,
        transcriber: Arc<dyn TranscriptionService>,
        inference: Arc<dyn InferenceService>,
        synthesizer: Arc<dyn SynthesisService>,
        store: Arc<dyn ConversationStore>,
    ) -> Self {
        Self::new(vec![
            Arc::new(TranscribeStage::new(transcriber, timeouts.transcribe)),
            Arc::new(InferStage::new(
                inference,
                store,
                timeouts.infer,
                fallback_reply,
            )),
            Arc::new(SynthesizeStage::new(synthesizer, timeouts.synthesize)),
        ])
    }

    /// Insert a stage before position `index` (clamped to the end).
    pub fn insert_stage(&mut self, index: usize, stage: Arc<dyn Stage>) {
        let index = index.min(self.stages.len());
        self.stages.insert(index, stage);
    }

    pub fn stage_names(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Drive one turn through every stage.
    pub async fn run(&self, mut turn: Turn, ctx: &TurnContext) -> Turn {
        let span = info_span!(
            "turn",
            session_id = %ctx.session_id,
            turn = turn.index,
            frames = turn.utterance.len(),
        );

        async move {
            for stage in &self.stages {
                let name = stage.name();
                let limit = stage.timeout();

                let outcome = if ctx.cancel.is_cancelled() {
                    Err(StageError::Cancelled { stage: name })
                } else {
                    tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => Err(StageError::Cancelled { stage: name }),
                        res = tokio::time::timeout(limit, stage.run(&mut turn, ctx)) => {
                            res.unwrap_or(Err(StageError::TimeoutExceeded { stage: name, limit }))
                        }
                    }
                };

                let Err(error) = outcome else {
                    debug!(stage = %name, "stage completed");
                    continue;
                };

                if error.is_cancelled() {
                    info!(stage = %name, "turn cancelled");
                    turn.record_failure(name, &error, false);
                    turn.finalize(TurnStatus::Failed);
                    return turn;
                }

                match stage.recover(&error, &mut turn) {
                    Recovery::Continue => {
                        warn!(stage = %name, error = %error, "stage failed, continuing with fallback");
                        turn.record_failure(name, &error, true);
                    }
                    Recovery::Abort => {
                        warn!(stage = %name, error = %error, "stage failed, aborting turn");
                        turn.record_failure(name, &error, false);
                        turn.finalize(TurnStatus::Failed);
                        return turn;
                    }
                }
            }

            turn.finalize(TurnStatus::Completed);
            info!(
                transcript_chars = turn.transcript.as_deref().map(str::len).unwrap_or(0),
                reply_chars = turn.reply_text.as_deref().map(str::len).unwrap_or(0),
                recovered = turn.failures.len(),
                "turn completed"
            );
            turn
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::buffering::frame::{AudioClip, Frame};
    use crate::error::ServiceError;
    use crate::persistence::MemoryStore;
    use crate::segment::Utterance;
    use crate::services::{HistoryEntry, Transcript};

    const FALLBACK: &str = "Sorry, I couldn't come up with an answer.";

    struct ScriptedTranscriber {
        result: Result<Transcript, ServiceError>,
        threshold: Option<f32>,
    }

    #[async_trait]
    impl TranscriptionService for ScriptedTranscriber {
        async fn transcribe(&self, _audio: &AudioClip) -> Result<Transcript, ServiceError> {
            self.result.clone()
        }

        fn min_confidence(&self) -> Option<f32> {
            self.threshold
        }
    }

    #[derive(Default)]
    struct ScriptedInference {
        calls: AtomicUsize,
        fail: bool,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl InferenceService for ScriptedInference {
        async fn infer(
            &self,
            prompt: &str,
            _persona: &Persona,
            _history: &[HistoryEntry],
        ) -> Result<String, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(ServiceError::Unavailable("llm down".into()));
            }
            Ok(format!("reply to {prompt}"))
        }
    }

    #[derive(Default)]
    struct ScriptedSynth {
        texts: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl SynthesisService for ScriptedSynth {
        async fn synthesize(&self, text: &str, _voice: &VoiceId) -> Result<AudioClip, ServiceError> {
            self.texts.lock().push(text.to_string());
            if self.fail {
                return Err(ServiceError::Unavailable("tts down".into()));
            }
            Ok(AudioClip::new(vec![0.1; 1600], 16_000))
        }
    }

    fn turn() -> Turn {
        let frames = (0..10)
            .map(|seq| Frame::new(seq, vec![0.3; 480], 16_000))
            .collect();
        Turn::new(0, SessionId::new(), Utterance::from_frames(frames).unwrap())
    }

    fn ctx() -> TurnContext {
        TurnContext {
            session_id: SessionId::new(),
            persona: Persona::new("helpful", "Be brief."),
            voice: VoiceId::new("en-US-JennyNeural"),
            history_window: 4,
            cancel: CancellationToken::new(),
        }
    }

    fn ok_transcript() -> ScriptedTranscriber {
        ScriptedTranscriber {
            result: Ok(Transcript::new("hello there", Some(0.9))),
            threshold: None,
        }
    }

    fn pipeline(
        timeouts: StageTimeouts,
        transcriber: ScriptedTranscriber,
        inference: Arc<ScriptedInference>,
        synth: Arc<ScriptedSynth>,
    ) -> DialogueTurnPipeline {
        DialogueTurnPipeline::standard(
            timeouts,
            FALLBACK,
            Arc::new(transcriber),
            inference,
            synth,
            Arc::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn happy_path_populates_turn_in_order() {
        let inference = Arc::new(ScriptedInference::default());
        let synth = Arc::new(ScriptedSynth::default());
        let p = pipeline(
            StageTimeouts::default(),
            ok_transcript(),
            inference.clone(),
            synth.clone(),
        );

        let turn = p.run(turn(), &ctx()).await;
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.transcript.as_deref(), Some("hello there"));
        assert_eq!(turn.reply_text.as_deref(), Some("reply to hello there"));
        assert!(turn.reply_audio.is_some());
        assert!(turn.failures.is_empty());
        assert!(turn.ended_at.is_some());
    }

    #[tokio::test]
    async fn transcription_failure_short_circuits() {
        let inference = Arc::new(ScriptedInference::default());
        let synth = Arc::new(ScriptedSynth::default());
        let transcriber = ScriptedTranscriber {
            result: Err(ServiceError::Unavailable("stt down".into())),
            threshold: None,
        };
        let p = pipeline(StageTimeouts::default(), transcriber, inference.clone(), synth.clone());

        let turn = p.run(turn(), &ctx()).await;
        assert_eq!(turn.status, TurnStatus::Failed);
        assert_eq!(inference.calls.load(Ordering::SeqCst), 0);
        assert!(synth.texts.lock().is_empty());
        assert_eq!(turn.failures[0].stage, StageName::Transcribe);
    }

    #[tokio::test]
    async fn empty_or_low_confidence_transcripts_are_rejected() {
        for transcriber in [
            ScriptedTranscriber {
                result: Ok(Transcript::new("   ", None)),
                threshold: None,
            },
            ScriptedTranscriber {
                result: Ok(Transcript::new("mumble", Some(0.2))),
                threshold: Some(0.5),
            },
        ] {
            let inference = Arc::new(ScriptedInference::default());
            let p = pipeline(
                StageTimeouts::default(),
                transcriber,
                inference.clone(),
                Arc::new(ScriptedSynth::default()),
            );
            let turn = p.run(turn(), &ctx()).await;
            assert_eq!(turn.status, TurnStatus::Failed);
            assert_eq!(inference.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn inference_error_uses_fallback_and_still_synthesizes() {
        let inference = Arc::new(ScriptedInference {
            fail: true,
            ..ScriptedInference::default()
        });
        let synth = Arc::new(ScriptedSynth::default());
        let p = pipeline(StageTimeouts::default(), ok_transcript(), inference, synth.clone());

        let turn = p.run(turn(), &ctx()).await;
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.reply_text.as_deref(), Some(FALLBACK));
        assert_eq!(&*synth.texts.lock(), &[FALLBACK.to_string()]);
        assert!(turn.failures[0].recovered);
    }

    #[tokio::test]
    async fn inference_timeout_falls_back() {
        let inference = Arc::new(ScriptedInference {
            delay: Some(Duration::from_secs(10)),
            ..ScriptedInference::default()
        });
        let synth = Arc::new(ScriptedSynth::default());
        let timeouts = StageTimeouts {
            infer: Duration::from_millis(50),
            ..StageTimeouts::default()
        };
        let p = pipeline(timeouts, ok_transcript(), inference, synth.clone());

        let turn = p.run(turn(), &ctx()).await;
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.reply_text.as_deref(), Some(FALLBACK));
        assert!(turn.reply_audio.is_some());
        assert_eq!(&*synth.texts.lock(), &[FALLBACK.to_string()]);
        assert!(turn.failures[0].message.contains("timeout"));
    }

    #[tokio::test]
    async fn synthesis_failure_keeps_text_without_audio() {
        let synth = Arc::new(ScriptedSynth {
            fail: true,
            ..ScriptedSynth::default()
        });
        let p = pipeline(
            StageTimeouts::default(),
            ok_transcript(),
            Arc::new(ScriptedInference::default()),
            synth,
        );

        let turn = p.run(turn(), &ctx()).await;
        assert_eq!(turn.status, TurnStatus::Failed);
        assert!(turn.transcript.is_some());
        assert!(turn.reply_text.is_some());
        assert!(turn.reply_audio.is_none());
    }

    #[tokio::test]
    async fn cancellation_aborts_remaining_stages() {
        let inference = Arc::new(ScriptedInference {
            delay: Some(Duration::from_secs(10)),
            ..ScriptedInference::default()
        });
        let synth = Arc::new(ScriptedSynth::default());
        let p = pipeline(StageTimeouts::default(), ok_transcript(), inference, synth.clone());

        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let turn = p.run(turn(), &ctx).await;
        assert_eq!(turn.status, TurnStatus::Failed);
        assert!(turn.was_cancelled());
        assert_eq!(turn.failures[0].stage, StageName::Infer);
        assert!(synth.texts.lock().is_empty());
    }

    #[test]
    fn stages_can_be_inserted() {
        let mut p = pipeline(
            StageTimeouts::default(),
            ok_transcript(),
            Arc::new(ScriptedInference::default()),
            Arc::new(ScriptedSynth::default()),
        );
        assert_eq!(
            p.stage_names(),
            [StageName::Transcribe, StageName::Infer, StageName::Synthesize]
        );
        let extra = Arc::new(SynthesizeStage::new(
            Arc::new(ScriptedSynth::default()),
            Duration::from_secs(1),
        ));
        p.insert_stage(99, extra);
        assert_eq!(p.stage_names().len(), 4);
    }
}
