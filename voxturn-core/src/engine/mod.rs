//! `CallEngine`: control surface for live calls.
//!
//! ## Lifecycle
//!
//! ```text
//! CallEngine::new(config, collaborators)
//!     └─► start_call(persona, voice)  → devices leased, capture open, state = Listening
//!             └─► … turns …
//!                 └─► stop_call(id) / hangup / device error → state = Ended, lease released
//! ```
//!
//! `stop_call()` is idempotent: stopping an ended call is a no-op, and the
//! call reaches `Ended` exactly once whatever ends it. The engine remembers
//! the most recent [`RETAINED_ENDED_CALLS`] ended calls; older ones are
//! forgotten when a new call starts and then report `UnknownSession`.
//!
//! ## Threading
//!
//! Each call owns one `spawn_blocking` capture thread (the frame source is
//! built inside it because `cpal::Stream` is `!Send`) and one orchestrator
//! task. `start_call()` awaits the capture thread's open confirmation, so a
//! missing microphone is reported to the caller rather than to the event
//! stream.

pub mod capture;
mod orchestrator;

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::{
    audio::AudioDeviceProvider,
    buffering::frame::FrameSpec,
    error::{Result, VoxturnError},
    ipc::events::{CallEvent, CallEventKind},
    persistence::ConversationStore,
    pipeline::{DialogueTurnPipeline, StageTimeouts},
    segment::{AssemblerConfig, UtteranceAssembler},
    services::{InferenceService, SynthesisService, TranscriptionService},
    session::{CallSession, CallState, Persona, SessionId, VoiceId},
    vad::{ClassifierFactory, EnergyVad, EnergyVadConfig, FrameClassifier, VoiceActivityGate},
};

pub use capture::{CaptureControl, CaptureDiagnostics, CaptureDiagnosticsSnapshot};

use capture::CaptureSetup;
use orchestrator::{persist_session, Orchestrator};

/// Broadcast channel capacity: 256 events buffered for slow consumers.
const BROADCAST_CAP: usize = 256;

/// Ended calls kept around for `session`/`wait_call`/`stop_call` lookups.
pub const RETAINED_ENDED_CALLS: usize = 32;

/// Configuration for `CallEngine`. Cloned into each call at start.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Frame geometry shared by capture, segmentation and the services.
    pub frame: FrameSpec,
    pub vad: EnergyVadConfig,
    /// Trailing silence that ends an utterance. Default: 800 ms.
    pub silence_timeout: Duration,
    /// Shorter utterances are dropped as noise. Default: 300 ms.
    pub min_utterance: Duration,
    /// Utterances are force-closed at this length. `ZERO` disables.
    /// Default: 30 s.
    pub max_utterance: Duration,
    /// Caller inactivity after which the call ends. Default: 120 s.
    pub hangup_timeout: Duration,
    /// When set, a still-there prompt is played at the hangup timeout and the
    /// call ends only after this further window. Default: `None`.
    pub still_there_window: Option<Duration>,
    /// Silence frames kept at the end of each utterance. Default: 0.
    pub trailing_pad_frames: u32,
    pub stage_timeouts: StageTimeouts,
    /// Added to a clip's length to bound playback. Default: 2 s.
    pub playback_slack: Duration,
    /// Live input with no audio for this long is a device error. Default: 2 s.
    pub source_stall_timeout: Duration,
    /// Prior exchanges passed to inference. Default: 6.
    pub history_window: usize,
    /// Spoken when inference fails or times out.
    pub fallback_reply: String,
    /// Spoken at the hangup timeout when `still_there_window` is set.
    pub still_there_prompt: String,
    /// Failed turns in a row that end the call. `0` disables. Default: 3.
    pub max_consecutive_failures: u32,
    /// Ignore the microphone while the bot speaks. Default: true.
    pub mute_while_speaking: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frame: FrameSpec::default(),
            vad: EnergyVadConfig::default(),
            silence_timeout: Duration::from_millis(800),
            min_utterance: Duration::from_millis(300),
            max_utterance: Duration::from_secs(30),
            hangup_timeout: Duration::from_secs(120),
            still_there_window: None,
            trailing_pad_frames: 0,
            stage_timeouts: StageTimeouts::default(),
            playback_slack: Duration::from_secs(2),
            source_stall_timeout: Duration::from_secs(2),
            history_window: 6,
            fallback_reply: "I'm sorry, I couldn't come up with an answer just now.".into(),
            still_there_prompt: "Are you still there? I haven't heard from you in a while."
                .into(),
            max_consecutive_failures: 3,
            mute_while_speaking: true,
        }
    }
}

impl EngineConfig {
    /// Segmentation thresholds in frames, rounded up.
    pub fn assembler_config(&self) -> AssemblerConfig {
        let frames = |d: Duration| self.frame.frames_for(d);
        let silence_frames = frames(self.silence_timeout).max(1);
        AssemblerConfig {
            silence_frames,
            min_utterance_frames: frames(self.min_utterance),
            max_utterance_frames: frames(self.max_utterance),
            hangup_frames: frames(self.hangup_timeout).max(1),
            confirm_frames: self.still_there_window.map(|w| frames(w).max(1)),
            trailing_pad_frames: self.trailing_pad_frames.min(silence_frames),
        }
    }
}

/// External collaborators shared by every call of one engine.
#[derive(Clone)]
pub struct Collaborators {
    pub devices: Arc<dyn AudioDeviceProvider>,
    /// `None` uses [`EnergyVad`] with [`EngineConfig::vad`].
    pub classifier: Option<ClassifierFactory>,
    pub transcriber: Arc<dyn TranscriptionService>,
    pub inference: Arc<dyn InferenceService>,
    pub synthesizer: Arc<dyn SynthesisService>,
    pub store: Arc<dyn ConversationStore>,
}

/// Stamps engine-wide sequence numbers on events and broadcasts them.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: broadcast::Sender<CallEvent>,
    seq: Arc<AtomicU64>,
}

impl EventSink {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn emit(&self, session_id: SessionId, kind: CallEventKind) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        // No subscribers is fine.
        let _ = self.tx.send(CallEvent {
            seq,
            session_id,
            at: Utc::now(),
            kind,
        });
    }
}

struct CallHandle {
    stop: CancellationToken,
    session: watch::Receiver<CallSession>,
    diagnostics: Arc<CaptureDiagnostics>,
}

/// Drop the oldest ended calls until at most `keep` remain. Live calls stay.
fn prune_ended_calls(calls: &mut HashMap<SessionId, CallHandle>, keep: usize) {
    let mut ended: Vec<(DateTime<Utc>, SessionId)> = calls
        .iter()
        .filter_map(|(id, handle)| {
            let session = handle.session.borrow();
            let entry = if session.state.is_terminal() {
                Some((session.ended_at.unwrap_or(session.started_at), *id))
            } else {
                None
            };
            entry
        })
        .collect();
    if ended.len() <= keep {
        return;
    }
    ended.sort_unstable_by_key(|(at, _)| *at);
    let excess = ended.len() - keep;
    for (_, id) in ended.into_iter().take(excess) {
        calls.remove(&id);
    }
}

/// The top-level engine handle.
///
/// `CallEngine` is `Send + Sync`; share it as `Arc<CallEngine>`.
pub struct CallEngine {
    config: EngineConfig,
    collaborators: Collaborators,
    pipeline: DialogueTurnPipeline,
    events: EventSink,
    calls: Mutex<HashMap<SessionId, CallHandle>>,
}

impl CallEngine {
    /// Create an engine with the standard Transcribe → Infer → Synthesize pipeline.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Self {
        let pipeline = DialogueTurnPipeline::standard(
            config.stage_timeouts,
            config.fallback_reply.clone(),
            Arc::clone(&collaborators.transcriber),
            Arc::clone(&collaborators.inference),
            Arc::clone(&collaborators.synthesizer),
            Arc::clone(&collaborators.store),
        );
        Self {
            config,
            collaborators,
            pipeline,
            events: EventSink::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the turn pipeline, e.g. to insert extra stages.
    pub fn with_pipeline(mut self, pipeline: DialogueTurnPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a call on the provider's devices.
    ///
    /// Returns once the input is confirmed open and the call is running.
    ///
    /// # Errors
    /// - `VoxturnError::DeviceBusy` while another call holds the devices.
    /// - Device errors reported by the frame source while opening.
    pub async fn start_call(&self, persona: Persona, voice: VoiceId) -> Result<SessionId> {
        let config = Arc::new(self.config.clone());
        let devices = self.collaborators.devices.acquire(config.frame)?;
        let id = SessionId::new();
        let span = info_span!("call", session_id = %id);

        let control = Arc::new(CaptureControl::new());
        let diagnostics = Arc::new(CaptureDiagnostics::default());
        let setup = CaptureSetup {
            source: devices.source,
            gate: VoiceActivityGate::new(self.build_classifier(&config), config.frame.frame_duration()),
            assembler: UtteranceAssembler::new(config.assembler_config()),
            control: Arc::clone(&control),
            diagnostics: Arc::clone(&diagnostics),
        };
        let (capture, capture_events) = capture::spawn_capture(setup)
            .instrument(span.clone())
            .await?;

        let session = CallSession::new(id, persona, voice);
        if let Err(e) = persist_session(Arc::clone(&self.collaborators.store), session.clone()).await
        {
            warn!(session_id = %id, error = %e, "failed to persist new session");
        }

        let (published, session_rx) = watch::channel(session.clone());
        let stop = CancellationToken::new();
        let orchestrator = Orchestrator::new(
            session,
            config,
            self.pipeline.clone(),
            Arc::clone(&self.collaborators.synthesizer),
            devices.player,
            Arc::clone(&self.collaborators.store),
            control,
            self.events.clone(),
            published,
            stop.clone(),
            devices.lease,
        );

        {
            let mut calls = self.calls.lock();
            prune_ended_calls(&mut calls, RETAINED_ENDED_CALLS);
            calls.insert(
                id,
                CallHandle {
                    stop,
                    session: session_rx,
                    diagnostics,
                },
            );
        }
        tokio::spawn(orchestrator.run(capture_events, capture).instrument(span));

        info!(session_id = %id, "call started");
        Ok(id)
    }

    /// Ask a call to end. Idempotent.
    ///
    /// # Errors
    /// - `VoxturnError::UnknownSession` if the id was never started here.
    pub fn stop_call(&self, id: SessionId) -> Result<()> {
        let calls = self.calls.lock();
        let handle = calls.get(&id).ok_or(VoxturnError::UnknownSession(id))?;
        if handle.session.borrow().state.is_terminal() {
            return Ok(());
        }
        if !handle.stop.is_cancelled() {
            info!(session_id = %id, "call stop requested");
            handle.stop.cancel();
        }
        Ok(())
    }

    /// Stop every live call.
    pub fn stop_all(&self) {
        for handle in self.calls.lock().values() {
            handle.stop.cancel();
        }
    }

    pub fn call_state(&self, id: SessionId) -> Result<CallState> {
        self.session(id).map(|s| s.state)
    }

    /// Latest snapshot of a call's session.
    pub fn session(&self, id: SessionId) -> Result<CallSession> {
        let calls = self.calls.lock();
        let handle = calls.get(&id).ok_or(VoxturnError::UnknownSession(id))?;
        let session = handle.session.borrow().clone();
        Ok(session)
    }

    /// Wait until the call has ended and return its final session.
    pub async fn wait_call(&self, id: SessionId) -> Result<CallSession> {
        let mut rx = {
            let calls = self.calls.lock();
            let handle = calls.get(&id).ok_or(VoxturnError::UnknownSession(id))?;
            handle.session.clone()
        };
        let outcome = rx.wait_for(|s| s.state.is_terminal()).await.map(|s| s.clone());
        match outcome {
            Ok(session) => Ok(session),
            Err(_) => {
                let last = rx.borrow().clone();
                if last.state.is_terminal() {
                    Ok(last)
                } else {
                    Err(VoxturnError::CallTask(format!(
                        "call {id} task exited before ending"
                    )))
                }
            }
        }
    }

    /// Subscribe to events from every call.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.tx.subscribe()
    }

    /// Snapshot of a call's capture counters.
    pub fn capture_diagnostics(&self, id: SessionId) -> Result<CaptureDiagnosticsSnapshot> {
        let calls = self.calls.lock();
        let handle = calls.get(&id).ok_or(VoxturnError::UnknownSession(id))?;
        Ok(handle.diagnostics.snapshot())
    }

    fn build_classifier(&self, config: &EngineConfig) -> Box<dyn FrameClassifier> {
        match &self.collaborators.classifier {
            Some(factory) => factory(),
            None => Box::new(EnergyVad::new(config.vad)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_converts_to_default_frame_counts() {
        let config = EngineConfig::default();
        assert_eq!(config.assembler_config(), AssemblerConfig::default());
    }

    #[test]
    fn durations_round_up_to_whole_frames() {
        let config = EngineConfig {
            silence_timeout: Duration::from_millis(100),
            min_utterance: Duration::from_millis(31),
            still_there_window: Some(Duration::from_secs(15)),
            ..EngineConfig::default()
        };
        let frames = config.assembler_config();
        assert_eq!(frames.silence_frames, 4);
        assert_eq!(frames.min_utterance_frames, 2);
        assert_eq!(frames.confirm_frames, Some(500));
    }

    #[test]
    fn trailing_pad_never_exceeds_silence_run() {
        let config = EngineConfig {
            silence_timeout: Duration::from_millis(90),
            trailing_pad_frames: 10,
            ..EngineConfig::default()
        };
        assert_eq!(config.assembler_config().trailing_pad_frames, 3);
    }

    fn handle(session: CallSession) -> CallHandle {
        let (_tx, rx) = watch::channel(session);
        CallHandle {
            stop: CancellationToken::new(),
            session: rx,
            diagnostics: Arc::new(CaptureDiagnostics::default()),
        }
    }

    fn ended_call(minutes_ago: i64) -> CallSession {
        let mut session = CallSession::new(
            SessionId::new(),
            Persona::new("Lily", "You are a friendly receptionist."),
            VoiceId::new("en-US-JennyNeural"),
        );
        session.state = CallState::Ended;
        session.ended_at = Some(Utc::now() - chrono::Duration::minutes(minutes_ago));
        session
    }

    #[test]
    fn pruning_forgets_the_oldest_ended_calls_only() {
        let mut calls = HashMap::new();
        let mut ended = Vec::new();
        for minutes_ago in 0..5 {
            let session = ended_call(minutes_ago);
            ended.push(session.id);
            calls.insert(session.id, handle(session));
        }
        let mut live = ended_call(60);
        live.state = CallState::Listening;
        live.ended_at = None;
        let live_id = live.id;
        calls.insert(live_id, handle(live));

        prune_ended_calls(&mut calls, 3);

        assert_eq!(calls.len(), 4);
        assert!(calls.contains_key(&live_id));
        // ended[0] ended most recently, ended[4] longest ago.
        assert!(ended[..3].iter().all(|id| calls.contains_key(id)));
        assert!(ended[3..].iter().all(|id| !calls.contains_key(id)));

        prune_ended_calls(&mut calls, 3);
        assert_eq!(calls.len(), 4);
    }

    #[test]
    fn zero_max_utterance_disables_the_cap() {
        let config = EngineConfig {
            max_utterance: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert_eq!(config.assembler_config().max_utterance_frames, 0);
    }
}
