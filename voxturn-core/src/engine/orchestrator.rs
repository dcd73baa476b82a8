//! Per-call conversation state machine.
//!
//! ```text
//!   Idle ─► Listening ─► Processing ─► Speaking ─► Listening ─► …
//!                 │           │            │
//!                 └───────────┴────────────┴──► Ended
//! ```
//!
//! The orchestrator is the only writer of [`CallSession`]. It runs as one
//! tokio task and multiplexes three inputs: the stop token, capture events
//! and the single in-flight activity (a turn, a prompt synthesis or a
//! playback). Each activity gets its own child token so stop and hangup can
//! cancel it and wait for it to wind down.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::capture::{CaptureControl, CaptureEvent};
use super::{EngineConfig, EventSink};
use crate::audio::{DeviceLease, Player};
use crate::buffering::frame::AudioClip;
use crate::error::{Result, StageError, StageName, VoxturnError};
use crate::ipc::events::CallEventKind;
use crate::persistence::{ConversationStore, TurnRecord};
use crate::pipeline::{DialogueTurnPipeline, TurnContext};
use crate::segment::Utterance;
use crate::services::SynthesisService;
use crate::session::{CallSession, CallState, EndReason, Turn, TurnStatus};

/// How long a cancelled activity gets to finish before it is abandoned.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

/// How long shutdown waits for the capture thread to notice the stop flag.
const CAPTURE_JOIN_GRACE: Duration = Duration::from_secs(3);

type ActivityFuture = Pin<Box<dyn Future<Output = ActivityOutcome> + Send>>;

enum ActivityOutcome {
    Turn(Turn),
    PromptReady(std::result::Result<AudioClip, StageError>),
    Played(PlaybackResult),
}

enum PlaybackResult {
    Finished,
    TimedOut(Duration),
    Failed(VoxturnError),
}

struct Activity {
    cancel: CancellationToken,
    future: ActivityFuture,
}

enum Step {
    Stop,
    Activity(ActivityOutcome),
    Capture(Option<CaptureEvent>),
}

/// Everything the orchestrator task owns for one call.
pub(crate) struct Orchestrator {
    session: CallSession,
    config: Arc<EngineConfig>,
    pipeline: DialogueTurnPipeline,
    synthesizer: Arc<dyn SynthesisService>,
    player: Arc<dyn Player>,
    store: Arc<dyn ConversationStore>,
    control: Arc<CaptureControl>,
    events: EventSink,
    published: watch::Sender<CallSession>,
    stop: CancellationToken,
    /// Released just before `Ended` is published, or on drop if the task unwinds.
    lease: Option<DeviceLease>,
    activity: Option<Activity>,
    queued: Option<Utterance>,
    next_turn_index: u32,
    failure_streak: u32,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: CallSession,
        config: Arc<EngineConfig>,
        pipeline: DialogueTurnPipeline,
        synthesizer: Arc<dyn SynthesisService>,
        player: Arc<dyn Player>,
        store: Arc<dyn ConversationStore>,
        control: Arc<CaptureControl>,
        events: EventSink,
        published: watch::Sender<CallSession>,
        stop: CancellationToken,
        lease: DeviceLease,
    ) -> Self {
        Self {
            session,
            config,
            pipeline,
            synthesizer,
            player,
            store,
            control,
            events,
            published,
            stop,
            lease: Some(lease),
            activity: None,
            queued: None,
            next_turn_index: 0,
            failure_streak: 0,
        }
    }

    /// Drive the call until it ends. Returns the final session.
    pub async fn run(
        mut self,
        mut capture_events: mpsc::UnboundedReceiver<CaptureEvent>,
        capture: JoinHandle<()>,
    ) -> CallSession {
        self.transition(CallState::Listening, None);

        let reason = loop {
            let step = tokio::select! {
                biased;
                _ = self.stop.cancelled() => Step::Stop,
                outcome = next_outcome(&mut self.activity) => Step::Activity(outcome),
                event = capture_events.recv() => Step::Capture(event),
            };

            let ended = match step {
                Step::Stop => Some(EndReason::StopRequested),
                Step::Activity(outcome) => {
                    self.activity = None;
                    self.on_outcome(outcome).await
                }
                Step::Capture(event) => self.on_capture(event),
            };
            if let Some(reason) = ended {
                break reason;
            }
        };

        drop(capture_events);
        self.shutdown(reason, capture).await
    }

    fn on_capture(&mut self, event: Option<CaptureEvent>) -> Option<EndReason> {
        let Some(event) = event else {
            error!("capture thread exited without a final event");
            return Some(EndReason::DeviceError);
        };

        match event {
            CaptureEvent::SpeechStarted { seq } => {
                self.session.touch();
                self.publish();
                self.events
                    .emit(self.session.id, CallEventKind::SpeechStarted { frame_seq: seq });
            }
            CaptureEvent::Utterance(utterance) => self.accept_utterance(utterance),
            CaptureEvent::Discarded { frames } => {
                debug!(frames, "utterance below minimum length discarded");
                self.events
                    .emit(self.session.id, CallEventKind::UtteranceDiscarded { frames });
            }
            CaptureEvent::StillThere => {
                self.events.emit(self.session.id, CallEventKind::StillThere);
                if self.activity.is_none() && self.session.state == CallState::Listening {
                    self.start_prompt();
                }
            }
            CaptureEvent::Degraded { seq, total } => {
                self.events.emit(
                    self.session.id,
                    CallEventKind::ClassificationDegraded {
                        frame_seq: seq,
                        total,
                    },
                );
            }
            CaptureEvent::EndOfCall => {
                info!("caller inactive past the hangup timeout");
                return Some(EndReason::HangupTimeout);
            }
            CaptureEvent::Disconnected => return Some(EndReason::Disconnected),
            CaptureEvent::DeviceError(message) => {
                error!(%message, "input device failed");
                return Some(EndReason::DeviceError);
            }
        }
        None
    }

    fn accept_utterance(&mut self, utterance: Utterance) {
        let (first_seq, last_seq, frames) =
            (utterance.first_seq(), utterance.last_seq(), utterance.len());
        let idle = self.activity.is_none() && self.session.state == CallState::Listening;

        let (queued, merged) = if idle {
            self.start_turn(utterance);
            (false, false)
        } else if let Some(waiting) = self.queued.as_mut() {
            waiting.extend(utterance);
            debug!(frames = waiting.len(), "utterance merged into queued one");
            (true, true)
        } else {
            debug!(frames, "utterance queued behind in-flight activity");
            self.queued = Some(utterance);
            (true, false)
        };

        self.events.emit(
            self.session.id,
            CallEventKind::UtteranceReady {
                first_seq,
                last_seq,
                frames,
                queued,
                merged,
            },
        );
    }

    fn start_turn(&mut self, utterance: Utterance) {
        let index = self.next_turn_index;
        self.next_turn_index += 1;
        self.control.hold();
        self.transition(CallState::Processing, None);

        let cancel = self.stop.child_token();
        let ctx = TurnContext {
            session_id: self.session.id,
            persona: self.session.persona.clone(),
            voice: self.session.voice.clone(),
            history_window: self.config.history_window,
            cancel: cancel.clone(),
        };
        let turn = Turn::new(index, self.session.id, utterance);
        let pipeline = self.pipeline.clone();

        self.activity = Some(Activity {
            cancel,
            future: Box::pin(async move { ActivityOutcome::Turn(pipeline.run(turn, &ctx).await) }),
        });
    }

    fn start_prompt(&mut self) {
        self.control.hold();
        self.transition(CallState::Processing, None);

        let cancel = self.stop.child_token();
        let token = cancel.clone();
        let synthesizer = Arc::clone(&self.synthesizer);
        let text = self.config.still_there_prompt.clone();
        let voice = self.session.voice.clone();
        let limit = self.config.stage_timeouts.synthesize;

        let future = async move {
            let stage = StageName::Synthesize;
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(StageError::Cancelled { stage }),
                res = tokio::time::timeout(limit, synthesizer.synthesize(&text, &voice)) => match res {
                    Ok(Ok(clip)) => Ok(clip),
                    Ok(Err(e)) => Err(StageError::Synthesis(e)),
                    Err(_) => Err(StageError::TimeoutExceeded { stage, limit }),
                },
            };
            ActivityOutcome::PromptReady(result)
        };
        self.activity = Some(Activity {
            cancel,
            future: Box::pin(future),
        });
    }

    fn start_playback(&mut self, clip: AudioClip) {
        self.transition(CallState::Speaking, None);
        if self.config.mute_while_speaking {
            self.control.set_muted(true);
        }

        let cancel = self.stop.child_token();
        let token = cancel.clone();
        let player = Arc::clone(&self.player);
        let limit = clip.duration() + self.config.playback_slack;

        let future = async move {
            let result = match tokio::time::timeout(limit, player.play(&clip, token.clone())).await
            {
                Ok(Ok(())) => PlaybackResult::Finished,
                Ok(Err(e)) => PlaybackResult::Failed(e),
                Err(_) => {
                    token.cancel();
                    PlaybackResult::TimedOut(limit)
                }
            };
            ActivityOutcome::Played(result)
        };
        self.activity = Some(Activity {
            cancel,
            future: Box::pin(future),
        });
    }

    async fn on_outcome(&mut self, outcome: ActivityOutcome) -> Option<EndReason> {
        match outcome {
            ActivityOutcome::Turn(turn) => self.on_turn_finished(turn).await,
            ActivityOutcome::PromptReady(Ok(clip)) if !clip.is_empty() => {
                self.start_playback(clip);
                None
            }
            ActivityOutcome::PromptReady(Ok(_)) => {
                self.resume_listening();
                None
            }
            ActivityOutcome::PromptReady(Err(e)) => {
                warn!(error = %e, "still-there prompt could not be synthesized");
                self.resume_listening();
                None
            }
            ActivityOutcome::Played(PlaybackResult::Finished) => {
                self.resume_listening();
                None
            }
            ActivityOutcome::Played(PlaybackResult::TimedOut(limit)) => {
                warn!(limit_ms = limit.as_millis() as u64, "playback overran, cut short");
                self.resume_listening();
                None
            }
            ActivityOutcome::Played(PlaybackResult::Failed(e)) if e.is_device_error() => {
                error!(error = %e, "output device failed");
                Some(EndReason::DeviceError)
            }
            ActivityOutcome::Played(PlaybackResult::Failed(e)) => {
                warn!(error = %e, "playback failed");
                self.resume_listening();
                None
            }
        }
    }

    async fn on_turn_finished(&mut self, turn: Turn) -> Option<EndReason> {
        let completed = turn.status == TurnStatus::Completed;
        let reply = if completed {
            turn.reply_audio.clone().filter(|clip| !clip.is_empty())
        } else {
            None
        };
        self.finish_turn(turn).await;

        if completed {
            self.control.reset_inactivity();
        } else {
            let max = self.config.max_consecutive_failures;
            if max > 0 && self.failure_streak >= max {
                warn!(streak = self.failure_streak, "too many failed turns in a row");
                return Some(EndReason::RepeatedFailures);
            }
        }

        match reply {
            Some(clip) => self.start_playback(clip),
            None => self.resume_listening(),
        }
        None
    }

    /// Account for a finalized turn, persist it and announce it.
    async fn finish_turn(&mut self, turn: Turn) {
        let session_id = self.session.id;
        for failure in &turn.failures {
            self.events.emit(
                session_id,
                CallEventKind::StageFailed {
                    turn_index: turn.index,
                    stage: failure.stage,
                    message: failure.message.clone(),
                    recovered: failure.recovered,
                },
            );
        }

        match turn.status {
            TurnStatus::Completed => {
                self.failure_streak = 0;
                self.session.turns_completed += 1;
                self.session.touch();
            }
            _ => {
                self.failure_streak += 1;
                self.session.turns_failed += 1;
            }
        }
        info!(
            turn = turn.index,
            status = turn.status.as_str(),
            completed = self.session.turns_completed,
            failed = self.session.turns_failed,
            "turn finalized"
        );

        let record = TurnRecord::from(&turn);
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.record_turn(turn)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist turn"),
            Err(e) => error!(error = %e, "persistence task panicked"),
        }

        self.publish();
        self.events
            .emit(session_id, CallEventKind::TurnFinalized { turn: record });
    }

    fn resume_listening(&mut self) {
        self.control.set_muted(false);
        match self.queued.take() {
            Some(utterance) => self.start_turn(utterance),
            None => {
                self.transition(CallState::Listening, None);
                self.control.release();
            }
        }
    }

    async fn shutdown(mut self, reason: EndReason, capture: JoinHandle<()>) -> CallSession {
        info!(reason = reason.as_str(), "ending call");

        if let Some(activity) = self.activity.take() {
            activity.cancel.cancel();
            match tokio::time::timeout(CANCEL_GRACE, activity.future).await {
                Ok(ActivityOutcome::Turn(turn)) => self.finish_turn(turn).await,
                Ok(_) => {}
                Err(_) => warn!("in-flight activity ignored cancellation"),
            }
        }
        if let Some(utterance) = self.queued.take() {
            debug!(frames = utterance.len(), "queued utterance dropped at call end");
        }

        self.control.stop();
        match tokio::time::timeout(CAPTURE_JOIN_GRACE, capture).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "capture thread panicked"),
            Err(_) => warn!("capture thread did not stop in time"),
        }

        self.session.end_reason = Some(reason);
        self.session.ended_at = Some(chrono::Utc::now());
        let mut last = self.session.clone();
        last.state = CallState::Ended;
        if let Err(e) = persist_session(Arc::clone(&self.store), last).await {
            warn!(error = %e, "failed to persist final session");
        }

        drop(self.lease.take());
        self.transition(CallState::Ended, Some(reason));

        info!(
            turns_completed = self.session.turns_completed,
            turns_failed = self.session.turns_failed,
            "call ended"
        );
        self.session
    }

    fn transition(&mut self, to: CallState, reason: Option<EndReason>) {
        let from = self.session.state;
        if from == to || from.is_terminal() {
            return;
        }
        self.session.state = to;
        debug!(from = from.as_str(), to = to.as_str(), "call state changed");
        self.events.emit(
            self.session.id,
            CallEventKind::StateChanged { from, to, reason },
        );
        // Published after the event so waiters never see a state before it is announced.
        self.publish();
    }

    fn publish(&self) {
        self.published.send_replace(self.session.clone());
    }
}

async fn next_outcome(activity: &mut Option<Activity>) -> ActivityOutcome {
    match activity {
        Some(activity) => (&mut activity.future).await,
        None => std::future::pending().await,
    }
}

/// Hand a session snapshot to the store off the async runtime.
pub(crate) async fn persist_session(
    store: Arc<dyn ConversationStore>,
    session: CallSession,
) -> Result<()> {
    tokio::task::spawn_blocking(move || store.record_session(&session))
        .await
        .map_err(|e| VoxturnError::CallTask(format!("persistence task: {e}")))?
}
