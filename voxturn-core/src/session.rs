//! Call and turn records.
//!
//! A [`CallSession`] is owned and mutated by exactly one orchestrator task;
//! everyone else sees snapshots. A [`Turn`] lives from the moment an utterance
//! is dispatched until it is handed, by value, to the conversation store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::buffering::frame::AudioClip;
use crate::error::{StageError, StageName};
use crate::segment::Utterance;

/// Conversation identifier handed out by [`CallEngine::start_call`].
///
/// [`CallEngine::start_call`]: crate::engine::CallEngine::start_call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Behavioural profile passed verbatim to the inference service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
}

impl Persona {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

/// Synthesis voice identifier, opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoiceId(pub String);

impl VoiceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Orchestrator state. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Listening,
    Processing,
    Speaking,
    Ended,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        self == CallState::Ended
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Listening => "listening",
            CallState::Processing => "processing",
            CallState::Speaking => "speaking",
            CallState::Ended => "ended",
        }
    }
}

/// Why a call reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    StopRequested,
    HangupTimeout,
    DeviceError,
    /// The frame source ran out (file finished, stream closed).
    Disconnected,
    RepeatedFailures,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::StopRequested => "stop_requested",
            EndReason::HangupTimeout => "hangup_timeout",
            EndReason::DeviceError => "device_error",
            EndReason::Disconnected => "disconnected",
            EndReason::RepeatedFailures => "repeated_failures",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    InProgress,
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnStatus::InProgress => "in_progress",
            TurnStatus::Completed => "completed",
            TurnStatus::Failed => "failed",
        }
    }
}

/// One stage error recorded on a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageFailure {
    pub stage: StageName,
    pub message: String,
    /// `true` when the pipeline substituted a fallback and carried on.
    pub recovered: bool,
    pub cancelled: bool,
}

/// One utterance and everything the pipeline produced for it.
#[derive(Debug)]
pub struct Turn {
    /// 0-based position within the call.
    pub index: u32,
    pub session_id: SessionId,
    pub utterance: Utterance,
    pub transcript: Option<String>,
    pub transcript_confidence: Option<f32>,
    pub reply_text: Option<String>,
    pub reply_audio: Option<AudioClip>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: TurnStatus,
    pub failures: Vec<StageFailure>,
}

impl Turn {
    pub fn new(index: u32, session_id: SessionId, utterance: Utterance) -> Self {
        Self {
            index,
            session_id,
            utterance,
            transcript: None,
            transcript_confidence: None,
            reply_text: None,
            reply_audio: None,
            started_at: Utc::now(),
            ended_at: None,
            status: TurnStatus::InProgress,
            failures: Vec::new(),
        }
    }

    pub fn record_failure(&mut self, stage: StageName, error: &StageError, recovered: bool) {
        self.failures.push(StageFailure {
            stage,
            message: error.to_string(),
            recovered,
            cancelled: error.is_cancelled(),
        });
    }

    /// Set the terminal status. Has no effect once finalized.
    pub fn finalize(&mut self, status: TurnStatus) {
        if self.status != TurnStatus::InProgress {
            return;
        }
        self.status = status;
        self.ended_at = Some(Utc::now());
    }

    pub fn is_final(&self) -> bool {
        self.status != TurnStatus::InProgress
    }

    pub fn was_cancelled(&self) -> bool {
        self.failures.iter().any(|f| f.cancelled)
    }
}

/// Live state of one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: SessionId,
    pub persona: Persona,
    pub voice: VoiceId,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: CallState,
    pub end_reason: Option<EndReason>,
    pub ended_at: Option<DateTime<Utc>>,
    pub turns_completed: u32,
    pub turns_failed: u32,
}

impl CallSession {
    pub fn new(id: SessionId, persona: Persona, voice: VoiceId) -> Self {
        let now = Utc::now();
        Self {
            id,
            persona,
            voice,
            started_at: now,
            last_activity_at: now,
            state: CallState::Idle,
            end_reason: None,
            ended_at: None,
            turns_completed: 0,
            turns_failed: 0,
        }
    }

    /// Record caller activity (speech onset or a completed turn).
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    pub fn total_turns(&self) -> u32 {
        self.turns_completed + self.turns_failed
    }
}
