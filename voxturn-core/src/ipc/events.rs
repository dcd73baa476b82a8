//! Call events broadcast by [`CallEngine`](crate::engine::CallEngine).
//!
//! | Event | Emitted when |
//! |-------|--------------|
//! | `stateChanged` | the orchestrator moves the call to a new state |
//! | `speechStarted` | the caller starts speaking (silence → speech) |
//! | `utteranceReady` | an utterance is handed to the orchestrator |
//! | `utteranceDiscarded` | a segment closed below the minimum length |
//! | `turnFinalized` | a turn reached `completed` or `failed` |
//! | `stageFailed` | a pipeline stage failed (recovered or not) |
//! | `classificationDegraded` | the frame classifier failed or ran slow (rate-limited) |
//! | `stillThere` | the still-there prompt was triggered |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StageName;
use crate::persistence::TurnRecord;
use crate::session::{CallState, EndReason, SessionId};

/// One event on the engine's broadcast stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    /// Monotonically increasing across all calls of one engine.
    pub seq: u64,
    pub session_id: SessionId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: CallEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CallEventKind {
    #[serde(rename_all = "camelCase")]
    StateChanged {
        from: CallState,
        to: CallState,
        /// Set on the transition to `ended`.
        reason: Option<EndReason>,
    },
    #[serde(rename_all = "camelCase")]
    SpeechStarted { frame_seq: u64 },
    #[serde(rename_all = "camelCase")]
    UtteranceReady {
        first_seq: u64,
        last_seq: u64,
        frames: usize,
        /// Waiting behind an in-flight turn or playback.
        queued: bool,
        /// Appended to an utterance that was already waiting.
        merged: bool,
    },
    #[serde(rename_all = "camelCase")]
    UtteranceDiscarded { frames: usize },
    #[serde(rename_all = "camelCase")]
    TurnFinalized { turn: TurnRecord },
    #[serde(rename_all = "camelCase")]
    StageFailed {
        turn_index: u32,
        stage: StageName,
        message: String,
        recovered: bool,
    },
    #[serde(rename_all = "camelCase")]
    ClassificationDegraded { frame_seq: u64, total: u64 },
    StillThere,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: CallEventKind) -> CallEvent {
        CallEvent {
            seq: 7,
            session_id: SessionId::new(),
            at: Utc::now(),
            kind,
        }
    }

    #[test]
    fn state_change_serializes_flat_with_type_tag() {
        let event = event(CallEventKind::StateChanged {
            from: CallState::Listening,
            to: CallState::Ended,
            reason: Some(EndReason::HangupTimeout),
        });

        let json = serde_json::to_value(&event).expect("serialize state event");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["from"], "listening");
        assert_eq!(json["to"], "ended");
        assert_eq!(json["reason"], "hangup_timeout");
        assert!(json["sessionId"].is_string());

        let round_trip: CallEvent = serde_json::from_value(json).expect("deserialize state event");
        assert_eq!(round_trip.kind, event.kind);
        assert_eq!(round_trip.session_id, event.session_id);
    }

    #[test]
    fn stage_failure_uses_camel_case_fields() {
        let event = event(CallEventKind::StageFailed {
            turn_index: 2,
            stage: StageName::Infer,
            message: "inference error: service unavailable: down".into(),
            recovered: true,
        });

        let json = serde_json::to_value(&event).expect("serialize stage event");
        assert_eq!(json["type"], "stageFailed");
        assert_eq!(json["turnIndex"], 2);
        assert_eq!(json["stage"], "infer");
        assert_eq!(json["recovered"], true);
    }

    #[test]
    fn unit_variant_carries_only_the_tag() {
        let json = serde_json::to_value(event(CallEventKind::StillThere)).unwrap();
        assert_eq!(json["type"], "stillThere");
        assert!(json.get("frames").is_none());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let raw = r#"{"seq":1,"sessionId":"00000000-0000-0000-0000-000000000000","at":"2024-01-01T00:00:00Z","type":"bargeIn"}"#;
        assert!(serde_json::from_str::<CallEvent>(raw).is_err());
    }
}
