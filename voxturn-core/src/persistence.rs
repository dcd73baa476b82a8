//! Conversation persistence contract.
//!
//! The core only writes finalized turns and sessions, and reads back the
//! bounded history window the inference stage needs. Implementations are
//! synchronous; the orchestrator calls them from `spawn_blocking`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::services::HistoryEntry;
use crate::session::{CallSession, SessionId, StageFailure, Turn, TurnStatus};

pub trait ConversationStore: Send + Sync + 'static {
    /// Takes ownership: the core keeps nothing after this call.
    fn record_turn(&self, turn: Turn) -> Result<()>;

    /// Called on start and again with the final state on `Ended`.
    fn record_session(&self, session: &CallSession) -> Result<()>;

    /// Up to `limit` most recent completed exchanges, oldest first.
    fn recent_history(&self, session: SessionId, limit: usize) -> Result<Vec<HistoryEntry>>;
}

/// Audio-free summary of a finalized [`Turn`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub session_id: SessionId,
    pub index: u32,
    pub status: TurnStatus,
    pub transcript: Option<String>,
    pub reply_text: Option<String>,
    pub utterance_frames: usize,
    pub utterance_ms: u64,
    pub reply_audio_ms: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub failures: Vec<StageFailure>,
}

impl From<&Turn> for TurnRecord {
    fn from(turn: &Turn) -> Self {
        Self {
            session_id: turn.session_id,
            index: turn.index,
            status: turn.status,
            transcript: turn.transcript.clone(),
            reply_text: turn.reply_text.clone(),
            utterance_frames: turn.utterance.len(),
            utterance_ms: turn.utterance.duration().as_millis() as u64,
            reply_audio_ms: turn
                .reply_audio
                .as_ref()
                .map(|clip| clip.duration().as_millis() as u64),
            started_at: turn.started_at,
            ended_at: turn.ended_at,
            failures: turn.failures.clone(),
        }
    }
}

impl TurnRecord {
    /// History only carries exchanges that actually produced a reply.
    pub fn history_entry(&self) -> Option<HistoryEntry> {
        if self.status != TurnStatus::Completed {
            return None;
        }
        Some(HistoryEntry {
            user: self.transcript.clone()?,
            assistant: self.reply_text.clone()?,
        })
    }
}

/// In-process store. Used by tests and the `--no-store` mode of the app.
#[derive(Default)]
pub struct MemoryStore {
    turns: Mutex<HashMap<SessionId, Vec<TurnRecord>>>,
    sessions: Mutex<HashMap<SessionId, CallSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self, session: SessionId) -> Vec<TurnRecord> {
        self.turns.lock().get(&session).cloned().unwrap_or_default()
    }

    pub fn session(&self, session: SessionId) -> Option<CallSession> {
        self.sessions.lock().get(&session).cloned()
    }
}

impl ConversationStore for MemoryStore {
    fn record_turn(&self, turn: Turn) -> Result<()> {
        let record = TurnRecord::from(&turn);
        self.turns
            .lock()
            .entry(record.session_id)
            .or_default()
            .push(record);
        Ok(())
    }

    fn record_session(&self, session: &CallSession) -> Result<()> {
        self.sessions.lock().insert(session.id, session.clone());
        Ok(())
    }

    fn recent_history(&self, session: SessionId, limit: usize) -> Result<Vec<HistoryEntry>> {
        let turns = self.turns.lock();
        let Some(records) = turns.get(&session) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<HistoryEntry> = records
            .iter()
            .rev()
            .filter_map(TurnRecord::history_entry)
            .take(limit)
            .collect();
        entries.reverse();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::frame::Frame;
    use crate::segment::Utterance;

    fn turn(session: SessionId, index: u32, status: TurnStatus) -> Turn {
        let utt = Utterance::from_frames(vec![Frame::new(0, vec![0.3; 480], 16_000)]).unwrap();
        let mut turn = Turn::new(index, session, utt);
        turn.transcript = Some(format!("q{index}"));
        turn.reply_text = Some(format!("a{index}"));
        turn.finalize(status);
        turn
    }

    #[test]
    fn history_is_bounded_and_oldest_first() {
        let store = MemoryStore::new();
        let id = SessionId::new();
        for i in 0..5 {
            store.record_turn(turn(id, i, TurnStatus::Completed)).unwrap();
        }
        let history = store.recent_history(id, 3).unwrap();
        let users: Vec<&str> = history.iter().map(|h| h.user.as_str()).collect();
        assert_eq!(users, ["q2", "q3", "q4"]);
    }

    #[test]
    fn failed_turns_are_not_history() {
        let store = MemoryStore::new();
        let id = SessionId::new();
        store.record_turn(turn(id, 0, TurnStatus::Completed)).unwrap();
        store.record_turn(turn(id, 1, TurnStatus::Failed)).unwrap();
        assert_eq!(store.recent_history(id, 10).unwrap().len(), 1);
        assert_eq!(store.turns(id).len(), 2);
        assert!(store.recent_history(SessionId::new(), 10).unwrap().is_empty());
    }

    #[test]
    fn record_keeps_utterance_shape_without_audio() {
        let id = SessionId::new();
        let record = TurnRecord::from(&turn(id, 0, TurnStatus::Completed));
        assert_eq!(record.utterance_frames, 1);
        assert_eq!(record.utterance_ms, 30);
        assert_eq!(record.reply_audio_ms, None);
    }
}
