//! SQLite conversation store.
//!
//! One row per call in `call_sessions`, one row per finalized turn in
//! `call_turns`. Audio is never stored; turns keep only their lengths.

use std::path::PathBuf;

use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;
use voxturn_core::{
    error::Result, CallSession, ConversationStore, HistoryEntry, SessionId, Turn, TurnRecord,
    TurnStatus, VoxturnError,
};

/// Row of the `sessions` listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub persona: String,
    pub voice: String,
    pub state: String,
    pub end_reason: Option<String>,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub turns_completed: u32,
    pub turns_failed: u32,
}

/// Transcript line of one stored turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTurn {
    pub index: u32,
    pub status: String,
    pub transcript: Option<String>,
    pub reply_text: Option<String>,
    pub utterance_ms: u64,
    pub started_at: String,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
    /// When false, turns are not written; sessions still are.
    history_enabled: bool,
}

fn db_err(e: rusqlite::Error) -> VoxturnError {
    VoxturnError::Persistence(e.to_string())
}

impl SqliteStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            db_path,
            history_enabled: true,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn with_history(mut self, enabled: bool) -> Self {
        self.history_enabled = enabled;
        self
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).map_err(db_err)?;
        conn.busy_timeout(std::time::Duration::from_secs(2))
            .map_err(db_err)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS call_sessions (
              id TEXT PRIMARY KEY,
              persona TEXT NOT NULL,
              voice TEXT NOT NULL,
              state TEXT NOT NULL,
              end_reason TEXT,
              started_at INTEGER NOT NULL,
              last_activity_at INTEGER NOT NULL,
              ended_at INTEGER,
              turns_completed INTEGER NOT NULL DEFAULT 0,
              turns_failed INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS call_turns (
              session_id TEXT NOT NULL,
              turn_index INTEGER NOT NULL,
              status TEXT NOT NULL,
              transcript TEXT,
              reply_text TEXT,
              utterance_frames INTEGER NOT NULL DEFAULT 0,
              utterance_ms INTEGER NOT NULL DEFAULT 0,
              reply_audio_ms INTEGER,
              started_at INTEGER NOT NULL,
              ended_at INTEGER,
              failures_json TEXT NOT NULL DEFAULT '[]',
              PRIMARY KEY (session_id, turn_index)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_started_at ON call_sessions(started_at DESC);
            CREATE INDEX IF NOT EXISTS idx_turns_session ON call_turns(session_id, turn_index DESC);
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Delete calls (and their turns) that started more than `retention_days` ago.
    pub fn prune(&self, retention_days: usize) -> Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = (Utc::now() - Duration::days(retention_days as i64)).timestamp_millis();
        let conn = self.open()?;
        conn.execute(
            "DELETE FROM call_turns WHERE session_id IN (SELECT id FROM call_sessions WHERE started_at < ?1)",
            params![cutoff],
        )
        .map_err(db_err)?;
        let removed = conn
            .execute(
                "DELETE FROM call_sessions WHERE started_at < ?1",
                params![cutoff],
            )
            .map_err(db_err)?;
        Ok(removed)
    }

    /// Most recent calls first.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<SessionSummary>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, persona, voice, state, end_reason, started_at, ended_at, turns_completed, turns_failed
                 FROM call_sessions ORDER BY started_at DESC LIMIT ?1",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit.clamp(1, 500) as i64], |row| {
                let ended_at: Option<i64> = row.get(6)?;
                Ok(SessionSummary {
                    id: row.get(0)?,
                    persona: row.get(1)?,
                    voice: row.get(2)?,
                    state: row.get(3)?,
                    end_reason: row.get(4)?,
                    started_at: ms_to_rfc3339(row.get(5)?),
                    ended_at: ended_at.map(ms_to_rfc3339),
                    turns_completed: row.get(7)?,
                    turns_failed: row.get(8)?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Every stored turn of one call, in order.
    pub fn session_turns(&self, session: SessionId) -> Result<Vec<StoredTurn>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT turn_index, status, transcript, reply_text, utterance_ms, started_at
                 FROM call_turns WHERE session_id = ?1 ORDER BY turn_index ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![session.to_string()], |row| {
                Ok(StoredTurn {
                    index: row.get(0)?,
                    status: row.get(1)?,
                    transcript: row.get(2)?,
                    reply_text: row.get(3)?,
                    utterance_ms: row.get::<_, i64>(4)?.max(0) as u64,
                    started_at: ms_to_rfc3339(row.get(5)?),
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Resolve a full id or a unique prefix of one.
    pub fn find_session(&self, id_or_prefix: &str) -> Result<Option<SessionId>> {
        let conn = self.open()?;
        let pattern = format!("{}%", id_or_prefix.trim().to_ascii_lowercase());
        let mut stmt = conn
            .prepare("SELECT id FROM call_sessions WHERE id LIKE ?1 ORDER BY started_at DESC LIMIT 2")
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![pattern], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        if ids.len() != 1 {
            return Ok(None);
        }
        let uuid = Uuid::parse_str(&ids[0]).map_err(|e| VoxturnError::Persistence(e.to_string()))?;
        Ok(Some(SessionId(uuid)))
    }

    pub fn session_state(&self, session: SessionId) -> Result<Option<String>> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT state FROM call_sessions WHERE id = ?1",
            params![session.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }
}

impl ConversationStore for SqliteStore {
    fn record_turn(&self, turn: Turn) -> Result<()> {
        if !self.history_enabled {
            return Ok(());
        }
        let record = TurnRecord::from(&turn);
        drop(turn);
        let failures = serde_json::to_string(&record.failures)
            .map_err(|e| VoxturnError::Persistence(e.to_string()))?;
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO call_turns
            (session_id, turn_index, status, transcript, reply_text, utterance_frames, utterance_ms,
             reply_audio_ms, started_at, ended_at, failures_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                record.session_id.to_string(),
                record.index,
                record.status.as_str(),
                record.transcript,
                record.reply_text,
                record.utterance_frames as i64,
                record.utterance_ms as i64,
                record.reply_audio_ms.map(|ms| ms as i64),
                record.started_at.timestamp_millis(),
                record.ended_at.map(|t| t.timestamp_millis()),
                failures,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn record_session(&self, session: &CallSession) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            r#"
            INSERT INTO call_sessions
            (id, persona, voice, state, end_reason, started_at, last_activity_at, ended_at, turns_completed, turns_failed)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(id) DO UPDATE SET
              state = excluded.state,
              end_reason = excluded.end_reason,
              last_activity_at = excluded.last_activity_at,
              ended_at = excluded.ended_at,
              turns_completed = excluded.turns_completed,
              turns_failed = excluded.turns_failed
            "#,
            params![
                session.id.to_string(),
                session.persona.name,
                session.voice.as_str(),
                session.state.as_str(),
                session.end_reason.map(|r| r.as_str()),
                session.started_at.timestamp_millis(),
                session.last_activity_at.timestamp_millis(),
                session.ended_at.map(|t| t.timestamp_millis()),
                session.turns_completed,
                session.turns_failed,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn recent_history(&self, session: SessionId, limit: usize) -> Result<Vec<HistoryEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.open()?;
        let mut stmt = conn
            .prepare(
                "SELECT transcript, reply_text FROM call_turns
                 WHERE session_id = ?1 AND status = ?2
                   AND transcript IS NOT NULL AND reply_text IS NOT NULL
                 ORDER BY turn_index DESC LIMIT ?3",
            )
            .map_err(db_err)?;
        let mut entries = stmt
            .query_map(
                params![
                    session.to_string(),
                    TurnStatus::Completed.as_str(),
                    limit as i64
                ],
                |row| {
                    Ok(HistoryEntry {
                        user: row.get(0)?,
                        assistant: row.get(1)?,
                    })
                },
            )
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        entries.reverse();
        Ok(entries)
    }
}

fn ms_to_rfc3339(ms: i64) -> String {
    let dt: DateTime<Utc> = Utc
        .timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now);
    dt.to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxturn_core::{
        segment::Utterance, CallState, EndReason, Frame, Persona, StageError, StageName, VoiceId,
    };

    fn temp_store() -> (SqliteStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("voxturn-store-{}", Uuid::new_v4()));
        let store = SqliteStore::new(dir.join("conversations.db")).unwrap();
        (store, dir)
    }

    fn session() -> CallSession {
        CallSession::new(
            SessionId::new(),
            Persona::new("helpful", "Be helpful."),
            VoiceId::new("en-US-JennyNeural"),
        )
    }

    fn turn(session: SessionId, index: u32, status: TurnStatus) -> Turn {
        let utterance =
            Utterance::from_frames(vec![Frame::new(0, vec![0.3; 480], 16_000)]).unwrap();
        let mut turn = Turn::new(index, session, utterance);
        turn.transcript = Some(format!("question {index}"));
        turn.reply_text = Some(format!("answer {index}"));
        turn.finalize(status);
        turn
    }

    #[test]
    fn history_is_bounded_oldest_first_and_skips_failures() {
        let (store, dir) = temp_store();
        let call = session();
        store.record_session(&call).unwrap();
        for i in 0..4 {
            store.record_turn(turn(call.id, i, TurnStatus::Completed)).unwrap();
        }
        store.record_turn(turn(call.id, 4, TurnStatus::Failed)).unwrap();

        let history = store.recent_history(call.id, 2).unwrap();
        let users: Vec<&str> = history.iter().map(|h| h.user.as_str()).collect();
        assert_eq!(users, ["question 2", "question 3"]);
        assert_eq!(history[1].assistant, "answer 3");
        assert!(store.recent_history(SessionId::new(), 5).unwrap().is_empty());
        assert_eq!(store.session_turns(call.id).unwrap().len(), 5);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn final_session_overwrites_initial_row() {
        let (store, dir) = temp_store();
        let mut call = session();
        store.record_session(&call).unwrap();
        assert_eq!(store.session_state(call.id).unwrap().as_deref(), Some("idle"));

        call.state = CallState::Ended;
        call.end_reason = Some(EndReason::HangupTimeout);
        call.ended_at = Some(Utc::now());
        call.turns_completed = 2;
        store.record_session(&call).unwrap();

        let sessions = store.recent_sessions(10).unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, "ended");
        assert_eq!(sessions[0].end_reason.as_deref(), Some("hangup_timeout"));
        assert_eq!(sessions[0].turns_completed, 2);
        assert!(sessions[0].ended_at.is_some());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn failures_are_kept_with_the_turn() {
        let (store, dir) = temp_store();
        let call = session();
        let mut failed = turn(call.id, 0, TurnStatus::InProgress);
        failed.record_failure(
            StageName::Synthesize,
            &StageError::Cancelled {
                stage: StageName::Synthesize,
            },
            false,
        );
        failed.finalize(TurnStatus::Failed);
        store.record_turn(failed).unwrap();

        let conn = store.open().unwrap();
        let json: String = conn
            .query_row("SELECT failures_json FROM call_turns", [], |row| row.get(0))
            .unwrap();
        assert!(json.contains("\"cancelled\":true"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn disabled_history_skips_turns() {
        let (store, dir) = temp_store();
        let store = store.with_history(false);
        let call = session();
        store.record_session(&call).unwrap();
        store.record_turn(turn(call.id, 0, TurnStatus::Completed)).unwrap();
        assert!(store.session_turns(call.id).unwrap().is_empty());
        assert_eq!(store.recent_sessions(5).unwrap().len(), 1);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn find_session_accepts_unique_prefix() {
        let (store, dir) = temp_store();
        let call = session();
        store.record_session(&call).unwrap();
        let full = call.id.to_string();
        assert_eq!(store.find_session(&full[..8]).unwrap(), Some(call.id));
        assert_eq!(store.find_session("zzzz").unwrap(), None);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn prune_removes_old_calls() {
        let (store, dir) = temp_store();
        let mut old = session();
        old.started_at = Utc::now() - Duration::days(40);
        store.record_session(&old).unwrap();
        store.record_turn(turn(old.id, 0, TurnStatus::Completed)).unwrap();
        store.record_session(&session()).unwrap();

        assert_eq!(store.prune(30).unwrap(), 1);
        assert_eq!(store.recent_sessions(10).unwrap().len(), 1);
        assert!(store.session_turns(old.id).unwrap().is_empty());
        assert_eq!(store.prune(0).unwrap(), 0);
        let _ = std::fs::remove_dir_all(dir);
    }
}
