use std::time::Duration;

use thiserror::Error;

use crate::session::SessionId;

/// All engine-level errors produced by voxturn-core.
///
/// Stage-local failures never surface here; they are recorded on the
/// [`Turn`](crate::session::Turn) instead (see [`StageError`]).
#[derive(Debug, Error)]
pub enum VoxturnError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("audio devices are already leased to another call")]
    DeviceBusy,

    #[error("frame source stalled: no audio for {waited_ms} ms")]
    SourceStalled { waited_ms: u64 },

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("call task failed: {0}")]
    CallTask(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxturnError {
    /// Whether this error means the audio input/output is unusable.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            VoxturnError::AudioDevice(_)
                | VoxturnError::AudioStream(_)
                | VoxturnError::NoDefaultInputDevice
                | VoxturnError::NoDefaultOutputDevice
                | VoxturnError::SourceStalled { .. }
                | VoxturnError::Wav(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, VoxturnError>;

/// Failure reported by an external AI collaborator.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("service rejected request: {0}")]
    Rejected(String),

    #[error("malformed service response: {0}")]
    Malformed(String),

    #[error("empty result")]
    Empty,

    #[error("confidence {confidence:.2} below threshold {threshold:.2}")]
    LowConfidence { confidence: f32, threshold: f32 },
}

/// Failure of the injected frame classifier. Always degraded to silence.
#[derive(Debug, Clone, Error)]
#[error("frame classifier failed: {0}")]
pub struct ClassifierError(pub String);

/// Named pipeline stage, used for timeouts and failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Transcribe,
    Infer,
    Synthesize,
    Playback,
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageName::Transcribe => "transcribe",
            StageName::Infer => "infer",
            StageName::Synthesize => "synthesize",
            StageName::Playback => "playback",
        };
        f.write_str(name)
    }
}

/// Errors raised inside one pipeline stage.
#[derive(Debug, Clone, Error)]
pub enum StageError {
    #[error("transcription error: {0}")]
    Transcription(ServiceError),

    #[error("inference error: {0}")]
    Inference(ServiceError),

    #[error("synthesis error: {0}")]
    Synthesis(ServiceError),

    #[error("{stage} exceeded its {limit:?} timeout")]
    TimeoutExceeded { stage: StageName, limit: Duration },

    #[error("{stage} cancelled")]
    Cancelled { stage: StageName },
}

impl StageError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled { .. })
    }
}
