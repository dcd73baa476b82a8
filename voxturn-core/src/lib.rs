//! # voxturn-core
//!
//! Turn-taking voice dialogue engine SDK.
//!
//! ## Architecture
//!
//! ```text
//! FrameSource ─► VoiceActivityGate ─► UtteranceAssembler      (capture thread, spawn_blocking)
//!                                            │ CaptureEvent (unbounded mpsc)
//!                                            ▼
//!                              ConversationOrchestrator        (one tokio task per call)
//!                                            │
//!                       DialogueTurnPipeline: Transcribe ─► Infer ─► Synthesize
//!                                            │
//!                                          Player
//!                                            │
//!                              broadcast::Sender<CallEvent>
//! ```
//!
//! Speech recognition, language models, speech synthesis and storage are
//! injected through the traits in [`services`] and [`persistence`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod persistence;
pub mod pipeline;
pub mod segment;
pub mod services;
pub mod session;
pub mod vad;

// Convenience re-exports for downstream crates
pub use audio::{AudioDeviceProvider, FactoryDeviceProvider, FrameSource, Player};
pub use buffering::frame::{AudioClip, Frame, FrameSpec};
pub use engine::{CallEngine, CaptureDiagnosticsSnapshot, Collaborators, EngineConfig};
pub use error::{ServiceError, StageError, StageName, VoxturnError};
pub use ipc::events::{CallEvent, CallEventKind};
pub use persistence::{ConversationStore, MemoryStore, TurnRecord};
pub use pipeline::{DialogueTurnPipeline, StageTimeouts};
pub use services::{
    HistoryEntry, InferenceService, SynthesisService, Transcript, TranscriptionService,
};
pub use session::{CallSession, CallState, EndReason, Persona, SessionId, Turn, TurnStatus, VoiceId};
pub use vad::{EnergyVad, EnergyVadConfig, FrameClassifier};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalDeviceProvider;
