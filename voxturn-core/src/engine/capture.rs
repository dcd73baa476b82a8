//! Blocking capture loop: frame source → VAD gate → utterance assembler.
//!
//! Runs on a `spawn_blocking` thread for the whole call. The source is built
//! on that thread (see [`FrameSourceFactory`]) and dropped there when the loop
//! exits. Results travel to the orchestrator over an unbounded channel so a
//! slow turn never stalls frame acquisition.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::{FrameSource, FrameSourceFactory};
use crate::error::{Result, VoxturnError};
use crate::segment::{AssemblerEvent, Utterance, UtteranceAssembler};
use crate::vad::VoiceActivityGate;

/// Degraded classifications are surfaced for the first one and then every Nth.
const DEGRADED_REPORT_EVERY: u64 = 50;

/// Flags shared between the orchestrator and the capture thread.
#[derive(Debug, Default)]
pub struct CaptureControl {
    /// An utterance or prompt is being handled; inactivity does not advance.
    busy: AtomicBool,
    /// Bot audio is playing; segmentation is suspended.
    muted: AtomicBool,
    /// Bumped after each completed turn to restart the hangup countdown.
    reset_epoch: AtomicU64,
    stop: AtomicBool,
}

impl CaptureControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// An utterance or prompt is in hand; set by capture on hand-off and
    /// again by the orchestrator on dispatch.
    pub(crate) fn hold(&self) {
        self.busy.store(true, Ordering::Release);
    }

    /// The orchestrator is back to `Listening`.
    pub fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn reset_inactivity(&self) {
        self.reset_epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn epoch(&self) -> u64 {
        self.reset_epoch.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// What the capture thread reports to the orchestrator.
#[derive(Debug)]
pub enum CaptureEvent {
    SpeechStarted { seq: u64 },
    Utterance(Utterance),
    Discarded { frames: usize },
    StillThere,
    EndOfCall,
    /// Classifier failed or was too slow (rate-limited).
    Degraded { seq: u64, total: u64 },
    /// The source reported end of stream.
    Disconnected,
    DeviceError(String),
}

/// Counters updated by the capture thread.
#[derive(Debug, Default)]
pub struct CaptureDiagnostics {
    pub frames_in: AtomicUsize,
    pub frames_muted: AtomicUsize,
    pub vad_frames: AtomicUsize,
    pub vad_speech: AtomicUsize,
    pub classifier_degraded: AtomicUsize,
    pub utterances_emitted: AtomicUsize,
    pub utterances_discarded: AtomicUsize,
}

impl CaptureDiagnostics {
    pub fn snapshot(&self) -> CaptureDiagnosticsSnapshot {
        CaptureDiagnosticsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_muted: self.frames_muted.load(Ordering::Relaxed),
            vad_frames: self.vad_frames.load(Ordering::Relaxed),
            vad_speech: self.vad_speech.load(Ordering::Relaxed),
            classifier_degraded: self.classifier_degraded.load(Ordering::Relaxed),
            utterances_emitted: self.utterances_emitted.load(Ordering::Relaxed),
            utterances_discarded: self.utterances_discarded.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureDiagnosticsSnapshot {
    pub frames_in: usize,
    pub frames_muted: usize,
    pub vad_frames: usize,
    pub vad_speech: usize,
    pub classifier_degraded: usize,
    pub utterances_emitted: usize,
    pub utterances_discarded: usize,
}

/// Everything the capture thread owns.
pub struct CaptureSetup {
    pub source: FrameSourceFactory,
    pub gate: VoiceActivityGate,
    pub assembler: UtteranceAssembler,
    pub control: Arc<CaptureControl>,
    pub diagnostics: Arc<CaptureDiagnostics>,
}

/// Start the capture thread and wait until the source is open.
///
/// Returns the thread handle and the event receiver, or the error the
/// source factory reported.
pub async fn spawn_capture(
    setup: CaptureSetup,
) -> Result<(JoinHandle<()>, mpsc::UnboundedReceiver<CaptureEvent>)> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (open_tx, open_rx) = oneshot::channel::<Result<()>>();

    let handle = tokio::task::spawn_blocking(move || {
        let CaptureSetup {
            source,
            gate,
            assembler,
            control,
            diagnostics,
        } = setup;

        // Must happen on this thread: live sources are !Send.
        let source = match source() {
            Ok(source) => {
                let _ = open_tx.send(Ok(()));
                source
            }
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };

        let mut capture = CaptureLoop {
            source,
            gate,
            assembler,
            control,
            diagnostics,
            events: events_tx,
        };
        capture.run();
    });

    match open_rx.await {
        Ok(Ok(())) => Ok((handle, events_rx)),
        Ok(Err(e)) => {
            let _ = handle.await;
            Err(e)
        }
        Err(_) => Err(VoxturnError::CallTask(
            "capture thread died before opening its source".into(),
        )),
    }
}

struct CaptureLoop {
    source: Box<dyn FrameSource>,
    gate: VoiceActivityGate,
    assembler: UtteranceAssembler,
    control: Arc<CaptureControl>,
    diagnostics: Arc<CaptureDiagnostics>,
    events: mpsc::UnboundedSender<CaptureEvent>,
}

impl CaptureLoop {
    fn run(&mut self) {
        let spec = self.source.spec();
        info!(
            sample_rate = spec.sample_rate,
            frame_ms = spec.frame_ms,
            "capture started"
        );

        let mut was_muted = false;
        let mut seen_epoch = self.control.epoch();

        loop {
            if self.control.is_stopped() {
                break;
            }

            let frame = match self.source.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("frame source ended");
                    self.send(CaptureEvent::Disconnected);
                    break;
                }
                Err(e) => {
                    if !self.control.is_stopped() {
                        error!(error = %e, "frame source failed");
                        self.send(CaptureEvent::DeviceError(e.to_string()));
                    }
                    break;
                }
            };
            CaptureDiagnostics::bump(&self.diagnostics.frames_in);

            if self.control.is_muted() {
                if !was_muted {
                    let dropped = self.assembler.suspend();
                    self.gate.reset();
                    if dropped > 0 {
                        debug!(dropped, "partial utterance dropped while bot speaks");
                    }
                    was_muted = true;
                }
                CaptureDiagnostics::bump(&self.diagnostics.frames_muted);
                continue;
            }
            was_muted = false;

            let epoch = self.control.epoch();
            if epoch != seen_epoch {
                self.assembler.reset_inactivity();
                seen_epoch = epoch;
            }

            let decision = self.gate.classify(&frame);
            CaptureDiagnostics::bump(&self.diagnostics.vad_frames);
            if decision.is_speech() {
                CaptureDiagnostics::bump(&self.diagnostics.vad_speech);
            }
            if decision.degraded {
                CaptureDiagnostics::bump(&self.diagnostics.classifier_degraded);
                let total = self.gate.degraded_count();
                if total == 1 || total % DEGRADED_REPORT_EVERY == 0 {
                    self.send(CaptureEvent::Degraded {
                        seq: frame.seq,
                        total,
                    });
                }
            }

            let event = if self.control.is_busy() {
                self.assembler.push_held(frame, decision.is_speech())
            } else {
                self.assembler.push(frame, decision.is_speech())
            };

            let Some(event) = event else { continue };
            let keep_going = match event {
                AssemblerEvent::SpeechStarted { seq } => {
                    self.send(CaptureEvent::SpeechStarted { seq })
                }
                AssemblerEvent::Utterance(utterance) => {
                    self.control.hold();
                    CaptureDiagnostics::bump(&self.diagnostics.utterances_emitted);
                    self.send(CaptureEvent::Utterance(utterance))
                }
                AssemblerEvent::Discarded { frames } => {
                    CaptureDiagnostics::bump(&self.diagnostics.utterances_discarded);
                    self.send(CaptureEvent::Discarded { frames })
                }
                AssemblerEvent::StillThere => {
                    self.control.hold();
                    self.send(CaptureEvent::StillThere)
                }
                AssemblerEvent::EndOfCall => {
                    self.send(CaptureEvent::EndOfCall);
                    false
                }
            };
            if !keep_going {
                break;
            }
        }

        let stats = self.diagnostics.snapshot();
        info!(
            frames_in = stats.frames_in,
            frames_muted = stats.frames_muted,
            vad_speech = stats.vad_speech,
            degraded = stats.classifier_degraded,
            utterances = stats.utterances_emitted,
            discarded = stats.utterances_discarded,
            "capture stopped"
        );
    }

    /// Returns `false` once the orchestrator is gone.
    fn send(&self, event: CaptureEvent) -> bool {
        if self.events.send(event).is_err() {
            if !self.control.is_stopped() {
                warn!("orchestrator dropped the capture channel");
            }
            return false;
        }
        true
    }
}
