//! Utterance segmentation.
//!
//! ## State machine
//!
//! ```text
//!            speech                 silence
//!   Idle ───────────► Accumulating ─────────► TrailingSilence
//!    ▲                     ▲                       │   │
//!    │                     └──── speech (run = 0) ─┘   │
//!    └──────────── run reaches silence_frames ─────────┘
//!                  (emit Utterance or Discarded)
//!
//!   Idle ── inactive ticks reach hangup_frames ──► Ended (EndOfCall)
//! ```
//!
//! The assembler is driven one frame at a time and never looks at a clock:
//! every duration is a frame count derived from the shared [`FrameSpec`].
//!
//! [`FrameSpec`]: crate::buffering::frame::FrameSpec

pub mod utterance;

use tracing::debug;

use crate::buffering::frame::Frame;

pub use utterance::Utterance;

/// Segmentation thresholds, all expressed in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblerConfig {
    /// Trailing silence run that closes an utterance.
    pub silence_frames: u32,
    /// Utterances shorter than this (after trimming) are dropped as noise.
    pub min_utterance_frames: u32,
    /// Force-emit once an utterance grows this long. `0` disables the cap.
    pub max_utterance_frames: u32,
    /// Idle frames after which the call is considered abandoned.
    pub hangup_frames: u32,
    /// When set, `StillThere` is emitted at `hangup_frames` and `EndOfCall`
    /// only after this many further idle frames.
    pub confirm_frames: Option<u32>,
    /// Trailing silence frames kept at the end of an emitted utterance.
    pub trailing_pad_frames: u32,
}

impl Default for AssemblerConfig {
    /// 30 ms frames: 800 ms silence, 300 ms floor, 30 s cap, 120 s hangup.
    fn default() -> Self {
        Self {
            silence_frames: 27,
            min_utterance_frames: 10,
            max_utterance_frames: 1_000,
            hangup_frames: 4_000,
            confirm_frames: None,
            trailing_pad_frames: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    Accumulating,
    TrailingSilence,
    /// Terminal: end-of-call was signalled.
    Ended,
}

/// Output of [`UtteranceAssembler::push`]. At most one per frame.
#[derive(Debug)]
pub enum AssemblerEvent {
    /// Silence → speech transition.
    SpeechStarted { seq: u64 },
    Utterance(Utterance),
    /// A segment closed below the minimum length.
    Discarded { frames: usize },
    /// Hangup timeout reached with a confirmation window configured.
    StillThere,
    EndOfCall,
}

pub struct UtteranceAssembler {
    config: AssemblerConfig,
    state: AssemblerState,
    buffer: Vec<Frame>,
    silence_run: u32,
    inactive_frames: u32,
    prompted: bool,
}

impl UtteranceAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self {
            config,
            state: AssemblerState::Idle,
            buffer: Vec::new(),
            silence_run: 0,
            inactive_frames: 0,
            prompted: false,
        }
    }

    pub fn state(&self) -> AssemblerState {
        self.state
    }

    pub fn inactive_frames(&self) -> u32 {
        self.inactive_frames
    }

    pub fn buffered_frames(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one classified frame.
    pub fn push(&mut self, frame: Frame, is_speech: bool) -> Option<AssemblerEvent> {
        self.step(frame, is_speech, true)
    }

    /// Feed one classified frame without advancing the inactivity counter.
    /// Used while a turn is in flight so the caller is not hung up on while
    /// waiting for the bot.
    pub fn push_held(&mut self, frame: Frame, is_speech: bool) -> Option<AssemblerEvent> {
        self.step(frame, is_speech, false)
    }

    /// Drop any partial utterance and return to `Idle`. Returns the number of
    /// frames discarded.
    pub fn suspend(&mut self) -> usize {
        if self.state == AssemblerState::Ended {
            return 0;
        }
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.silence_run = 0;
        self.state = AssemblerState::Idle;
        dropped
    }

    /// Restart the hangup countdown (a turn completed).
    pub fn reset_inactivity(&mut self) {
        self.inactive_frames = 0;
        self.prompted = false;
    }

    fn step(&mut self, frame: Frame, is_speech: bool, count_idle: bool) -> Option<AssemblerEvent> {
        match (self.state, is_speech) {
            (AssemblerState::Ended, _) => None,

            (AssemblerState::Idle, true) => {
                let seq = frame.seq;
                self.buffer.push(frame);
                self.state = AssemblerState::Accumulating;
                self.silence_run = 0;
                self.reset_inactivity();
                self.check_cap().or(Some(AssemblerEvent::SpeechStarted { seq }))
            }

            (AssemblerState::Idle, false) => {
                if count_idle {
                    self.tick_idle()
                } else {
                    None
                }
            }

            (AssemblerState::Accumulating, true) => {
                self.buffer.push(frame);
                self.check_cap()
            }

            (AssemblerState::Accumulating, false) => {
                self.buffer.push(frame);
                self.silence_run = 1;
                self.state = AssemblerState::TrailingSilence;
                self.close_if_silent_enough()
            }

            (AssemblerState::TrailingSilence, true) => {
                self.buffer.push(frame);
                self.silence_run = 0;
                self.state = AssemblerState::Accumulating;
                self.check_cap()
            }

            (AssemblerState::TrailingSilence, false) => {
                self.buffer.push(frame);
                self.silence_run += 1;
                self.close_if_silent_enough()
            }
        }
    }

    fn tick_idle(&mut self) -> Option<AssemblerEvent> {
        self.inactive_frames = self.inactive_frames.saturating_add(1);
        let hangup = self.config.hangup_frames;
        let inactive = self.inactive_frames;

        match self.config.confirm_frames {
            Some(confirm) if confirm > 0 => {
                if !self.prompted && inactive >= hangup {
                    self.prompted = true;
                    debug!(inactive_frames = inactive, "inactivity: still-there check");
                    return Some(AssemblerEvent::StillThere);
                }
                if inactive >= hangup.saturating_add(confirm) {
                    return self.end_call();
                }
                None
            }
            _ if inactive >= hangup => self.end_call(),
            _ => None,
        }
    }

    fn end_call(&mut self) -> Option<AssemblerEvent> {
        debug!(inactive_frames = self.inactive_frames, "inactivity: end of call");
        self.state = AssemblerState::Ended;
        self.buffer.clear();
        Some(AssemblerEvent::EndOfCall)
    }

    fn close_if_silent_enough(&mut self) -> Option<AssemblerEvent> {
        if self.silence_run >= self.config.silence_frames {
            Some(self.finish())
        } else {
            self.check_cap()
        }
    }

    fn check_cap(&mut self) -> Option<AssemblerEvent> {
        let cap = self.config.max_utterance_frames;
        if cap > 0 && self.buffer.len() >= cap as usize {
            debug!(frames = self.buffer.len(), "utterance reached max length, forcing emit");
            Some(self.finish())
        } else {
            None
        }
    }

    /// Close the current segment: trim trailing silence down to the pad,
    /// apply the length floor, return to `Idle`.
    fn finish(&mut self) -> AssemblerEvent {
        let trim = self
            .silence_run
            .saturating_sub(self.config.trailing_pad_frames) as usize;
        let keep = self.buffer.len().saturating_sub(trim);
        self.buffer.truncate(keep);

        let frames = std::mem::take(&mut self.buffer);
        self.silence_run = 0;
        self.state = AssemblerState::Idle;

        if frames.len() < self.config.min_utterance_frames as usize {
            return AssemblerEvent::Discarded {
                frames: frames.len(),
            };
        }
        let len = frames.len();
        match Utterance::from_frames(frames) {
            Some(utterance) => AssemblerEvent::Utterance(utterance),
            None => AssemblerEvent::Discarded { frames: len },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Feed {
        assembler: UtteranceAssembler,
        seq: u64,
        events: Vec<AssemblerEvent>,
    }

    impl Feed {
        fn new(config: AssemblerConfig) -> Self {
            Self {
                assembler: UtteranceAssembler::new(config),
                seq: 0,
                events: Vec::new(),
            }
        }

        fn run(&mut self, is_speech: bool, count: usize) -> &mut Self {
            for _ in 0..count {
                let frame = Frame::new(self.seq, vec![0.0; 480], 16_000);
                self.seq += 1;
                if let Some(ev) = self.assembler.push(frame, is_speech) {
                    self.events.push(ev);
                }
            }
            self
        }

        fn utterances(&self) -> Vec<&Utterance> {
            self.events
                .iter()
                .filter_map(|e| match e {
                    AssemblerEvent::Utterance(u) => Some(u),
                    _ => None,
                })
                .collect()
        }
    }

    fn config(silence: u32, min: u32) -> AssemblerConfig {
        AssemblerConfig {
            silence_frames: silence,
            min_utterance_frames: min,
            max_utterance_frames: 0,
            hangup_frames: 10_000,
            confirm_frames: None,
            trailing_pad_frames: 0,
        }
    }

    #[test]
    fn example_scenario_yields_one_twenty_frame_utterance() {
        let mut feed = Feed::new(config(30, 10));
        feed.run(false, 5).run(true, 20).run(false, 40);

        let utterances = feed.utterances();
        assert_eq!(utterances.len(), 1);
        assert_eq!(utterances[0].len(), 20);
        assert_eq!(utterances[0].first_seq(), 5);
        assert_eq!(utterances[0].last_seq(), 24);
        assert!(matches!(
            feed.events[0],
            AssemblerEvent::SpeechStarted { seq: 5 }
        ));
        assert_eq!(feed.assembler.state(), AssemblerState::Idle);
        // The 10 frames after the boundary started the hangup countdown.
        assert_eq!(feed.assembler.inactive_frames(), 10);
    }

    #[test]
    fn short_segments_never_emitted() {
        for speech in 1..10 {
            let mut feed = Feed::new(config(5, 10));
            feed.run(true, speech).run(false, 5);
            assert!(feed.utterances().is_empty(), "speech={speech}");
            assert!(feed
                .events
                .iter()
                .any(|e| matches!(e, AssemblerEvent::Discarded { frames } if *frames == speech)));
        }
    }

    #[test]
    fn floor_applies_after_trimming() {
        let mut feed = Feed::new(AssemblerConfig {
            trailing_pad_frames: 2,
            ..config(5, 10)
        });
        // 7 speech + 2 kept pad frames = 9 < 10
        feed.run(true, 7).run(false, 5);
        assert!(feed.utterances().is_empty());

        let mut feed = Feed::new(AssemblerConfig {
            trailing_pad_frames: 2,
            ..config(5, 10)
        });
        feed.run(true, 8).run(false, 5);
        assert_eq!(feed.utterances()[0].len(), 10);
    }

    #[test]
    fn pauses_shorter_than_threshold_are_absorbed() {
        for pause in 1..30 {
            let mut feed = Feed::new(config(30, 10));
            feed.run(true, 12).run(false, pause).run(true, 12).run(false, 30);
            let utterances = feed.utterances();
            assert_eq!(utterances.len(), 1, "pause={pause}");
            assert_eq!(utterances[0].len(), 24 + pause);
        }
    }

    #[test]
    fn absorbed_pause_resets_silence_run() {
        let mut feed = Feed::new(config(10, 1));
        // 9 + 9 silent frames would exceed 10 if the run were only paused.
        feed.run(true, 3).run(false, 9).run(true, 1).run(false, 9);
        assert!(feed.utterances().is_empty());
        assert_eq!(feed.assembler.state(), AssemblerState::TrailingSilence);
        feed.run(false, 1);
        assert_eq!(feed.utterances().len(), 1);
    }

    #[test]
    fn pause_at_threshold_splits() {
        let mut feed = Feed::new(config(30, 10));
        feed.run(true, 12).run(false, 30).run(true, 12).run(false, 30);
        assert_eq!(feed.utterances().len(), 2);
    }

    #[test]
    fn hangup_after_exact_inactivity() {
        let mut feed = Feed::new(AssemblerConfig {
            hangup_frames: 50,
            ..config(30, 10)
        });
        feed.run(false, 49);
        assert!(feed.events.is_empty());
        feed.run(false, 1);
        assert!(matches!(feed.events[..], [AssemblerEvent::EndOfCall]));
        assert_eq!(feed.assembler.state(), AssemblerState::Ended);

        // Terminal: nothing further, even for speech.
        feed.run(true, 40).run(false, 40);
        assert_eq!(feed.events.len(), 1);
    }

    #[test]
    fn speech_restarts_inactivity_countdown() {
        let mut feed = Feed::new(AssemblerConfig {
            hangup_frames: 50,
            ..config(5, 1)
        });
        feed.run(false, 45).run(true, 3).run(false, 5);
        assert_eq!(feed.assembler.inactive_frames(), 0);
        feed.run(false, 49);
        assert!(!feed
            .events
            .iter()
            .any(|e| matches!(e, AssemblerEvent::EndOfCall)));
        feed.run(false, 1);
        assert!(matches!(feed.events.last(), Some(AssemblerEvent::EndOfCall)));
    }

    #[test]
    fn still_there_precedes_end_of_call() {
        let mut feed = Feed::new(AssemblerConfig {
            hangup_frames: 20,
            confirm_frames: Some(10),
            ..config(5, 1)
        });
        feed.run(false, 20);
        assert!(matches!(feed.events[..], [AssemblerEvent::StillThere]));
        feed.run(false, 9);
        assert_eq!(feed.events.len(), 1);
        feed.run(false, 1);
        assert!(matches!(feed.events.last(), Some(AssemblerEvent::EndOfCall)));
    }

    #[test]
    fn speech_after_still_there_rearms_policy() {
        let mut feed = Feed::new(AssemblerConfig {
            hangup_frames: 20,
            confirm_frames: Some(10),
            ..config(5, 1)
        });
        feed.run(false, 25).run(true, 3).run(false, 5);
        feed.run(false, 20);
        let still_there = feed
            .events
            .iter()
            .filter(|e| matches!(e, AssemblerEvent::StillThere))
            .count();
        assert_eq!(still_there, 2);
        assert_ne!(feed.assembler.state(), AssemblerState::Ended);
    }

    #[test]
    fn held_frames_do_not_advance_inactivity() {
        let mut assembler = UtteranceAssembler::new(AssemblerConfig {
            hangup_frames: 5,
            ..config(5, 1)
        });
        for seq in 0..100 {
            let ev = assembler.push_held(Frame::new(seq, vec![0.0; 480], 16_000), false);
            assert!(ev.is_none());
        }
        assert_eq!(assembler.inactive_frames(), 0);
        assert_eq!(assembler.state(), AssemblerState::Idle);
    }

    #[test]
    fn max_cap_forces_emit() {
        let mut feed = Feed::new(AssemblerConfig {
            max_utterance_frames: 50,
            ..config(30, 10)
        });
        feed.run(true, 120);
        let utterances = feed.utterances();
        assert_eq!(utterances.len(), 2);
        assert!(utterances.iter().all(|u| u.len() == 50));
        assert_eq!(feed.assembler.buffered_frames(), 20);
    }

    #[test]
    fn suspend_drops_partial_utterance() {
        let mut feed = Feed::new(config(30, 10));
        feed.run(true, 15);
        assert_eq!(feed.assembler.suspend(), 15);
        assert_eq!(feed.assembler.state(), AssemblerState::Idle);
        feed.run(false, 40);
        assert!(feed.utterances().is_empty());
    }
}
