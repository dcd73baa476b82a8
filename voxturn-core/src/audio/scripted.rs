//! Scripted input and recording output for simulations and tests.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{FrameSource, Player};
use crate::buffering::frame::{AudioClip, Frame, FrameSpec};
use crate::error::{Result, VoxturnError};

/// Amplitude of a default speech frame.
pub const SPEECH_LEVEL: f32 = 0.5;

#[derive(Debug, Clone)]
enum Segment {
    Level { amplitude: f32, frames: usize },
    Fail(String),
}

/// Frames from a fixed script of constant-amplitude segments.
///
/// With the energy classifier, any non-zero level well above the noise gate
/// reads as speech and `0.0` as silence.
#[derive(Debug, Clone)]
pub struct ScriptedFrameSource {
    spec: FrameSpec,
    script: VecDeque<Segment>,
    next_seq: u64,
    pace: Option<Duration>,
    then_silence: bool,
}

impl ScriptedFrameSource {
    pub fn new(spec: FrameSpec) -> Self {
        Self {
            spec,
            script: VecDeque::new(),
            next_seq: 0,
            pace: None,
            then_silence: false,
        }
    }

    pub fn speech(self, frames: usize) -> Self {
        self.level(SPEECH_LEVEL, frames)
    }

    pub fn silence(self, frames: usize) -> Self {
        self.level(0.0, frames)
    }

    /// Frames at a given constant amplitude.
    pub fn level(mut self, amplitude: f32, frames: usize) -> Self {
        self.script.push_back(Segment::Level { amplitude, frames });
        self
    }

    /// Report a device error once the script reaches this point.
    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.script.push_back(Segment::Fail(message.into()));
        self
    }

    /// Yield silence forever once the script is exhausted.
    pub fn then_silence(mut self) -> Self {
        self.then_silence = true;
        self
    }

    /// Sleep this long before each frame.
    pub fn paced(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    fn next_amplitude(&mut self) -> Result<Option<f32>> {
        loop {
            match self.script.front_mut() {
                Some(Segment::Level { frames: 0, .. }) => {
                    self.script.pop_front();
                }
                Some(Segment::Level { amplitude, frames }) => {
                    *frames -= 1;
                    return Ok(Some(*amplitude));
                }
                Some(Segment::Fail(message)) => {
                    return Err(VoxturnError::AudioDevice(message.clone()));
                }
                None if self.then_silence => return Ok(Some(0.0)),
                None => return Ok(None),
            }
        }
    }
}

impl FrameSource for ScriptedFrameSource {
    fn spec(&self) -> FrameSpec {
        self.spec
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Some(amplitude) = self.next_amplitude()? else {
            return Ok(None);
        };
        if let Some(pace) = self.pace {
            std::thread::sleep(pace);
        }
        let frame = Frame::new(
            self.next_seq,
            vec![amplitude; self.spec.samples_per_frame()],
            self.spec.sample_rate,
        );
        self.next_seq += 1;
        Ok(Some(frame))
    }
}

/// Discards every clip.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPlayer;

#[async_trait]
impl Player for NullPlayer {
    async fn play(&self, _clip: &AudioClip, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }
}

/// Remembers what it was asked to play.
#[derive(Debug, Default)]
pub struct RecordingPlayer {
    played: Mutex<Vec<AudioClip>>,
    delay: Option<Duration>,
    fail_with: Option<String>,
}

impl RecordingPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take this long per clip (cancellable).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every `play` fails as if the output device went away.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_with = Some(message.into());
        self
    }

    pub fn played(&self) -> Vec<AudioClip> {
        self.played.lock().clone()
    }

    pub fn play_count(&self) -> usize {
        self.played.lock().len()
    }
}

#[async_trait]
impl Player for RecordingPlayer {
    async fn play(&self, clip: &AudioClip, cancel: CancellationToken) -> Result<()> {
        if let Some(message) = &self.fail_with {
            return Err(VoxturnError::AudioDevice(message.clone()));
        }
        self.played.lock().push(clip.clone());
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(source: &mut ScriptedFrameSource, n: usize) -> Vec<f32> {
        (0..n)
            .map(|_| source.next_frame().unwrap().unwrap().samples[0])
            .collect()
    }

    #[test]
    fn script_plays_in_order_then_ends() {
        let mut source = ScriptedFrameSource::new(FrameSpec::default())
            .silence(2)
            .speech(1)
            .level(0.3, 1);
        assert_eq!(drain(&mut source, 4), [0.0, 0.0, SPEECH_LEVEL, 0.3]);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn then_silence_never_ends() {
        let mut source = ScriptedFrameSource::new(FrameSpec::default())
            .speech(1)
            .then_silence();
        drain(&mut source, 1);
        assert!(drain(&mut source, 100).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn fail_segment_reports_device_error() {
        let mut source = ScriptedFrameSource::new(FrameSpec::default())
            .speech(1)
            .fail("unplugged");
        drain(&mut source, 1);
        let err = source.next_frame().unwrap_err();
        assert!(err.is_device_error());
    }

    #[test]
    fn sequence_numbers_are_monotonic() {
        let mut source = ScriptedFrameSource::new(FrameSpec::default()).silence(5);
        let seqs: Vec<u64> = (0..5)
            .map(|_| source.next_frame().unwrap().unwrap().seq)
            .collect();
        assert_eq!(seqs, [0, 1, 2, 3, 4]);
    }
}
