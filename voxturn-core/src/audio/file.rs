//! WAV file adapters for offline calls.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::resample::RateConverter;
use super::{FrameSource, Player};
use crate::buffering::frame::{decode_wav, AudioClip, Frame, FrameSpec};
use crate::error::{Result, VoxturnError};

/// Frames read from a WAV file, resampled and downmixed to the frame spec.
pub struct WavFrameSource {
    samples: Vec<f32>,
    spec: FrameSpec,
    cursor: usize,
    next_seq: u64,
    /// Sleep one frame duration per frame (simulate a live device).
    paced: bool,
    /// Keep yielding silence after the file ends instead of reporting EOF.
    hold_open: bool,
}

impl WavFrameSource {
    pub fn open(path: impl AsRef<Path>, spec: FrameSpec) -> Result<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path)?;
        let clip = decode_wav(reader)?;
        info!(
            path = %path.display(),
            source_rate = clip.sample_rate,
            ms = clip.duration().as_millis() as u64,
            "opened wav input"
        );
        Self::from_clip(&clip, spec)
    }

    pub fn from_clip(clip: &AudioClip, spec: FrameSpec) -> Result<Self> {
        let mut converter = RateConverter::new(clip.sample_rate, spec.sample_rate, 1024)?;
        let mut samples = converter.process(&clip.samples);
        samples.extend(converter.finish());
        Ok(Self {
            samples,
            spec,
            cursor: 0,
            next_seq: 0,
            paced: false,
            hold_open: false,
        })
    }

    pub fn paced(mut self, paced: bool) -> Self {
        self.paced = paced;
        self
    }

    pub fn hold_open(mut self, hold_open: bool) -> Self {
        self.hold_open = hold_open;
        self
    }
}

impl FrameSource for WavFrameSource {
    fn spec(&self) -> FrameSpec {
        self.spec
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame_len = self.spec.samples_per_frame();
        let remaining = self.samples.len().saturating_sub(self.cursor);
        if remaining == 0 && !self.hold_open {
            debug!(frames = self.next_seq, "wav input exhausted");
            return Ok(None);
        }

        let mut samples = vec![0.0; frame_len];
        let take = remaining.min(frame_len);
        samples[..take].copy_from_slice(&self.samples[self.cursor..self.cursor + take]);
        self.cursor += take;

        if self.paced {
            std::thread::sleep(self.spec.frame_duration());
        }
        let frame = Frame::new(self.next_seq, samples, self.spec.sample_rate);
        self.next_seq += 1;
        Ok(Some(frame))
    }
}

/// Writes each played clip to `<dir>/reply-NNN.wav`.
pub struct WavPlayer {
    dir: PathBuf,
    count: AtomicU32,
    /// Wait the clip's duration before returning, like a speaker would.
    realtime: bool,
}

impl WavPlayer {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            count: AtomicU32::new(0),
            realtime: false,
        })
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn clips_written(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Player for WavPlayer {
    async fn play(&self, clip: &AudioClip, cancel: CancellationToken) -> Result<()> {
        let n = self.count.fetch_add(1, Ordering::AcqRel);
        let path = self.dir.join(format!("reply-{n:03}.wav"));
        let bytes = clip.to_wav_bytes()?;
        tokio::fs::write(&path, bytes).await?;
        info!(path = %path.display(), "reply written");

        if self.realtime {
            tokio::select! {
                _ = tokio::time::sleep(clip.duration()) => {}
                _ = cancel.cancelled() => {}
            }
        }
        Ok(())
    }
}

/// Read a whole WAV file as one clip.
pub fn read_wav(path: impl AsRef<Path>) -> Result<AudioClip> {
    let reader = hound::WavReader::open(path.as_ref())?;
    decode_wav(reader).map_err(VoxturnError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_padded_and_then_end() {
        let clip = AudioClip::new(vec![0.5; 1000], 16_000);
        let mut source = WavFrameSource::from_clip(&clip, FrameSpec::default()).unwrap();
        let a = source.next_frame().unwrap().unwrap();
        let b = source.next_frame().unwrap().unwrap();
        let c = source.next_frame().unwrap().unwrap();
        assert_eq!((a.seq, b.seq, c.seq), (0, 1, 2));
        assert_eq!(c.samples.len(), 480);
        assert_eq!(c.samples[39], 0.5);
        assert_eq!(c.samples[40], 0.0);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn hold_open_yields_silence_after_end() {
        let clip = AudioClip::new(vec![0.5; 480], 16_000);
        let mut source = WavFrameSource::from_clip(&clip, FrameSpec::default())
            .unwrap()
            .hold_open(true);
        source.next_frame().unwrap();
        for _ in 0..5 {
            let frame = source.next_frame().unwrap().unwrap();
            assert!(frame.samples.iter().all(|s| *s == 0.0));
        }
    }

    #[tokio::test]
    async fn player_writes_numbered_files() {
        let dir = std::env::temp_dir().join(format!("voxturn-wav-{}", uuid::Uuid::new_v4()));
        let player = WavPlayer::new(&dir).unwrap();
        let clip = AudioClip::new(vec![0.1; 800], 16_000);
        player.play(&clip, CancellationToken::new()).await.unwrap();
        player.play(&clip, CancellationToken::new()).await.unwrap();
        assert_eq!(player.clips_written(), 2);
        let back = read_wav(dir.join("reply-001.wav")).unwrap();
        assert_eq!(back.samples.len(), 800);
        let _ = std::fs::remove_dir_all(dir);
    }
}
