//! Typed audio units passed between capture, segmentation, the turn pipeline
//! and playback.

use std::sync::Arc;
use std::time::Duration;

/// Fixed frame geometry shared by every component of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    /// Sample rate in Hz. Default: 16000.
    pub sample_rate: u32,
    /// Frame duration in milliseconds. Default: 30.
    pub frame_ms: u32,
}

impl FrameSpec {
    pub const fn new(sample_rate: u32, frame_ms: u32) -> Self {
        Self {
            sample_rate,
            frame_ms,
        }
    }

    /// Number of mono samples in one frame (480 at 16 kHz / 30 ms).
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_ms as u64)
    }

    /// Convert a duration to a frame count, rounding up so a configured
    /// timeout is never cut short.
    pub fn frames_for(&self, duration: Duration) -> u32 {
        let frame_ms = self.frame_ms.max(1) as u128;
        let ms = duration.as_millis();
        ms.div_ceil(frame_ms).min(u32::MAX as u128) as u32
    }
}

impl Default for FrameSpec {
    fn default() -> Self {
        Self::new(16_000, 30)
    }
}

/// One fixed-duration slice of mono PCM. Immutable once produced.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic index assigned by the frame source.
    pub seq: u64,
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl Frame {
    pub fn new(seq: u64, samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            seq,
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Raw 16-bit little-endian PCM, for classifiers that consume bytes.
    pub fn to_pcm16_le(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for sample in self.samples.iter() {
            let v = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A playable (or transcribable) block of mono audio.
///
/// Samples are shared so a clip can be handed to the player while the owning
/// turn moves on to persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Concatenate frames into one contiguous clip.
    pub fn from_frames(frames: &[Frame]) -> Self {
        let sample_rate = frames.first().map(|f| f.sample_rate).unwrap_or(16_000);
        let total = frames.iter().map(|f| f.samples.len()).sum();
        let mut samples = Vec::with_capacity(total);
        for frame in frames {
            samples.extend_from_slice(&frame.samples);
        }
        Self::new(samples, sample_rate)
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Encode as a 16-bit mono WAV file in memory.
    pub fn to_wav_bytes(&self) -> Result<Vec<u8>, hound::Error> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
            for sample in self.samples.iter() {
                writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
            }
            writer.finalize()?;
        }
        Ok(cursor.into_inner())
    }

    /// Decode a WAV byte buffer, downmixing to mono.
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self, hound::Error> {
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes))?;
        decode_wav(reader)
    }
}

/// Read every sample of a WAV stream as mono f32.
pub(crate) fn decode_wav<R: std::io::Read>(
    mut reader: hound::WavReader<R>,
) -> Result<AudioClip, hound::Error> {
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1) as u32)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(AudioClip::new(samples, spec.sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_spec_is_480_samples() {
        let spec = FrameSpec::default();
        assert_eq!(spec.samples_per_frame(), 480);
        assert_eq!(spec.frame_duration(), Duration::from_millis(30));
    }

    #[test]
    fn frames_for_rounds_up() {
        let spec = FrameSpec::default();
        assert_eq!(spec.frames_for(Duration::from_millis(900)), 30);
        assert_eq!(spec.frames_for(Duration::from_millis(901)), 31);
        assert_eq!(spec.frames_for(Duration::ZERO), 0);
    }

    #[test]
    fn clip_from_frames_concatenates_in_order() {
        let frames = vec![
            Frame::new(0, vec![0.1; 4], 16_000),
            Frame::new(1, vec![0.2; 4], 16_000),
        ];
        let clip = AudioClip::from_frames(&frames);
        assert_eq!(clip.samples.len(), 8);
        assert_eq!(clip.samples[0], 0.1);
        assert_eq!(clip.samples[7], 0.2);
    }

    #[test]
    fn wav_bytes_decode_back_to_same_length() {
        let clip = AudioClip::new(vec![0.25; 1600], 16_000);
        let bytes = clip.to_wav_bytes().expect("encode wav");
        let decoded = AudioClip::from_wav_bytes(&bytes).expect("decode wav");
        assert_eq!(decoded.sample_rate, 16_000);
        assert_eq!(decoded.samples.len(), 1600);
        assert!((decoded.samples[10] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn pcm16_bytes_are_two_per_sample() {
        let frame = Frame::new(3, vec![1.0, -1.0, 0.0], 16_000);
        let bytes = frame.to_pcm16_le();
        assert_eq!(bytes.len(), 6);
        assert_eq!(i16::from_le_bytes([bytes[0], bytes[1]]), i16::MAX);
    }
}
