//! Live microphone frames via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate on the steady path, block on a lock, or perform
//! I/O. It downmixes into a reused scratch buffer and pushes into the SPSC
//! ring producer, whose `push_slice` is lock-free.
//!
//! The capture thread pulls from the consumer side, resamples to the frame
//! rate and cuts fixed-size frames.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use tracing::{error, info, warn};

use super::resample::RateConverter;
use super::FrameSource;
use crate::buffering::frame::{Frame, FrameSpec};
use crate::buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer, Producer};
use crate::error::{Result, VoxturnError};

/// Sleep between ring polls when no audio is buffered.
const EMPTY_POLL: Duration = Duration::from_millis(5);

/// Samples drained from the ring per poll.
const DRAIN_CHUNK: usize = 960;

/// Blocking frame feed from an input device.
///
/// **Not `Send`**: owns a `cpal::Stream`. Create and drop it on the capture thread.
pub struct CpalFrameSource {
    _stream: Stream,
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    consumer: AudioConsumer,
    converter: RateConverter,
    spec: FrameSpec,
    scratch: Vec<f32>,
    pending: Vec<f32>,
    next_seq: u64,
    stall_timeout: Duration,
}

impl CpalFrameSource {
    /// Open an input device by preferred name, otherwise the default input,
    /// otherwise the first available input.
    pub fn open(spec: FrameSpec, preferred: Option<&str>, stall_timeout: Duration) -> Result<Self> {
        let host = cpal::default_host();
        let device = select_input(&host, preferred)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| VoxturnError::AudioDevice(e.to_string()))?;
        let capture_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(capture_rate, channels, "input config selected");

        let config = StreamConfig {
            channels,
            sample_rate: supported.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let (producer, consumer) = create_audio_ring();
        let running = Arc::new(AtomicBool::new(true));
        let failed = Arc::new(AtomicBool::new(false));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_input::<f32>(&device, &config, producer, &running, &failed)
            }
            SampleFormat::I16 => {
                build_input::<i16>(&device, &config, producer, &running, &failed)
            }
            SampleFormat::U8 => build_input::<u8>(&device, &config, producer, &running, &failed),
            fmt => {
                return Err(VoxturnError::AudioStream(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| VoxturnError::AudioStream(e.to_string()))?;

        let converter = RateConverter::new(capture_rate, spec.sample_rate, DRAIN_CHUNK)?;

        Ok(Self {
            _stream: stream,
            running,
            failed,
            consumer,
            converter,
            spec,
            scratch: vec![0.0; DRAIN_CHUNK],
            pending: Vec::with_capacity(spec.samples_per_frame() * 4),
            next_seq: 0,
            stall_timeout,
        })
    }
}

impl FrameSource for CpalFrameSource {
    fn spec(&self) -> FrameSpec {
        self.spec
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame_len = self.spec.samples_per_frame();
        let mut last_audio = Instant::now();

        while self.pending.len() < frame_len {
            if self.failed.load(Ordering::Acquire) {
                return Err(VoxturnError::AudioStream("input stream reported an error".into()));
            }

            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                let waited = last_audio.elapsed();
                if waited >= self.stall_timeout {
                    return Err(VoxturnError::SourceStalled {
                        waited_ms: waited.as_millis() as u64,
                    });
                }
                std::thread::sleep(EMPTY_POLL);
                continue;
            }

            last_audio = Instant::now();
            let resampled = self.converter.process(&self.scratch[..n]);
            self.pending.extend_from_slice(&resampled);
        }

        let samples: Vec<f32> = self.pending.drain(..frame_len).collect();
        let frame = Frame::new(self.next_seq, samples, self.spec.sample_rate);
        self.next_seq += 1;
        Ok(Some(frame))
    }
}

impl Drop for CpalFrameSource {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

fn select_input(host: &cpal::Host, preferred: Option<&str>) -> Result<cpal::Device> {
    if let Some(preferred_name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                let found = devices.find(|device| {
                    device
                        .name()
                        .map(|name| name == preferred_name)
                        .unwrap_or(false)
                });
                if let Some(device) = found {
                    return Ok(device);
                }
                warn!("preferred input device '{}' not found, falling back", preferred_name);
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    if let Some(default) = host.default_input_device() {
        return Ok(default);
    }

    let mut devices = host
        .input_devices()
        .map_err(|e| VoxturnError::AudioDevice(e.to_string()))?;
    let fallback = devices.next().ok_or(VoxturnError::NoDefaultInputDevice)?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: &Arc<AtomicBool>,
    failed: &Arc<AtomicBool>,
) -> Result<Stream>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let running = Arc::clone(running);
    let failed = Arc::clone(failed);
    let mut mix_buf: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mix_buf.resize(frames, 0.0);
                for (f, out) in mix_buf.iter_mut().enumerate() {
                    let base = f * channels;
                    let sum: f32 = data[base..base + channels]
                        .iter()
                        .map(|s| f32::from_sample(*s))
                        .sum();
                    *out = sum / channels as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!("ring buffer full: dropped {} frames", mix_buf.len() - written);
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
                failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| VoxturnError::AudioStream(e.to_string()))
}
