//! Speaker output via cpal.
//!
//! The output stream is `!Send`, so each clip is played from a
//! `spawn_blocking` thread that opens the device, feeds the clip through the
//! callback and drops the stream before returning.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, StreamConfig,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::resample::RateConverter;
use super::Player;
use crate::buffering::frame::AudioClip;
use crate::error::{Result, VoxturnError};

const DONE_POLL: Duration = Duration::from_millis(10);

/// Plays clips on the default (or named) output device.
#[derive(Debug, Clone, Default)]
pub struct CpalPlayer {
    output_device: Option<String>,
}

impl CpalPlayer {
    pub fn new(output_device: Option<String>) -> Self {
        Self { output_device }
    }
}

#[async_trait]
impl Player for CpalPlayer {
    async fn play(&self, clip: &AudioClip, cancel: CancellationToken) -> Result<()> {
        if clip.is_empty() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let clip = clip.clone();
        let preferred = self.output_device.clone();
        let thread_stop = Arc::clone(&stop);

        let mut task = tokio::task::spawn_blocking(move || {
            play_blocking(&clip, preferred.as_deref(), &thread_stop)
        });

        tokio::select! {
            res = &mut task => res.map_err(|e| VoxturnError::AudioStream(format!("playback task: {e}")))?,
            _ = cancel.cancelled() => {
                stop.store(true, Ordering::Release);
                debug!("playback cancelled");
                task.await
                    .map_err(|e| VoxturnError::AudioStream(format!("playback task: {e}")))?
            }
        }
    }
}

fn play_blocking(clip: &AudioClip, preferred: Option<&str>, stop: &Arc<AtomicBool>) -> Result<()> {
    let host = cpal::default_host();
    let device = match preferred {
        Some(name) => host
            .output_devices()
            .map_err(|e| VoxturnError::AudioDevice(e.to_string()))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .or_else(|| {
                warn!("preferred output device '{}' not found, falling back", name);
                host.default_output_device()
            }),
        None => host.default_output_device(),
    }
    .ok_or(VoxturnError::NoDefaultOutputDevice)?;

    let supported = device
        .default_output_config()
        .map_err(|e| VoxturnError::AudioDevice(e.to_string()))?;
    let device_rate = supported.sample_rate().0;
    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut converter = RateConverter::new(clip.sample_rate, device_rate, 1024)?;
    let mut samples = converter.process(&clip.samples);
    samples.extend(converter.finish());
    let samples: Arc<[f32]> = samples.into();

    info!(
        device_rate,
        ms = clip.duration().as_millis() as u64,
        "playing clip"
    );

    let cursor = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicBool::new(false));
    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, &samples, &cursor, &failed),
        SampleFormat::I16 => build_output::<i16>(&device, &config, &samples, &cursor, &failed),
        SampleFormat::U16 => build_output::<u16>(&device, &config, &samples, &cursor, &failed),
        fmt => {
            return Err(VoxturnError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }?;
    stream
        .play()
        .map_err(|e| VoxturnError::AudioStream(e.to_string()))?;

    while cursor.load(Ordering::Acquire) < samples.len() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        if failed.load(Ordering::Acquire) {
            return Err(VoxturnError::AudioStream("output stream reported an error".into()));
        }
        std::thread::sleep(DONE_POLL);
    }
    // Let the device drain its last buffer.
    std::thread::sleep(DONE_POLL * 5);
    drop(stream);
    Ok(())
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    samples: &Arc<[f32]>,
    cursor: &Arc<AtomicUsize>,
    failed: &Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let samples = Arc::clone(samples);
    let cursor = Arc::clone(cursor);
    let failed = Arc::clone(failed);

    device
        .build_output_stream(
            config,
            move |out: &mut [T], _info| {
                let mut pos = cursor.load(Ordering::Relaxed);
                for frame in out.chunks_mut(channels) {
                    let value = samples.get(pos).copied().unwrap_or(0.0);
                    pos = (pos + 1).min(samples.len());
                    for slot in frame.iter_mut() {
                        *slot = T::from_sample(value);
                    }
                }
                cursor.store(pos, Ordering::Release);
            },
            move |err| {
                error!("audio output stream error: {err}");
                failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| VoxturnError::AudioStream(e.to_string()))
}
