//! Audio input/output seams.
//!
//! # Frame sources
//!
//! A [`FrameSource`] is a blocking, sequential feed of fixed-size frames. It
//! is built *inside* the capture thread from a [`FrameSourceFactory`], because
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS) and must be created and dropped on the same OS thread.
//!
//! # Devices
//!
//! An [`AudioDeviceProvider`] hands out one [`AudioDevices`] bundle per call.
//! The bundle carries a [`DeviceLease`]; while it is alive no other call can
//! acquire the same devices. The lease is released on drop, so it is also
//! released when a call task unwinds.

pub mod device;
pub mod file;
pub mod resample;
pub mod scripted;

#[cfg(feature = "audio-cpal")]
pub mod capture;
#[cfg(feature = "audio-cpal")]
pub mod playback;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffering::frame::{AudioClip, Frame, FrameSpec};
use crate::error::{Result, VoxturnError};

pub use file::{WavFrameSource, WavPlayer};
pub use scripted::{NullPlayer, RecordingPlayer, ScriptedFrameSource};

#[cfg(feature = "audio-cpal")]
pub use capture::CpalFrameSource;
#[cfg(feature = "audio-cpal")]
pub use playback::CpalPlayer;

/// Sequential feed of frames from one input.
pub trait FrameSource {
    fn spec(&self) -> FrameSpec;

    /// Block until the next frame is available.
    ///
    /// `Ok(None)` means the feed ended (file finished, stream closed).
    /// `Err` means the device is unusable.
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Builds the frame source on the capture thread.
pub type FrameSourceFactory = Box<dyn FnOnce() -> Result<Box<dyn FrameSource>> + Send>;

/// Plays synthesized audio to completion.
#[async_trait]
pub trait Player: Send + Sync {
    /// Returns when playback finished or `cancel` fired.
    async fn play(&self, clip: &AudioClip, cancel: CancellationToken) -> Result<()>;
}

/// Exclusive claim on a device pair. Released on drop.
#[derive(Debug)]
pub struct DeviceLease {
    in_use: Option<Arc<AtomicBool>>,
}

impl DeviceLease {
    /// A lease that guards nothing, for devices that can be shared.
    pub fn unguarded() -> Self {
        Self { in_use: None }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Some(flag) = self.in_use.take() {
            flag.store(false, Ordering::Release);
            debug!("device lease released");
        }
    }
}

/// Tracks whether a device pair is currently leased.
#[derive(Debug, Clone, Default)]
pub struct ExclusiveDevice {
    in_use: Arc<AtomicBool>,
}

impl ExclusiveDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lease(&self) -> Result<DeviceLease> {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| VoxturnError::DeviceBusy)?;
        Ok(DeviceLease {
            in_use: Some(Arc::clone(&self.in_use)),
        })
    }

    pub fn is_leased(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }
}

/// Everything one call needs to hear and speak.
pub struct AudioDevices {
    pub source: FrameSourceFactory,
    pub player: Arc<dyn Player>,
    pub lease: DeviceLease,
}

pub trait AudioDeviceProvider: Send + Sync {
    /// Fails with [`VoxturnError::DeviceBusy`] while another call holds the lease.
    fn acquire(&self, spec: FrameSpec) -> Result<AudioDevices>;
}

type SourceBuilder = dyn Fn(FrameSpec) -> Result<Box<dyn FrameSource>> + Send + Sync;

/// Provider built from a source constructor and a shared player.
///
/// Covers WAV files, scripted simulations and any custom input.
pub struct FactoryDeviceProvider {
    build_source: Arc<SourceBuilder>,
    player: Arc<dyn Player>,
    exclusive: ExclusiveDevice,
}

impl FactoryDeviceProvider {
    pub fn new<F>(build_source: F, player: Arc<dyn Player>) -> Self
    where
        F: Fn(FrameSpec) -> Result<Box<dyn FrameSource>> + Send + Sync + 'static,
    {
        Self {
            build_source: Arc::new(build_source),
            player,
            exclusive: ExclusiveDevice::new(),
        }
    }

    pub fn is_leased(&self) -> bool {
        self.exclusive.is_leased()
    }
}

impl AudioDeviceProvider for FactoryDeviceProvider {
    fn acquire(&self, spec: FrameSpec) -> Result<AudioDevices> {
        let lease = self.exclusive.try_lease()?;
        let build = Arc::clone(&self.build_source);
        Ok(AudioDevices {
            source: Box::new(move || build(spec)),
            player: Arc::clone(&self.player),
            lease,
        })
    }
}

/// Default microphone + speakers via cpal.
#[cfg(feature = "audio-cpal")]
pub struct CpalDeviceProvider {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
    pub stall_timeout: std::time::Duration,
    /// Replaces the cpal output when set.
    player: Option<Arc<dyn Player>>,
    exclusive: ExclusiveDevice,
}

#[cfg(feature = "audio-cpal")]
impl CpalDeviceProvider {
    pub fn new(
        input_device: Option<String>,
        output_device: Option<String>,
        stall_timeout: std::time::Duration,
    ) -> Self {
        Self {
            input_device,
            output_device,
            stall_timeout,
            player: None,
            exclusive: ExclusiveDevice::new(),
        }
    }

    /// Keep the microphone but send replies elsewhere (e.g. WAV files).
    pub fn with_player(mut self, player: Arc<dyn Player>) -> Self {
        self.player = Some(player);
        self
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioDeviceProvider for CpalDeviceProvider {
    fn acquire(&self, spec: FrameSpec) -> Result<AudioDevices> {
        let lease = self.exclusive.try_lease()?;
        let input = self.input_device.clone();
        let stall = self.stall_timeout;
        Ok(AudioDevices {
            source: Box::new(move || {
                let source = CpalFrameSource::open(spec, input.as_deref(), stall)?;
                Ok(Box::new(source) as Box<dyn FrameSource>)
            }),
            player: match &self.player {
                Some(player) => Arc::clone(player),
                None => Arc::new(CpalPlayer::new(self.output_device.clone())),
            },
            lease,
        })
    }
}
