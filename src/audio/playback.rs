//! # Audio Playback Pipeline
//!
//! Turns received audio frames into buffers for the output device.
//!
//! ## Steps per frame:
//! 1. Decode base64 (JSON `audio`/`echo`) or take the raw bytes (binary frame)
//! 2. Parse little-endian i16 PCM and normalize by 32767
//! 3. Apply gain `volume / 100`, or 0 while deafened
//! 4. Hand the buffer to the [`AudioOutput`]; zero-gain frames are discarded
//!
//! ## Scheduling:
//! In `immediate` mode every frame starts on arrival and overlapping frames mix
//! in the output. In `scheduled` mode frames get consecutive start offsets.

use super::processor::{decode_frame_base64, decode_pcm_le, pcm_to_float};
use crate::config::{AudioConfig, PlaybackMode};
use crate::error::VoiceResult;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Playback volume, 0–100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Volume(u8);

impl Volume {
    pub const MAX: Volume = Volume(100);

    /// Values above 100 are clamped.
    pub fn new(value: u8) -> Self {
        Self(value.min(100))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    /// Linear gain factor in [0, 1].
    pub fn gain(&self) -> f32 {
        self.0 as f32 / 100.0
    }
}

impl Default for Volume {
    fn default() -> Self {
        Self::MAX
    }
}

/// Gain applied to received audio.
pub fn effective_gain(volume: Volume, deafened: bool) -> f32 {
    if deafened {
        0.0
    } else {
        volume.gain()
    }
}

/// One mono buffer ready for the output device.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    /// Normalized samples before gain
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub gain: f32,
    /// Delay from now before the buffer should start
    pub start_offset: Duration,
}

impl PlaybackBuffer {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.samples.len() as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

/// Output device.
pub trait AudioOutput {
    fn play(&mut self, buffer: PlaybackBuffer) -> VoiceResult<()>;

    /// Route subsequent buffers to another device. `None` means the system default.
    fn select_device(&mut self, _device_id: Option<&str>) -> VoiceResult<()> {
        Ok(())
    }
}

/// Output that accepts and drops every buffer.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessOutput;

impl AudioOutput for HeadlessOutput {
    fn play(&mut self, buffer: PlaybackBuffer) -> VoiceResult<()> {
        debug!(samples = buffer.samples.len(), "Headless output dropped buffer");
        Ok(())
    }
}

/// Start times for `scheduled` mode.
#[derive(Debug, Clone, Default)]
pub struct PlaybackScheduler {
    next_start: Option<Instant>,
}

impl PlaybackScheduler {
    /// Reserve `duration` of output time and return the offset from `now` at
    /// which it begins: `max(now, end of previous buffer)`.
    pub fn schedule(&mut self, now: Instant, duration: Duration) -> Duration {
        let start = match self.next_start {
            Some(next) if next > now => next,
            _ => now,
        };
        self.next_start = Some(start + duration);
        start - now
    }

    pub fn reset(&mut self) {
        self.next_start = None;
    }
}

/// What happened to a received frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PlaybackOutcome {
    Played { samples: usize, gain: f32 },
    /// Gain was zero, nothing was sent to the output
    Discarded,
}

/// Decode → gain → output.
pub struct PlaybackPipeline {
    sample_rate: u32,
    mode: PlaybackMode,
    scheduler: PlaybackScheduler,
    output: Box<dyn AudioOutput>,
}

impl PlaybackPipeline {
    pub fn new(config: &AudioConfig, output: Box<dyn AudioOutput>) -> Self {
        Self {
            sample_rate: config.playback_sample_rate,
            mode: config.playback_mode,
            scheduler: PlaybackScheduler::default(),
            output,
        }
    }

    /// Play a base64 payload from an `audio` or `echo` message.
    pub fn play_encoded(
        &mut self,
        data: &str,
        volume: Volume,
        deafened: bool,
        now: Instant,
    ) -> VoiceResult<PlaybackOutcome> {
        let pcm = decode_frame_base64(data)?;
        self.play_pcm(&pcm, volume, deafened, now)
    }

    /// Play the payload of a binary frame.
    pub fn play_raw(
        &mut self,
        data: &[u8],
        volume: Volume,
        deafened: bool,
        now: Instant,
    ) -> VoiceResult<PlaybackOutcome> {
        let pcm = decode_pcm_le(data)?;
        self.play_pcm(&pcm, volume, deafened, now)
    }

    fn play_pcm(
        &mut self,
        pcm: &[i16],
        volume: Volume,
        deafened: bool,
        now: Instant,
    ) -> VoiceResult<PlaybackOutcome> {
        let gain = effective_gain(volume, deafened);
        if gain <= 0.0 || pcm.is_empty() {
            return Ok(PlaybackOutcome::Discarded);
        }

        let mut buffer = PlaybackBuffer {
            samples: pcm_to_float(pcm),
            sample_rate: self.sample_rate,
            gain,
            start_offset: Duration::ZERO,
        };
        if self.mode == PlaybackMode::Scheduled {
            buffer.start_offset = self.scheduler.schedule(now, buffer.duration());
        }

        let samples = buffer.samples.len();
        self.output.play(buffer)?;
        Ok(PlaybackOutcome::Played { samples, gain })
    }

    pub fn select_output(&mut self, device_id: Option<&str>) -> VoiceResult<()> {
        info!(device = device_id.unwrap_or("default"), "Switching audio output");
        self.output.select_device(device_id)
    }

    /// Forget scheduled start times (teardown).
    pub fn reset(&mut self) {
        self.scheduler.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::encode_frame_base64;
    use crate::config::AppConfig;
    use crate::testing::RecordingOutput;

    fn pipeline(mode: PlaybackMode) -> (PlaybackPipeline, RecordingOutput) {
        let mut config = AppConfig::default().audio;
        config.playback_mode = mode;
        let output = RecordingOutput::default();
        (PlaybackPipeline::new(&config, Box::new(output.clone())), output)
    }

    #[test]
    fn test_volume_scales_gain() {
        let (mut playback, output) = pipeline(PlaybackMode::Immediate);
        let data = encode_frame_base64(&[16384, -16384]);

        let outcome = playback.play_encoded(&data, Volume::new(50), false, Instant::now()).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Played { samples: 2, gain: 0.5 });

        let played = output.buffers();
        assert_eq!(played.len(), 1);
        assert!((played[0].samples[0] - 16384.0 / 32767.0).abs() < 1e-6);
        assert_eq!(played[0].sample_rate, 16_000);
    }

    #[test]
    fn test_deafened_frames_are_discarded() {
        let (mut playback, output) = pipeline(PlaybackMode::Immediate);
        let data = encode_frame_base64(&[1000; 16]);
        let outcome = playback.play_encoded(&data, Volume::MAX, true, Instant::now()).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Discarded);
        assert!(output.buffers().is_empty());
    }

    #[test]
    fn test_zero_volume_discards() {
        let (mut playback, output) = pipeline(PlaybackMode::Immediate);
        let outcome = playback.play_raw(&[0, 1, 0, 1], Volume::new(0), false, Instant::now()).unwrap();
        assert_eq!(outcome, PlaybackOutcome::Discarded);
        assert!(output.buffers().is_empty());
    }

    #[test]
    fn test_odd_binary_frame_is_rejected() {
        let (mut playback, output) = pipeline(PlaybackMode::Immediate);
        let err = playback.play_raw(&[1, 2, 3], Volume::MAX, false, Instant::now()).unwrap_err();
        assert_eq!(err.kind(), "protocol");
        assert!(output.buffers().is_empty());
    }

    #[test]
    fn test_immediate_mode_never_offsets() {
        let (mut playback, output) = pipeline(PlaybackMode::Immediate);
        let now = Instant::now();
        let data = encode_frame_base64(&[100; 1600]);
        playback.play_encoded(&data, Volume::MAX, false, now).unwrap();
        playback.play_encoded(&data, Volume::MAX, false, now).unwrap();
        assert!(output.buffers().iter().all(|b| b.start_offset == Duration::ZERO));
    }

    #[test]
    fn test_scheduled_mode_queues_back_to_back() {
        let (mut playback, output) = pipeline(PlaybackMode::Scheduled);
        let now = Instant::now();
        // 1600 samples at 16 kHz = 100 ms
        let data = encode_frame_base64(&[100; 1600]);
        playback.play_encoded(&data, Volume::MAX, false, now).unwrap();
        playback.play_encoded(&data, Volume::MAX, false, now).unwrap();
        playback
            .play_encoded(&data, Volume::MAX, false, now + Duration::from_secs(1))
            .unwrap();

        let offsets: Vec<_> = output.buffers().iter().map(|b| b.start_offset).collect();
        assert_eq!(offsets, vec![Duration::ZERO, Duration::from_millis(100), Duration::ZERO]);
    }

    #[test]
    fn test_volume_clamps() {
        assert_eq!(Volume::new(250).get(), 100);
        assert_eq!(effective_gain(Volume::new(30), false), 0.3);
        assert_eq!(effective_gain(Volume::new(30), true), 0.0);
    }
}
