//! # Hardware Audio Backend (cpal)
//!
//! Microphone capture, device enumeration and speaker output on the host's
//! default audio API. Compiled only with the `hardware` feature.
//!
//! ## Notes:
//! - Devices are identified by their cpal name
//! - Output mixes buffers into one queue: a buffer is added sample-by-sample
//!   starting at its start offset, so overlapping buffers sum like independent
//!   sources would
//! - Camera and display capture are not available through cpal

use super::capture::DEVICE_NOT_FOUND;
use super::device::{DeviceDescriptor, DeviceKind};
use super::playback::{AudioOutput, PlaybackBuffer};
use super::processor::resample_linear;
use crate::error::{VoiceError, VoiceResult};
use crate::media::{AudioCaptureRequest, BlockSink, MediaDevices, MediaTrack, VideoCaptureRequest};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

fn device_error(context: &str, err: impl std::fmt::Display) -> VoiceError {
    VoiceError::Device(format!("{}: {}", context, err))
}

/// Enumeration and microphone capture.
pub struct CpalMedia {
    host: cpal::Host,
}

impl CpalMedia {
    pub fn new() -> Self {
        let host = cpal::default_host();
        info!(host = ?host.id(), "Using audio host");
        Self { host }
    }

    fn find_input(&self, id: &str) -> VoiceResult<cpal::Device> {
        if id.is_empty() {
            return self
                .host
                .default_input_device()
                .ok_or_else(|| VoiceError::Device("No default input device available".into()));
        }
        let mut devices = self
            .host
            .input_devices()
            .map_err(|e| device_error("Failed to enumerate input devices", e))?;
        devices
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| VoiceError::Device(DEVICE_NOT_FOUND.into()))
    }
}

impl Default for CpalMedia {
    fn default() -> Self {
        Self::new()
    }
}

struct CpalTrack {
    label: String,
    stream: Option<cpal::Stream>,
}

impl MediaTrack for CpalTrack {
    fn label(&self) -> &str {
        &self.label
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Pausing input stream failed: {}", e);
            }
        }
    }
}

impl MediaDevices for CpalMedia {
    fn enumerate(&mut self) -> VoiceResult<Vec<DeviceDescriptor>> {
        let mut list = Vec::new();

        let inputs = self
            .host
            .input_devices()
            .map_err(|e| device_error("Failed to enumerate input devices", e))?;
        for device in inputs {
            if let Ok(name) = device.name() {
                list.push(DeviceDescriptor::new(name.clone(), DeviceKind::Input, name));
            }
        }

        let outputs = self
            .host
            .output_devices()
            .map_err(|e| device_error("Failed to enumerate output devices", e))?;
        for device in outputs {
            if let Ok(name) = device.name() {
                list.push(DeviceDescriptor::new(name.clone(), DeviceKind::Output, name));
            }
        }

        debug!(count = list.len(), "Enumerated audio devices");
        Ok(list)
    }

    fn open_microphone(
        &mut self,
        request: &AudioCaptureRequest,
        sink: BlockSink,
    ) -> VoiceResult<Box<dyn MediaTrack>> {
        let device = self.find_input(&request.device_id)?;
        let label = device.name().unwrap_or_else(|_| request.device_id.clone());

        let supported = device
            .default_input_config()
            .map_err(|e| device_error("Failed to get default input config", e))?;
        if supported.sample_rate().0 != request.sample_rate {
            warn!(
                device_rate = supported.sample_rate().0,
                requested = request.sample_rate,
                "Input device runs at a different sample rate"
            );
        }

        let channels = supported.channels();
        let config: cpal::StreamConfig = supported.config();
        let err_fn = |err| error!("Audio input stream error: {}", err);

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                let sink = sink.clone();
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        sink.deliver(channels, data.to_vec());
                    },
                    err_fn,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let sink = sink.clone();
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let samples = data.iter().map(|&s| s as f32 / 32768.0).collect();
                        sink.deliver(channels, samples);
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(VoiceError::Device(format!("Unsupported input sample format: {:?}", other)));
            }
        }
        .map_err(|e| device_error("Failed to build input stream", e))?;

        stream
            .play()
            .map_err(|e| device_error("Failed to start input stream", e))?;

        Ok(Box::new(CpalTrack {
            label,
            stream: Some(stream),
        }))
    }

    fn open_camera(&mut self, _request: &VideoCaptureRequest) -> VoiceResult<Box<dyn MediaTrack>> {
        Err(VoiceError::Device("Camera capture is not available on this backend".into()))
    }

    fn open_display(&mut self) -> VoiceResult<Box<dyn MediaTrack>> {
        Err(VoiceError::Device("Screen capture is not available on this backend".into()))
    }
}

type MixQueue = Arc<Mutex<VecDeque<f32>>>;

struct OutputStream {
    stream: cpal::Stream,
    sample_rate: u32,
    queue: MixQueue,
}

/// Speaker output through a single long-lived stream.
pub struct CpalOutput {
    host: cpal::Host,
    device_id: Option<String>,
    active: Option<OutputStream>,
}

impl CpalOutput {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
            device_id: None,
            active: None,
        }
    }

    fn find_output(&self) -> VoiceResult<cpal::Device> {
        match self.device_id.as_deref() {
            None => self
                .host
                .default_output_device()
                .ok_or_else(|| VoiceError::Device("No default output device available".into())),
            Some(id) => {
                let mut devices = self
                    .host
                    .output_devices()
                    .map_err(|e| device_error("Failed to enumerate output devices", e))?;
                devices
                    .find(|d| d.name().map(|n| n == id).unwrap_or(false))
                    .ok_or_else(|| VoiceError::Device(DEVICE_NOT_FOUND.into()))
            }
        }
    }

    fn ensure_stream(&mut self) -> VoiceResult<&OutputStream> {
        if self.active.is_none() {
            self.active = Some(self.open_stream()?);
        }
        self.active
            .as_ref()
            .ok_or_else(|| VoiceError::Internal("Output stream missing".into()))
    }

    fn open_stream(&self) -> VoiceResult<OutputStream> {
        let device = self.find_output()?;
        let supported = device
            .default_output_config()
            .map_err(|e| device_error("Failed to get default output config", e))?;
        let channels = supported.channels() as usize;
        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.config();
        let queue: MixQueue = Arc::new(Mutex::new(VecDeque::new()));
        let err_fn = |err| error!("Audio output stream error: {}", err);

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        fill_frames(data, channels, &queue, |s| s);
                    },
                    err_fn,
                    None,
                )
            }
            cpal::SampleFormat::I16 => {
                let queue = Arc::clone(&queue);
                device.build_output_stream(
                    &config,
                    move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                        fill_frames(data, channels, &queue, |s| (s.clamp(-1.0, 1.0) * 32767.0) as i16);
                    },
                    err_fn,
                    None,
                )
            }
            other => {
                return Err(VoiceError::Device(format!("Unsupported output sample format: {:?}", other)));
            }
        }
        .map_err(|e| device_error("Failed to build output stream", e))?;

        stream
            .play()
            .map_err(|e| device_error("Failed to start output stream", e))?;
        info!(
            device = self.device_id.as_deref().unwrap_or("default"),
            sample_rate,
            channels,
            "Audio output started"
        );

        Ok(OutputStream {
            stream,
            sample_rate,
            queue,
        })
    }
}

impl Default for CpalOutput {
    fn default() -> Self {
        Self::new()
    }
}

/// Pop one mono sample per output frame and copy it to every channel.
fn fill_frames<T: Copy>(data: &mut [T], channels: usize, queue: &MixQueue, convert: impl Fn(f32) -> T) {
    let mut queue = match queue.lock() {
        Ok(q) => q,
        Err(poisoned) => poisoned.into_inner(),
    };
    for frame in data.chunks_mut(channels.max(1)) {
        let value = convert(queue.pop_front().unwrap_or(0.0));
        for slot in frame.iter_mut() {
            *slot = value;
        }
    }
}

/// Add `samples` into `queue` starting at `offset`, extending it as needed.
fn mix_into(queue: &mut VecDeque<f32>, offset: usize, samples: &[f32]) {
    if queue.len() < offset {
        queue.resize(offset, 0.0);
    }
    for (i, sample) in samples.iter().enumerate() {
        let index = offset + i;
        match queue.get_mut(index) {
            Some(slot) => *slot += sample,
            None => queue.push_back(*sample),
        }
    }
}

impl AudioOutput for CpalOutput {
    fn play(&mut self, buffer: PlaybackBuffer) -> VoiceResult<()> {
        let output = self.ensure_stream()?;
        let resampled = resample_linear(&buffer.samples, buffer.sample_rate, output.sample_rate);
        let gained: Vec<f32> = resampled.iter().map(|s| s * buffer.gain).collect();
        let offset = (buffer.start_offset.as_secs_f64() * output.sample_rate as f64) as usize;

        let mut queue = output
            .queue
            .lock()
            .map_err(|_| VoiceError::Internal("Output queue poisoned".into()))?;
        mix_into(&mut queue, offset, &gained);
        Ok(())
    }

    fn select_device(&mut self, device_id: Option<&str>) -> VoiceResult<()> {
        self.device_id = device_id.map(str::to_string);
        if let Some(old) = self.active.take() {
            if let Err(e) = old.stream.pause() {
                debug!("Pausing output stream failed: {}", e);
            }
        }
        self.active = Some(self.open_stream()?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mix_sums_overlapping_buffers() {
        let mut queue = VecDeque::new();
        mix_into(&mut queue, 0, &[0.1, 0.1, 0.1]);
        mix_into(&mut queue, 0, &[0.2, 0.2]);
        mix_into(&mut queue, 5, &[0.5]);
        let values: Vec<f32> = queue.into_iter().collect();
        assert_eq!(values.len(), 6);
        assert!((values[0] - 0.3).abs() < 1e-6);
        assert!((values[2] - 0.1).abs() < 1e-6);
        assert_eq!(values[3], 0.0);
        assert_eq!(values[5], 0.5);
    }

    #[test]
    fn test_fill_duplicates_mono_across_channels() {
        let queue: MixQueue = Arc::new(Mutex::new(VecDeque::from(vec![0.25, 0.5])));
        let mut out = [0.0f32; 6];
        fill_frames(&mut out, 2, &queue, |s| s);
        assert_eq!(out, [0.25, 0.25, 0.5, 0.5, 0.0, 0.0]);
    }
}
