//! # Audio Capture Pipeline
//!
//! Owns the microphone track and turns the blocks it delivers into outbound
//! `audio` messages.
//!
//! ## Flow:
//! microphone → [`FrameBuffer`] (channel 0, fixed frames) → [`FrameProcessor`]
//! → base64 → `audio` message
//!
//! ## Gating:
//! Frames are always processed, so the compressor envelope stays continuous.
//! They are only emitted when the user is not muted and the transport is open;
//! muting never stops the microphone, so unmuting needs no new permission.

use super::buffer::{FrameBuffer, FrameBufferConfig};
use super::device::{DeviceInventory, DeviceKind};
use super::processor::{encode_frame_base64, FrameProcessor};
use crate::config::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::media::{AudioCaptureRequest, BlockSink, CapturedBlock, MediaDevices, MediaTrack};
use crate::protocol::SignalMessage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Text shown when the microphone cannot be opened.
pub const MICROPHONE_FAILURE: &str =
    "Failed to access microphone. Please make sure you have granted microphone permissions.";

/// Text used when the selected input is not among the enumerated devices.
pub const DEVICE_NOT_FOUND: &str = "Selected audio device not found";

/// Result of feeding one captured block through the pipeline.
#[derive(Debug, Default)]
pub struct CaptureBatch {
    /// Ready-to-send `audio` messages
    pub frames: Vec<SignalMessage>,
    /// Frames withheld because the user is muted
    pub muted: usize,
    /// Frames withheld because the transport is not open
    pub offline: usize,
}

struct ActiveCapture {
    track: Box<dyn MediaTrack>,
    generation: u64,
    device_id: String,
    buffer: FrameBuffer,
    processor: FrameProcessor,
}

/// Microphone lifecycle plus the per-frame processing.
pub struct AudioCapture {
    config: AudioConfig,
    sink: mpsc::UnboundedSender<CapturedBlock>,
    active: Option<ActiveCapture>,
    generation: u64,
}

impl AudioCapture {
    pub fn new(config: AudioConfig, sink: mpsc::UnboundedSender<CapturedBlock>) -> Self {
        Self {
            config,
            sink,
            active: None,
            generation: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Generation of the running stream, if any.
    pub fn generation(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.generation)
    }

    pub fn device_id(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.device_id.as_str())
    }

    /// Enumerate devices, resolve the selected input and open it.
    ///
    /// Any previous stream is stopped first.
    ///
    /// ## Errors:
    /// - `Device(DEVICE_NOT_FOUND)` when the selection is missing from the enumeration
    /// - whatever the backend reports when opening fails
    pub fn start(&mut self, devices: &mut dyn MediaDevices, inventory: &mut DeviceInventory) -> VoiceResult<()> {
        self.stop();

        inventory.update(devices.enumerate()?);
        let device = inventory
            .selected_device(DeviceKind::Input)
            .ok_or_else(|| VoiceError::Device(DEVICE_NOT_FOUND.to_string()))?;
        let device_id = device.id.clone();

        let request = AudioCaptureRequest {
            device_id: device_id.clone(),
            sample_rate: self.config.capture_sample_rate,
            channels: self.config.capture_channels,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        };

        self.generation += 1;
        let track = devices.open_microphone(&request, BlockSink::new(self.sink.clone(), self.generation))?;
        info!(
            device = %device_id,
            label = track.label(),
            sample_rate = request.sample_rate,
            generation = self.generation,
            "Microphone capture started"
        );

        self.active = Some(ActiveCapture {
            track,
            generation: self.generation,
            device_id,
            buffer: FrameBuffer::new(FrameBufferConfig {
                frame_size: self.config.frame_size,
                channels: self.config.capture_channels,
                ..FrameBufferConfig::default()
            }),
            processor: FrameProcessor::new(self.config.capture_sample_rate),
        });
        Ok(())
    }

    /// Stop the microphone. Returns true if a stream was running.
    pub fn stop(&mut self) -> bool {
        match self.active.take() {
            Some(mut active) => {
                active.track.stop();
                if active.buffer.dropped_samples() > 0 {
                    warn!(dropped = active.buffer.dropped_samples(), "Capture backlog overflowed");
                }
                debug!(generation = active.generation, "Microphone capture stopped");
                true
            }
            None => false,
        }
    }

    /// Feed one block and collect the frames it completes.
    pub fn process(&mut self, block: &CapturedBlock, muted: bool, transport_open: bool) -> CaptureBatch {
        let mut batch = CaptureBatch::default();
        let Some(active) = self.active.as_mut() else {
            return batch;
        };
        if block.generation != active.generation {
            debug!(
                block = block.generation,
                current = active.generation,
                "Dropping block from a stopped capture stream"
            );
            return batch;
        }

        active.buffer.push_interleaved(&block.samples, block.channels);
        while let Some(frame) = active.buffer.next_frame() {
            let pcm = active.processor.process(&frame);
            if muted {
                batch.muted += 1;
            } else if !transport_open {
                batch.offline += 1;
            } else {
                batch.frames.push(SignalMessage::Audio {
                    data: encode_frame_base64(&pcm),
                    timestamp: Some(chrono::Utc::now().timestamp_millis()),
                });
            }
        }
        batch
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
