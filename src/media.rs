//! # Media Sources
//!
//! The boundary between the controller and the platform's capture devices, plus
//! the start/stop lifecycle of the camera and screen-share tracks.
//!
//! ## Components:
//! - **`MediaDevices`**: enumerates audio devices and opens microphone, camera and
//!   display tracks. Implemented by the cpal backend (`hardware` feature), by
//!   [`HeadlessMedia`] and by test doubles.
//! - **`MediaTrack`**: a live capture; dropping or stopping it releases the device.
//! - **`BlockSink`**: where a microphone track delivers raw interleaved blocks.
//! - **`VisualCapture`**: one optional camera or display track.
//!
//! Video frames are never encoded or sent; only the on/off state travels over
//! the signaling channel.

use crate::audio::device::DeviceDescriptor;
use crate::config::VideoConfig;
use crate::error::{VoiceError, VoiceResult};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Constraints for opening the microphone.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioCaptureRequest {
    pub device_id: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

/// Constraints for opening the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoCaptureRequest {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing_user: bool,
}

impl From<&VideoConfig> for VideoCaptureRequest {
    fn from(config: &VideoConfig) -> Self {
        Self {
            ideal_width: config.ideal_width,
            ideal_height: config.ideal_height,
            facing_user: true,
        }
    }
}

/// A block of interleaved samples from the microphone.
///
/// `generation` identifies the capture stream that produced it; blocks from a
/// stream that has since been stopped are ignored.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedBlock {
    pub generation: u64,
    pub channels: u16,
    pub samples: Vec<f32>,
}

/// Sending half handed to a microphone track.
///
/// Cloneable and `Send` so device callbacks running on audio threads can use it.
#[derive(Debug, Clone)]
pub struct BlockSink {
    tx: mpsc::UnboundedSender<CapturedBlock>,
    generation: u64,
}

impl BlockSink {
    pub fn new(tx: mpsc::UnboundedSender<CapturedBlock>, generation: u64) -> Self {
        Self { tx, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver one block. Returns false once the receiving side is gone.
    pub fn deliver(&self, channels: u16, samples: Vec<f32>) -> bool {
        self.tx
            .send(CapturedBlock {
                generation: self.generation,
                channels,
                samples,
            })
            .is_ok()
    }
}

/// A live capture track.
pub trait MediaTrack {
    fn label(&self) -> &str;

    /// Release the device. Calling it twice is harmless.
    fn stop(&mut self);
}

/// Platform capture devices.
pub trait MediaDevices {
    /// List audio inputs and outputs.
    fn enumerate(&mut self) -> VoiceResult<Vec<DeviceDescriptor>>;

    fn open_microphone(
        &mut self,
        request: &AudioCaptureRequest,
        sink: BlockSink,
    ) -> VoiceResult<Box<dyn MediaTrack>>;

    fn open_camera(&mut self, request: &VideoCaptureRequest) -> VoiceResult<Box<dyn MediaTrack>>;

    fn open_display(&mut self) -> VoiceResult<Box<dyn MediaTrack>>;
}

/// Backend for machines without capture hardware: nothing to enumerate and
/// every open fails with a device error.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeadlessMedia;

impl MediaDevices for HeadlessMedia {
    fn enumerate(&mut self) -> VoiceResult<Vec<DeviceDescriptor>> {
        Ok(Vec::new())
    }

    fn open_microphone(
        &mut self,
        request: &AudioCaptureRequest,
        _sink: BlockSink,
    ) -> VoiceResult<Box<dyn MediaTrack>> {
        Err(VoiceError::Device(format!(
            "No audio input available for device '{}'",
            request.device_id
        )))
    }

    fn open_camera(&mut self, _request: &VideoCaptureRequest) -> VoiceResult<Box<dyn MediaTrack>> {
        Err(VoiceError::Device("No camera available".to_string()))
    }

    fn open_display(&mut self) -> VoiceResult<Box<dyn MediaTrack>> {
        Err(VoiceError::Device("Screen capture is not supported on this platform".to_string()))
    }
}

/// Which visual source a [`VisualCapture`] manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualSource {
    Camera,
    Screen,
}

impl VisualSource {
    /// User-facing text when the source cannot be opened.
    pub fn failure_message(&self) -> &'static str {
        match self {
            VisualSource::Camera => {
                "Failed to access camera. Please make sure you have granted camera permissions."
            }
            VisualSource::Screen => "Failed to start screen sharing.",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            VisualSource::Camera => "camera",
            VisualSource::Screen => "screen share",
        }
    }
}

/// At most one live camera or display track.
pub struct VisualCapture {
    source: VisualSource,
    track: Option<Box<dyn MediaTrack>>,
}

impl VisualCapture {
    pub fn new(source: VisualSource) -> Self {
        Self { source, track: None }
    }

    pub fn source(&self) -> VisualSource {
        self.source
    }

    pub fn is_active(&self) -> bool {
        self.track.is_some()
    }

    /// Open the source unless it is already running.
    pub fn start(&mut self, devices: &mut dyn MediaDevices, video: &VideoConfig) -> VoiceResult<()> {
        if self.track.is_some() {
            return Ok(());
        }

        let track = match self.source {
            VisualSource::Camera => devices.open_camera(&VideoCaptureRequest::from(video))?,
            VisualSource::Screen => devices.open_display()?,
        };
        info!(source = self.source.name(), label = track.label(), "Capture started");
        self.track = Some(track);
        Ok(())
    }

    /// Stop the track. Returns true if one was running.
    pub fn stop(&mut self) -> bool {
        match self.track.take() {
            Some(mut track) => {
                track.stop();
                debug!(source = self.source.name(), "Capture stopped");
                true
            }
            None => false,
        }
    }
}

impl Drop for VisualCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
