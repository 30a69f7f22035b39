//! Test doubles for the transport, media devices and audio output.

use crate::audio::device::{DeviceDescriptor, DeviceKind};
use crate::audio::playback::{AudioOutput, PlaybackBuffer};
use crate::error::{VoiceError, VoiceResult};
use crate::media::{AudioCaptureRequest, BlockSink, MediaDevices, MediaTrack, VideoCaptureRequest};
use crate::signaling::Transport;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Default)]
pub struct TransportLog {
    pub open: bool,
    pub sent: Vec<String>,
    pub closed: Option<(u16, String)>,
}

impl TransportLog {
    /// `type` field of every sent message, in order.
    pub fn sent_types(&self) -> Vec<String> {
        self.sent
            .iter()
            .filter_map(|s| serde_json::from_str::<serde_json::Value>(s).ok())
            .filter_map(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
            .collect()
    }

    pub fn sent_json(&self) -> Vec<serde_json::Value> {
        self.sent
            .iter()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect()
    }
}

pub struct FakeTransport {
    log: Rc<RefCell<TransportLog>>,
}

impl FakeTransport {
    pub fn open() -> (Self, Rc<RefCell<TransportLog>>) {
        let log = Rc::new(RefCell::new(TransportLog {
            open: true,
            ..TransportLog::default()
        }));
        (Self { log: log.clone() }, log)
    }
}

impl Transport for FakeTransport {
    fn is_open(&self) -> bool {
        self.log.borrow().open
    }

    fn send_text(&mut self, text: String) -> VoiceResult<()> {
        let mut log = self.log.borrow_mut();
        if !log.open {
            return Err(VoiceError::NotConnected);
        }
        log.sent.push(text);
        Ok(())
    }

    fn close(&mut self, code: u16, reason: &str) {
        let mut log = self.log.borrow_mut();
        log.open = false;
        if log.closed.is_none() {
            log.closed = Some((code, reason.to_string()));
        }
    }
}

#[derive(Debug)]
pub struct MediaLog {
    pub devices: Vec<DeviceDescriptor>,
    pub mic_opens: usize,
    pub camera_opens: usize,
    pub display_opens: usize,
    pub stopped: usize,
    pub deny_microphone: bool,
    pub deny_camera: bool,
    pub deny_display: bool,
    pub last_request: Option<AudioCaptureRequest>,
    pub last_sink: Option<BlockSink>,
}

impl Default for MediaLog {
    fn default() -> Self {
        Self {
            devices: vec![
                DeviceDescriptor::new("mic-1", DeviceKind::Input, "Built-in Microphone"),
                DeviceDescriptor::new("mic-2", DeviceKind::Input, ""),
                DeviceDescriptor::new("spk-1", DeviceKind::Output, "Speakers"),
            ],
            mic_opens: 0,
            camera_opens: 0,
            display_opens: 0,
            stopped: 0,
            deny_microphone: false,
            deny_camera: false,
            deny_display: false,
            last_request: None,
            last_sink: None,
        }
    }
}

pub struct FakeMedia {
    log: Rc<RefCell<MediaLog>>,
}

impl FakeMedia {
    pub fn new() -> (Self, Rc<RefCell<MediaLog>>) {
        let log = Rc::new(RefCell::new(MediaLog::default()));
        (Self { log: log.clone() }, log)
    }
}

struct FakeTrack {
    label: String,
    stopped: bool,
    log: Rc<RefCell<MediaLog>>,
}

impl MediaTrack for FakeTrack {
    fn label(&self) -> &str {
        &self.label
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.log.borrow_mut().stopped += 1;
        }
    }
}

impl MediaDevices for FakeMedia {
    fn enumerate(&mut self) -> VoiceResult<Vec<DeviceDescriptor>> {
        Ok(self.log.borrow().devices.clone())
    }

    fn open_microphone(
        &mut self,
        request: &AudioCaptureRequest,
        sink: BlockSink,
    ) -> VoiceResult<Box<dyn MediaTrack>> {
        let mut log = self.log.borrow_mut();
        if log.deny_microphone {
            return Err(VoiceError::Device("Permission denied".into()));
        }
        log.mic_opens += 1;
        log.last_request = Some(request.clone());
        log.last_sink = Some(sink);
        Ok(Box::new(FakeTrack {
            label: request.device_id.clone(),
            stopped: false,
            log: self.log.clone(),
        }))
    }

    fn open_camera(&mut self, _request: &VideoCaptureRequest) -> VoiceResult<Box<dyn MediaTrack>> {
        let mut log = self.log.borrow_mut();
        if log.deny_camera {
            return Err(VoiceError::Device("Permission denied".into()));
        }
        log.camera_opens += 1;
        Ok(Box::new(FakeTrack {
            label: "camera".into(),
            stopped: false,
            log: self.log.clone(),
        }))
    }

    fn open_display(&mut self) -> VoiceResult<Box<dyn MediaTrack>> {
        let mut log = self.log.borrow_mut();
        if log.deny_display {
            return Err(VoiceError::Device("Permission denied".into()));
        }
        log.display_opens += 1;
        Ok(Box::new(FakeTrack {
            label: "display".into(),
            stopped: false,
            log: self.log.clone(),
        }))
    }
}

/// Output that keeps every buffer it is given.
#[derive(Clone, Default)]
pub struct RecordingOutput {
    played: Rc<RefCell<Vec<PlaybackBuffer>>>,
    selected: Rc<RefCell<Option<String>>>,
}

impl RecordingOutput {
    pub fn buffers(&self) -> Vec<PlaybackBuffer> {
        self.played.borrow().clone()
    }

    pub fn selected(&self) -> Option<String> {
        self.selected.borrow().clone()
    }
}

impl AudioOutput for RecordingOutput {
    fn play(&mut self, buffer: PlaybackBuffer) -> VoiceResult<()> {
        self.played.borrow_mut().push(buffer);
        Ok(())
    }

    fn select_device(&mut self, device_id: Option<&str>) -> VoiceResult<()> {
        *self.selected.borrow_mut() = device_id.map(str::to_string);
        Ok(())
    }
}
