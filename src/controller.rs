//! # Voice Session Controller
//!
//! The state machine behind one voice channel view. It owns the session state,
//! the signaling channel, the capture tracks and the playback pipeline, and is
//! driven entirely from outside:
//!
//! ## Inputs:
//! - user actions (`join`, `toggle_mute`, `change_device`, `leave`, ...)
//! - network results (`on_token_refreshed`, `on_transport_open`, `on_transport_text`, ...)
//! - captured audio blocks (`on_capture_block`)
//! - time (`poll_timers` at or after `next_deadline`)
//!
//! ## Outputs:
//! - state, read through accessors and [`VoiceController::snapshot`]
//! - [`Effect`]s: asynchronous work the runtime must start and report back on
//!
//! Nothing in here blocks or awaits, and every method takes the current
//! `Instant` where timing matters, so the whole lifecycle can be tested with
//! fake transports and synthetic clocks.

use crate::audio::capture::{AudioCapture, MICROPHONE_FAILURE};
use crate::audio::device::{DeviceDescriptor, DeviceInventory, DeviceKind};
use crate::audio::playback::{AudioOutput, PlaybackOutcome, PlaybackPipeline, Volume};
use crate::auth::TokenStore;
use crate::config::AppConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::media::{CapturedBlock, MediaDevices, VisualCapture, VisualSource};
use crate::preview::{is_voice_route, JoinFlow};
use crate::protocol::{Participant, ParticipantId, SignalMessage};
use crate::roster::{Roster, Upsert};
use crate::session::{ConnectionPhase, SessionSnapshot, SessionState};
use crate::signaling::{classify_close, SignalingChannel, TimerEvent, Transport, TIMEOUT_MESSAGE};
use std::collections::VecDeque;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub const AUTH_FAILURE: &str = "Authentication failed. Please log in again.";
pub const JOIN_FAILURE: &str = "Failed to join voice channel. Please try again.";
pub const PREVIEW_FAILURE: &str = "Failed to load channel participants";
pub const DEVICE_LIST_FAILURE: &str = "Failed to load audio devices";
pub const DEVICE_CHANGE_FAILURE: &str = "Failed to change audio device";

/// Asynchronous work requested by the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Load the preview roster; report through `on_preview_loaded`
    FetchParticipants { channel_id: String, token: String },
    /// Refresh the bearer token; report through `on_token_refreshed`
    RefreshToken { request: u64, token: String },
    /// Open the signaling socket; report through `on_transport_open` / `on_transport_closed`
    OpenTransport { attempt: u64, url: String },
}

/// Result of a toggle: the new local state, and whether the server was told.
///
/// The local state changes even when delivery fails.
#[derive(Debug, Clone, PartialEq)]
pub struct Toggled {
    pub enabled: bool,
    pub delivery: VoiceResult<()>,
}

/// Everything that has to be released when the session ends.
struct SessionHandle {
    signaling: SignalingChannel,
    audio: AudioCapture,
    camera: VisualCapture,
    screen: VisualCapture,
}

impl SessionHandle {
    /// Stop capture tracks. Safe to call repeatedly.
    fn stop_media(&mut self) {
        self.audio.stop();
        self.camera.stop();
        self.screen.stop();
    }

    /// Stop media, send `leave`, close the transport and cancel every timer.
    fn teardown(&mut self) -> bool {
        let had_media = self.audio.is_active() || self.camera.is_active() || self.screen.is_active();
        self.audio.stop();
        let had_transport = self.signaling.shutdown();
        self.camera.stop();
        self.screen.stop();
        had_media || had_transport
    }
}

pub struct VoiceController {
    config: AppConfig,
    session: SessionState,
    flow: JoinFlow,
    handle: SessionHandle,
    tokens: TokenStore,
    devices: Box<dyn MediaDevices>,
    inventory: DeviceInventory,
    playback: PlaybackPipeline,
    local_user: Option<ParticipantId>,
    pending_refresh: Option<u64>,
    next_refresh: u64,
    effects: VecDeque<Effect>,
}

impl VoiceController {
    /// ## Parameters:
    /// - **capture_tx**: where microphone blocks are delivered; the runtime
    ///   forwards them to [`VoiceController::on_capture_block`]
    pub fn new(
        config: AppConfig,
        channel_id: impl Into<String>,
        tokens: TokenStore,
        devices: Box<dyn MediaDevices>,
        output: Box<dyn AudioOutput>,
        capture_tx: mpsc::UnboundedSender<CapturedBlock>,
    ) -> Self {
        let local_user = config.auth.user_id.as_deref().map(ParticipantId::from);
        let mut session = SessionState::new(channel_id, Volume::new(config.audio.default_volume));
        session.roster.set_local_user(local_user.clone());
        let handle = SessionHandle {
            signaling: SignalingChannel::new(config.signaling.clone()),
            audio: AudioCapture::new(config.audio.clone(), capture_tx),
            camera: VisualCapture::new(VisualSource::Camera),
            screen: VisualCapture::new(VisualSource::Screen),
        };
        let playback = PlaybackPipeline::new(&config.audio, output);

        Self {
            config,
            session,
            flow: JoinFlow::Idle,
            handle,
            tokens,
            devices,
            inventory: DeviceInventory::new(),
            playback,
            local_user,
            pending_refresh: None,
            next_refresh: 1,
            effects: VecDeque::new(),
        }
    }

    // ---- Accessors ----

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.session.phase()
    }

    pub fn roster(&self) -> &Roster {
        &self.session.roster
    }

    pub fn last_error(&self) -> Option<&str> {
        self.session.last_error()
    }

    pub fn flow(&self) -> &JoinFlow {
        &self.flow
    }

    pub fn inventory(&self) -> &DeviceInventory {
        &self.inventory
    }

    pub fn token(&self) -> &str {
        self.tokens.token()
    }

    pub fn is_transport_open(&self) -> bool {
        self.handle.signaling.is_open()
    }

    pub fn is_capturing_audio(&self) -> bool {
        self.handle.audio.is_active()
    }

    pub fn pending_reconnects(&self) -> usize {
        self.handle.signaling.pending_reconnects()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let phase = self.session.phase();
        SessionSnapshot {
            session_id: self.session.session_id,
            channel_id: self.session.channel_id.clone(),
            status: phase.as_str(),
            is_echo_mode: phase.echo_mode(),
            join_flow: self.flow.as_str(),
            transport_open: self.is_transport_open(),
            is_muted: self.session.is_muted,
            is_deafened: self.session.is_deafened,
            is_video_enabled: self.session.is_video_enabled,
            is_screen_sharing: self.session.is_screen_sharing,
            volume: self.session.volume,
            participants: self.session.roster.to_vec(),
            last_error: self.session.last_error().map(str::to_string),
            selected_input: self.inventory.selected(DeviceKind::Input).map(str::to_string),
            selected_output: self.inventory.selected(DeviceKind::Output).map(str::to_string),
            stats: self.session.stats.clone(),
            uptime_seconds: self.session.uptime_seconds(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Take the effects queued since the last call.
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        self.effects.drain(..).collect()
    }

    /// Earliest timer deadline, if any timer is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.handle.signaling.next_deadline()
    }

    // ---- Join flow ----

    /// Show the preview and request the participant snapshot.
    pub fn open_preview(&mut self) {
        self.flow.begin_preview();
        self.effects.push_back(Effect::FetchParticipants {
            channel_id: self.session.channel_id.clone(),
            token: self.tokens.token().to_string(),
        });
    }

    pub fn on_preview_loaded(&mut self, result: VoiceResult<Vec<Participant>>) {
        match result {
            Ok(list) => {
                let count = list.len();
                if self.flow.set_snapshot(list) {
                    debug!(count, "Preview participants loaded");
                } else {
                    debug!("Preview closed before participants arrived");
                }
            }
            Err(e) => {
                warn!("Error loading channel participants: {}", e);
                self.session.record_error(PREVIEW_FAILURE);
            }
        }
    }

    /// Close the preview and connect. Ignored while a session is already
    /// connecting or connected.
    pub fn join(&mut self) {
        self.flow.join();
        if self.session.phase() != ConnectionPhase::Disconnected {
            debug!(phase = self.session.phase().as_str(), "Join ignored, session already active");
            return;
        }
        self.connect();
    }

    pub fn cancel_preview(&mut self) -> bool {
        self.flow.cancel()
    }

    // ---- Connection ----

    /// Start a connect: refresh the token, then open the socket.
    pub fn connect(&mut self) {
        self.session.set_connecting();
        self.session.clear_error();
        self.session.stats.connect_attempts += 1;

        let request = self.next_refresh;
        self.next_refresh += 1;
        self.pending_refresh = Some(request);

        info!(
            channel_id = %self.session.channel_id,
            attempt = self.session.stats.connect_attempts,
            "Connecting to voice channel"
        );
        self.effects.push_back(Effect::RefreshToken {
            request,
            token: self.tokens.token().to_string(),
        });
    }

    /// Token refresh finished. A failure ends the connect without retrying.
    pub fn on_token_refreshed(&mut self, request: u64, result: VoiceResult<String>, now: Instant) {
        if self.pending_refresh != Some(request) {
            debug!(request, "Ignoring stale token refresh result");
            return;
        }
        self.pending_refresh = None;

        match result {
            Err(e) => {
                error!("Error refreshing token: {}", e);
                self.session.set_disconnected();
                self.session.record_error(AUTH_FAILURE);
            }
            Ok(token) => {
                if let Err(e) = self.tokens.replace(token) {
                    warn!("Refreshed token kept in memory only: {}", e);
                }
                let attempt = self.handle.signaling.begin_attempt(now);
                let url = SignalingChannel::endpoint_url(
                    &self.config.ws_base_url(),
                    &self.session.channel_id,
                    self.tokens.token(),
                );
                self.effects.push_back(Effect::OpenTransport { attempt, url });
            }
        }
    }

    /// The socket for `attempt` opened.
    pub fn on_transport_open(&mut self, attempt: u64, transport: Box<dyn Transport>) {
        if !self.handle.signaling.attach(attempt, transport) {
            return;
        }

        self.session.set_connected();
        self.session.clear_error();
        info!(attempt, channel_id = %self.session.channel_id, "Voice channel connected");

        if let Err(e) = self.handle.signaling.send(&SignalMessage::Join) {
            error!("Error sending join message: {}", e);
            self.session.record_error(JOIN_FAILURE);
            self.leave();
            return;
        }

        self.start_microphone();
    }

    /// The socket for `attempt` closed (or failed to open).
    pub fn on_transport_closed(&mut self, attempt: u64, code: u16, reason: &str, now: Instant) {
        if !self.handle.signaling.release(attempt) {
            debug!(attempt, code, "Ignoring close of stale attempt");
            return;
        }

        info!(attempt, code, reason, "Signaling connection closed");
        self.session.set_disconnected();
        self.handle.stop_media();
        self.session.clear_visual_flags();

        let outcome = classify_close(code, reason);
        self.session.record_error(outcome.message());
        if outcome.reconnect {
            self.schedule_reconnect(now);
        } else {
            warn!(code, kind = outcome.error.kind(), "Connection closed, not reconnecting");
            self.session.roster.clear();
        }
    }

    /// A text frame arrived on `attempt`.
    pub fn on_transport_text(&mut self, attempt: u64, text: &str, now: Instant) {
        if !self.handle.signaling.is_current(attempt) {
            return;
        }
        match SignalMessage::decode(text) {
            Ok(message) => self.handle_message(message, now),
            Err(e) => {
                warn!("Error parsing signaling message: {}", e);
                self.session.stats.protocol_errors += 1;
            }
        }
    }

    /// A binary frame (raw PCM) arrived on `attempt`.
    pub fn on_transport_binary(&mut self, attempt: u64, data: &[u8], now: Instant) {
        if !self.handle.signaling.is_current(attempt) {
            return;
        }
        let result = self.playback.play_raw(data, self.session.volume, self.session.is_deafened, now);
        self.record_playback(result);
    }

    fn handle_message(&mut self, message: SignalMessage, now: Instant) {
        if let Some(data) = message.echoed_audio() {
            let result = self
                .playback
                .play_encoded(data, self.session.volume, self.session.is_deafened, now);
            self.record_playback(result);
            return;
        }

        match message {
            SignalMessage::TokenRefresh { token } => {
                if let Err(e) = self.tokens.replace(token) {
                    warn!("Pushed token kept in memory only: {}", e);
                }
                info!("Token refreshed by server");
            }
            SignalMessage::Ping => {
                if let Err(e) = self.handle.signaling.send(&SignalMessage::Pong) {
                    warn!("Error sending pong: {}", e);
                }
            }
            SignalMessage::Pong => {
                self.handle.signaling.record_pong(now);
            }
            SignalMessage::Participants { participants: Some(list), is_echo_mode } => {
                debug!(count = list.len(), is_echo_mode, "Roster snapshot");
                self.session.roster.replace(list);
                self.session.set_echo_mode(is_echo_mode);
            }
            SignalMessage::ParticipantJoined { participant: Some(participant), is_echo_mode } => {
                let id = participant.id.clone();
                match self.session.roster.upsert(participant) {
                    Upsert::Inserted => info!(user_id = %id, "Participant joined"),
                    Upsert::Replaced => debug!(user_id = %id, "Participant re-joined, entry replaced"),
                    Upsert::SkippedLocal => debug!(user_id = %id, "Own join event ignored"),
                }
                self.session.set_echo_mode(is_echo_mode);
            }
            SignalMessage::ParticipantLeft { user_id: Some(id), is_echo_mode } => {
                if self.session.roster.remove(&id).is_some() {
                    info!(user_id = %id, "Participant left");
                }
                self.session.set_echo_mode(is_echo_mode);
            }
            SignalMessage::ConnectionStatus { status } => {
                if status == "connected" {
                    self.session.set_connected();
                } else {
                    debug!(%status, "Unhandled connection status");
                }
            }
            SignalMessage::Audio { data, .. } => {
                let result = self
                    .playback
                    .play_encoded(&data, self.session.volume, self.session.is_deafened, now);
                self.record_playback(result);
            }
            other @ (SignalMessage::MuteState { .. }
            | SignalMessage::DeafenState { .. }
            | SignalMessage::VideoState { .. }
            | SignalMessage::ScreenShareState { .. }
            | SignalMessage::VideoStart { .. }
            | SignalMessage::VideoStop { .. }
            | SignalMessage::ScreenShareStart { .. }
            | SignalMessage::ScreenShareStop { .. }) => {
                if !self.session.apply_member_update(&other) {
                    debug!(message_type = other.type_name(), "Member update for unknown user ignored");
                }
            }
            other => {
                debug!(message_type = other.type_name(), "Unhandled message type");
            }
        }
    }

    fn record_playback(&mut self, result: VoiceResult<PlaybackOutcome>) {
        match result {
            Ok(PlaybackOutcome::Played { .. }) => self.session.stats.frames_played += 1,
            Ok(PlaybackOutcome::Discarded) => self.session.stats.frames_discarded += 1,
            Err(e) => {
                if let VoiceError::Protocol(_) = e {
                    self.session.stats.protocol_errors += 1;
                }
                warn!("Error playing audio: {}", e);
            }
        }
    }

    // ---- Timers ----

    /// Run every timer that is due at `now`.
    pub fn poll_timers(&mut self, now: Instant) {
        let mut reconnect_due = false;

        for event in self.handle.signaling.poll(now) {
            match event {
                TimerEvent::ConnectTimeout => {
                    if self.handle.signaling.is_open() {
                        continue;
                    }
                    error!("Signaling connection timeout");
                    self.handle.signaling.abandon_attempt();
                    self.handle.stop_media();
                    self.session.set_disconnected();
                    self.session.clear_visual_flags();
                    self.session.record_error(TIMEOUT_MESSAGE);
                    self.schedule_reconnect(now);
                }
                TimerEvent::Ping => {
                    if self.handle.signaling.is_open() {
                        if let Err(e) = self.handle.signaling.send(&SignalMessage::Ping) {
                            warn!("Error sending ping: {}", e);
                        }
                    }
                }
                TimerEvent::HealthCheck => {
                    if !self.handle.signaling.is_open() {
                        warn!("Connection health check failed, attempting to reconnect");
                        self.schedule_reconnect(now);
                    }
                }
                TimerEvent::Reconnect => reconnect_due = true,
            }
        }

        if reconnect_due {
            if self.session.phase().is_connected() && self.handle.signaling.is_open() {
                debug!("Reconnect skipped, connection is healthy");
            } else {
                info!("Reconnecting to voice channel");
                self.connect();
            }
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        self.handle.signaling.schedule_reconnect(now);
        self.session.stats.reconnects_scheduled += 1;
    }

    // ---- Audio capture ----

    fn start_microphone(&mut self) {
        if let Err(e) = self.handle.audio.start(self.devices.as_mut(), &mut self.inventory) {
            error!("Error accessing microphone: {}", e);
            self.session.record_error(MICROPHONE_FAILURE);
        }
    }

    /// Process one captured block and send the frames it completes.
    pub fn on_capture_block(&mut self, block: CapturedBlock) {
        let open = self.handle.signaling.is_open();
        let batch = self.handle.audio.process(&block, self.session.is_muted, open);

        self.session.stats.frames_suppressed += batch.muted as u64;
        self.session.stats.frames_offline += batch.offline as u64;
        for frame in batch.frames {
            match self.handle.signaling.send(&frame) {
                Ok(()) => self.session.stats.frames_sent += 1,
                Err(e) => debug!("Audio frame not sent: {}", e),
            }
        }
    }

    // ---- Controls ----

    /// Send a control message. Fails with `NotConnected` when the transport is
    /// not open; nothing is queued.
    pub fn send(&mut self, message: &SignalMessage) -> VoiceResult<()> {
        self.handle.signaling.send(message)
    }

    pub fn toggle_mute(&mut self) -> Toggled {
        let enabled = !self.session.is_muted;
        self.session.is_muted = enabled;
        info!(is_muted = enabled, "Mute toggled");
        let delivery = self.send(&SignalMessage::MuteState { is_muted: enabled, user_id: None });
        Toggled { enabled, delivery }
    }

    pub fn toggle_deafen(&mut self) -> Toggled {
        let enabled = !self.session.is_deafened;
        self.session.is_deafened = enabled;
        info!(is_deafened = enabled, "Deafen toggled");
        let delivery = self.send(&SignalMessage::DeafenState { is_deafened: enabled, user_id: None });
        Toggled { enabled, delivery }
    }

    /// Start or stop the camera. A failed start leaves video off and records
    /// the camera error.
    pub fn toggle_video(&mut self) -> Toggled {
        if self.session.is_video_enabled {
            self.handle.camera.stop();
            self.session.is_video_enabled = false;
            self.announce(SignalMessage::VideoStop { user_id: self.local_user.clone() });
        } else {
            match self.handle.camera.start(self.devices.as_mut(), &self.config.video) {
                Ok(()) => {
                    self.session.is_video_enabled = true;
                    self.announce(SignalMessage::VideoStart { user_id: self.local_user.clone() });
                }
                Err(e) => {
                    error!("Error accessing camera: {}", e);
                    self.session.record_error(VisualSource::Camera.failure_message());
                }
            }
        }

        let enabled = self.session.is_video_enabled;
        let delivery = self.send(&SignalMessage::VideoState { is_enabled: enabled, user_id: None });
        Toggled { enabled, delivery }
    }

    pub fn toggle_screen_share(&mut self) -> Toggled {
        if self.session.is_screen_sharing {
            self.handle.screen.stop();
            self.session.is_screen_sharing = false;
            self.announce(SignalMessage::ScreenShareStop { user_id: self.local_user.clone() });
        } else {
            match self.handle.screen.start(self.devices.as_mut(), &self.config.video) {
                Ok(()) => {
                    self.session.is_screen_sharing = true;
                    self.announce(SignalMessage::ScreenShareStart { user_id: self.local_user.clone() });
                }
                Err(e) => {
                    error!("Error starting screen share: {}", e);
                    self.session.record_error(VisualSource::Screen.failure_message());
                }
            }
        }

        let enabled = self.session.is_screen_sharing;
        let delivery = self.send(&SignalMessage::ScreenShareState { is_enabled: enabled, user_id: None });
        Toggled { enabled, delivery }
    }

    /// Announcements only go out while the transport is open.
    fn announce(&mut self, message: SignalMessage) {
        if self.handle.signaling.is_open() {
            if let Err(e) = self.send(&message) {
                warn!(message_type = message.type_name(), "Announcement failed: {}", e);
            }
        }
    }

    /// Set playback volume (clamped to 0..=100). Takes effect on the next frame.
    pub fn set_volume(&mut self, value: u8) -> Volume {
        self.session.volume = Volume::new(value);
        debug!(volume = self.session.volume.get(), "Volume changed");
        self.session.volume
    }

    // ---- Devices ----

    /// Re-enumerate audio devices.
    pub fn refresh_devices(&mut self) -> VoiceResult<&[DeviceDescriptor]> {
        match self.devices.enumerate() {
            Ok(list) => {
                self.inventory.update(list);
                Ok(self.inventory.devices())
            }
            Err(e) => {
                error!("Error loading audio devices: {}", e);
                self.session.record_error(DEVICE_LIST_FAILURE);
                Err(e)
            }
        }
    }

    /// Switch input or output. While connected this leaves and joins again so
    /// the new device is picked up.
    pub fn change_device(&mut self, kind: DeviceKind, device_id: &str) -> VoiceResult<()> {
        self.handle.audio.stop();
        self.inventory.select(kind, device_id);
        info!(kind = %kind, device = device_id, "Audio device selected");

        if kind == DeviceKind::Output {
            if let Err(e) = self.playback.select_output(Some(device_id)) {
                error!("Error changing output device: {}", e);
                self.session.record_error(DEVICE_CHANGE_FAILURE);
                return Err(e);
            }
        }

        if self.session.phase().is_connected() {
            self.leave();
            self.join();
        }
        Ok(())
    }

    // ---- Teardown ----

    /// Leave the channel. Idempotent.
    ///
    /// Stops every capture track, sends `leave` if possible, closes the socket
    /// with 1000 and cancels all timers including pending reconnects.
    pub fn leave(&mut self) {
        let had_anything = self.handle.teardown() || self.pending_refresh.is_some();
        self.pending_refresh = None;
        self.playback.reset();
        self.session.reset_after_leave();
        self.flow.leave();
        if had_anything {
            info!(channel_id = %self.session.channel_id, "Left voice channel");
        }
    }

    /// The UI navigated to `path`. Leaving the voice route tears the session down.
    pub fn on_route_change(&mut self, path: &str) -> bool {
        if is_voice_route(path) {
            return false;
        }
        debug!(path, "Navigated away from voice route");
        self.leave();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::processor::encode_frame_base64;
    use crate::testing::{FakeMedia, FakeTransport, MediaLog, RecordingOutput, TransportLog};
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    struct Harness {
        controller: VoiceController,
        media: Rc<RefCell<MediaLog>>,
        output: RecordingOutput,
        capture_rx: mpsc::UnboundedReceiver<CapturedBlock>,
        t0: Instant,
    }

    fn harness() -> Harness {
        let mut config = AppConfig::default();
        config.audio.frame_size = 8;
        config.auth.user_id = Some("me".into());
        let (media, media_log) = FakeMedia::new();
        let output = RecordingOutput::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = VoiceController::new(
            config,
            "12",
            TokenStore::in_memory("t0"),
            Box::new(media),
            Box::new(output.clone()),
            tx,
        );
        Harness {
            controller,
            media: media_log,
            output,
            capture_rx: rx,
            t0: Instant::now(),
        }
    }

    impl Harness {
        /// Drive join → refresh → open. Returns the transport log and attempt.
        fn connect(&mut self) -> (Rc<RefCell<TransportLog>>, u64) {
            self.controller.join();
            self.open_after_refresh(self.t0)
        }

        fn open_after_refresh(&mut self, now: Instant) -> (Rc<RefCell<TransportLog>>, u64) {
            let request = match self.controller.drain_effects().pop() {
                Some(Effect::RefreshToken { request, .. }) => request,
                other => panic!("Expected token refresh, got {:?}", other),
            };
            self.controller.on_token_refreshed(request, Ok("t1".into()), now);
            let attempt = match self.controller.drain_effects().pop() {
                Some(Effect::OpenTransport { attempt, url }) => {
                    assert!(url.ends_with("/ws/voice/12?token=t1"));
                    attempt
                }
                other => panic!("Expected transport open, got {:?}", other),
            };
            let (transport, log) = FakeTransport::open();
            self.controller.on_transport_open(attempt, Box::new(transport));
            (log, attempt)
        }

        fn feed_capture(&mut self, samples: usize) {
            let sink = self.media.borrow().last_sink.clone().unwrap();
            sink.deliver(1, vec![0.25; samples]);
            let block = self.capture_rx.try_recv().unwrap();
            self.controller.on_capture_block(block);
        }
    }

    fn text(message: serde_json::Value) -> String {
        message.to_string()
    }

    #[test]
    fn test_connect_sends_join_and_starts_microphone() {
        let mut h = harness();
        let (log, _) = h.connect();

        assert_eq!(h.controller.phase(), ConnectionPhase::Connected { echo_mode: false });
        assert_eq!(log.borrow().sent_types(), vec!["join"]);
        assert!(h.controller.is_capturing_audio());
        assert_eq!(h.controller.token(), "t1");

        let request = h.media.borrow().last_request.clone().unwrap();
        assert_eq!(request.device_id, "mic-1");
        assert_eq!(request.sample_rate, 48_000);
        assert!(request.echo_cancellation && request.noise_suppression && request.auto_gain_control);
    }

    #[test]
    fn test_scenario_roster_from_participants() {
        let mut h = harness();
        let (_log, attempt) = h.connect();

        h.controller.on_transport_text(
            attempt,
            &text(serde_json::json!({"type": "participants", "participants": [{"id": 1, "username": "a"}], "isEchoMode": true})),
            h.t0,
        );

        let roster: Vec<_> = h.controller.roster().iter().map(|p| (p.id.to_string(), p.username.clone())).collect();
        assert_eq!(roster, vec![("1".to_string(), "a".to_string())]);
        assert!(h.controller.phase().echo_mode());
    }

    #[test]
    fn test_scenario_not_a_member_does_not_reconnect() {
        let mut h = harness();
        let (_log, attempt) = h.connect();

        h.controller.on_transport_closed(attempt, 4002, "", h.t0);
        assert_eq!(h.controller.phase(), ConnectionPhase::Disconnected);
        assert_eq!(h.controller.last_error(), Some("You are not a member of this server."));
        assert_eq!(h.controller.pending_reconnects(), 0);
        assert_eq!(h.controller.next_deadline(), None);
        assert!(!h.controller.is_capturing_audio());
    }

    #[test]
    fn test_scenario_abrupt_close_reconnects_after_delay() {
        let mut h = harness();
        let (_log, attempt) = h.connect();

        h.controller.on_transport_closed(attempt, 1006, "", h.t0);
        assert_eq!(h.controller.last_error(), Some("Connection lost. Attempting to reconnect..."));
        assert_eq!(h.controller.next_deadline(), Some(h.t0 + Duration::from_secs(3)));

        h.controller.poll_timers(h.t0 + Duration::from_millis(2999));
        assert!(h.controller.drain_effects().is_empty());

        h.controller.poll_timers(h.t0 + Duration::from_secs(3));
        assert_eq!(h.controller.phase(), ConnectionPhase::Connecting);
        assert!(matches!(
            h.controller.drain_effects().as_slice(),
            [Effect::RefreshToken { .. }]
        ));
        assert_eq!(h.controller.session().stats.connect_attempts, 2);
    }

    #[test]
    fn test_scenario_mute_gates_frames_without_reopening_microphone() {
        let mut h = harness();
        let (log, _) = h.connect();

        h.feed_capture(8);
        assert_eq!(log.borrow().sent_types(), vec!["join", "audio"]);

        let toggled = h.controller.toggle_mute();
        assert!(toggled.enabled);
        assert_eq!(toggled.delivery, Ok(()));
        h.feed_capture(16);
        assert_eq!(log.borrow().sent_types(), vec!["join", "audio", "mute_state"]);
        assert_eq!(h.controller.session().stats.frames_suppressed, 2);

        assert!(!h.controller.toggle_mute().enabled);
        h.feed_capture(8);
        assert_eq!(log.borrow().sent_types().last().unwrap(), "audio");
        assert_eq!(h.media.borrow().mic_opens, 1);
    }

    #[test]
    fn test_token_refresh_failure_is_fatal() {
        let mut h = harness();
        h.controller.join();
        let request = match h.controller.drain_effects().pop() {
            Some(Effect::RefreshToken { request, .. }) => request,
            other => panic!("unexpected {:?}", other),
        };
        h.controller
            .on_token_refreshed(request, Err(VoiceError::Authentication("401".into())), h.t0);

        assert_eq!(h.controller.phase(), ConnectionPhase::Disconnected);
        assert_eq!(h.controller.last_error(), Some(AUTH_FAILURE));
        assert!(h.controller.drain_effects().is_empty());
        assert_eq!(h.controller.pending_reconnects(), 0);
    }

    #[test]
    fn test_connect_timeout_schedules_reconnect() {
        let mut h = harness();
        h.controller.join();
        let request = match h.controller.drain_effects().pop() {
            Some(Effect::RefreshToken { request, .. }) => request,
            other => panic!("unexpected {:?}", other),
        };
        h.controller.on_token_refreshed(request, Ok("t1".into()), h.t0);
        let attempt = match h.controller.drain_effects().pop() {
            Some(Effect::OpenTransport { attempt, .. }) => attempt,
            other => panic!("unexpected {:?}", other),
        };

        h.controller.poll_timers(h.t0 + Duration::from_secs(5));
        assert_eq!(h.controller.last_error(), Some(TIMEOUT_MESSAGE));
        assert_eq!(h.controller.phase(), ConnectionPhase::Disconnected);
        assert_eq!(h.controller.pending_reconnects(), 1);

        // The socket finally opens after the timeout: it is stale and closed.
        let (transport, log) = FakeTransport::open();
        h.controller.on_transport_open(attempt, Box::new(transport));
        assert_eq!(log.borrow().closed.as_ref().map(|c| c.0), Some(1000));
        assert!(log.borrow().sent.is_empty());
        assert_eq!(h.controller.phase(), ConnectionPhase::Disconnected);
    }

    #[test]
    fn test_stale_close_is_ignored_after_reconnect() {
        let mut h = harness();
        let (_old, first) = h.connect();
        h.controller.on_transport_closed(first, 1006, "", h.t0);
        h.controller.poll_timers(h.t0 + Duration::from_secs(3));
        let (_new, second) = h.open_after_refresh(h.t0 + Duration::from_secs(3));
        assert_ne!(first, second);

        h.controller.on_transport_closed(first, 1006, "", h.t0 + Duration::from_secs(4));
        assert!(h.controller.phase().is_connected());
        assert_eq!(h.controller.pending_reconnects(), 0);
    }

    #[test]
    fn test_health_check_reconnects_when_transport_dead() {
        let mut h = harness();
        let (log, _) = h.connect();
        log.borrow_mut().open = false;

        h.controller.poll_timers(h.t0 + Duration::from_secs(30));
        assert_eq!(h.controller.pending_reconnects(), 1);

        h.controller.poll_timers(h.t0 + Duration::from_secs(33));
        assert!(matches!(
            h.controller.drain_effects().as_slice(),
            [Effect::RefreshToken { .. }]
        ));
    }

    #[test]
    fn test_health_check_adds_reconnect_even_when_one_is_pending() {
        let mut h = harness();
        let (log, _) = h.connect();
        h.controller.schedule_reconnect(h.t0 + Duration::from_secs(28));
        log.borrow_mut().open = false;

        h.controller.poll_timers(h.t0 + Duration::from_secs(30));
        assert_eq!(h.controller.pending_reconnects(), 2);

        h.controller.poll_timers(h.t0 + Duration::from_secs(31));
        assert_eq!(h.controller.pending_reconnects(), 1);
        assert!(matches!(
            h.controller.drain_effects().as_slice(),
            [Effect::RefreshToken { .. }]
        ));
    }

    #[test]
    fn test_local_user_kept_out_of_roster() {
        let mut h = harness();
        let (_log, attempt) = h.connect();

        h.controller.on_transport_text(
            attempt,
            &text(serde_json::json!({"type": "participants", "participants": [{"id": "me", "username": "self"}, {"id": 1, "username": "a"}]})),
            h.t0,
        );
        h.controller.on_transport_text(
            attempt,
            &text(serde_json::json!({"type": "participant_joined", "participant": {"id": "me", "username": "self"}})),
            h.t0,
        );

        let ids: Vec<_> = h.controller.roster().iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["1"]);
    }

    #[test]
    fn test_fatal_close_clears_roster_but_transient_close_keeps_it() {
        let mut h = harness();
        let (_log, attempt) = h.connect();
        let roster = text(serde_json::json!({"type": "participants", "participants": [{"id": 1, "username": "a"}]}));
        h.controller.on_transport_text(attempt, &roster, h.t0);

        h.controller.on_transport_closed(attempt, 1006, "", h.t0);
        assert_eq!(h.controller.roster().len(), 1);

        h.controller.poll_timers(h.t0 + Duration::from_secs(3));
        let (_log, attempt) = h.open_after_refresh(h.t0 + Duration::from_secs(3));
        h.controller.on_transport_closed(attempt, 4001, "", h.t0 + Duration::from_secs(4));
        assert!(h.controller.roster().is_empty());
        assert_eq!(h.controller.pending_reconnects(), 0);
    }

    #[test]
    fn test_join_while_connected_is_ignored() {
        let mut h = harness();
        let (log, _) = h.connect();

        h.controller.join();
        assert!(h.controller.drain_effects().is_empty());
        assert_eq!(h.controller.phase(), ConnectionPhase::Connected { echo_mode: false });
        assert!(h.controller.is_transport_open());
        assert_eq!(log.borrow().sent_types(), vec!["join"]);
    }

    #[test]
    fn test_health_check_is_quiet_when_open() {
        let mut h = harness();
        let (log, _) = h.connect();
        h.controller.poll_timers(h.t0 + Duration::from_secs(15));
        h.controller.poll_timers(h.t0 + Duration::from_secs(30));
        assert_eq!(h.controller.pending_reconnects(), 0);
        assert_eq!(log.borrow().sent_types(), vec!["join", "ping", "ping"]);
    }

    #[test]
    fn test_ping_is_answered_with_pong() {
        let mut h = harness();
        let (log, attempt) = h.connect();
        h.controller.on_transport_text(attempt, r#"{"type":"ping"}"#, h.t0);
        assert_eq!(log.borrow().sent_types(), vec!["join", "pong"]);
    }

    #[test]
    fn test_server_token_refresh_replaces_token() {
        let mut h = harness();
        let (_log, attempt) = h.connect();
        h.controller
            .on_transport_text(attempt, r#"{"type":"token_refresh","token":"pushed"}"#, h.t0);
        assert_eq!(h.controller.token(), "pushed");
    }

    #[test]
    fn test_malformed_message_is_counted_and_dropped() {
        let mut h = harness();
        let (_log, attempt) = h.connect();
        h.controller.on_transport_text(attempt, "not json", h.t0);
        assert_eq!(h.controller.session().stats.protocol_errors, 1);
        assert!(h.controller.phase().is_connected());
    }

    #[test]
    fn test_duplicate_join_replaces_entry() {
        let mut h = harness();
        let (_log, attempt) = h.connect();
        for name in ["a", "a-renamed"] {
            h.controller.on_transport_text(
                attempt,
                &text(serde_json::json!({"type": "participant_joined", "participant": {"id": 3, "username": name}, "isEchoMode": false})),
                h.t0,
            );
        }
        assert_eq!(h.controller.roster().len(), 1);
        assert_eq!(h.controller.roster().iter().next().unwrap().username, "a-renamed");

        h.controller
            .on_transport_text(attempt, r#"{"type":"participant_left","userId":3,"isEchoMode":false}"#, h.t0);
        assert!(h.controller.roster().is_empty());
    }

    #[test]
    fn test_audio_playback_respects_deafen_and_volume() {
        let mut h = harness();
        let (_log, attempt) = h.connect();
        let frame = text(serde_json::json!({"type": "audio", "data": encode_frame_base64(&[1000; 32])}));

        h.controller.set_volume(40);
        h.controller.on_transport_text(attempt, &frame, h.t0);
        assert_eq!(h.output.buffers().len(), 1);
        assert!((h.output.buffers()[0].gain - 0.4).abs() < 1e-6);

        h.controller.toggle_deafen();
        h.controller.on_transport_text(attempt, &frame, h.t0);
        h.controller.on_transport_binary(attempt, &[0, 1, 0, 1], h.t0);
        assert_eq!(h.output.buffers().len(), 1);
        assert_eq!(h.controller.session().stats.frames_discarded, 2);
    }

    #[test]
    fn test_echo_audio_is_played() {
        let mut h = harness();
        let (_log, attempt) = h.connect();
        let echo = text(serde_json::json!({
            "type": "echo",
            "original_message": {"type": "audio", "data": encode_frame_base64(&[5; 4])}
        }));
        h.controller.on_transport_text(attempt, &echo, h.t0);
        assert_eq!(h.output.buffers().len(), 1);
    }

    #[test]
    fn test_toggles_while_disconnected_report_delivery_failure() {
        let mut h = harness();
        let toggled = h.controller.toggle_mute();
        assert!(toggled.enabled);
        assert_eq!(toggled.delivery, Err(VoiceError::NotConnected));
        assert!(h.controller.session().is_muted);
    }

    #[test]
    fn test_video_toggle_announces_and_reports_state() {
        let mut h = harness();
        let (log, _) = h.connect();

        assert!(h.controller.toggle_video().enabled);
        assert!(!h.controller.toggle_video().enabled);

        let sent = log.borrow().sent_json();
        let tail: Vec<_> = sent[1..].to_vec();
        assert_eq!(
            tail,
            vec![
                serde_json::json!({"type": "video_start", "userId": "me"}),
                serde_json::json!({"type": "video_state", "isEnabled": true}),
                serde_json::json!({"type": "video_stop", "userId": "me"}),
                serde_json::json!({"type": "video_state", "isEnabled": false}),
            ]
        );
    }

    #[test]
    fn test_denied_camera_keeps_video_off() {
        let mut h = harness();
        let (log, _) = h.connect();
        h.media.borrow_mut().deny_camera = true;

        let toggled = h.controller.toggle_video();
        assert!(!toggled.enabled);
        assert!(!h.controller.session().is_video_enabled);
        assert_eq!(
            h.controller.last_error(),
            Some("Failed to access camera. Please make sure you have granted camera permissions.")
        );
        assert_eq!(log.borrow().sent_json().last().unwrap()["isEnabled"], false);
        assert!(h.controller.phase().is_connected());
    }

    #[test]
    fn test_screen_share_failure_message() {
        let mut h = harness();
        let _ = h.connect();
        h.media.borrow_mut().deny_display = true;
        assert!(!h.controller.toggle_screen_share().enabled);
        assert_eq!(h.controller.last_error(), Some("Failed to start screen sharing."));
    }

    #[test]
    fn test_microphone_denied_keeps_session_connected() {
        let mut h = harness();
        h.media.borrow_mut().deny_microphone = true;
        let (log, _) = h.connect();
        assert!(h.controller.phase().is_connected());
        assert_eq!(h.controller.last_error(), Some(MICROPHONE_FAILURE));
        assert_eq!(log.borrow().sent_types(), vec!["join"]);
    }

    #[test]
    fn test_leave_is_idempotent_and_cancels_everything() {
        let mut h = harness();
        let (log, attempt) = h.connect();
        h.controller.toggle_video();
        h.controller.toggle_mute();
        h.controller.toggle_deafen();

        h.controller.leave();
        assert_eq!(log.borrow().sent_types().last().unwrap(), "leave");
        assert_eq!(log.borrow().closed, Some((1000, "User left channel".to_string())));
        assert_eq!(h.controller.next_deadline(), None);
        assert!(!h.controller.session().is_muted);
        assert!(!h.controller.session().is_deafened);
        assert!(!h.controller.session().is_video_enabled);
        assert_eq!(h.controller.flow(), &JoinFlow::Left);
        let stopped = h.media.borrow().stopped;
        assert_eq!(stopped, 2);

        h.controller.leave();
        assert_eq!(h.media.borrow().stopped, stopped);

        // Close of the old socket arriving afterwards changes nothing
        h.controller.on_transport_closed(attempt, 1000, "", h.t0);
        assert_eq!(h.controller.pending_reconnects(), 0);
    }

    #[test]
    fn test_leave_cancels_pending_reconnect() {
        let mut h = harness();
        let (_log, attempt) = h.connect();
        h.controller.on_transport_closed(attempt, 1006, "", h.t0);
        assert_eq!(h.controller.pending_reconnects(), 1);
        h.controller.leave();
        h.controller.poll_timers(h.t0 + Duration::from_secs(10));
        assert!(h.controller.drain_effects().is_empty());
    }

    #[test]
    fn test_leave_during_refresh_ignores_late_result() {
        let mut h = harness();
        h.controller.join();
        let request = match h.controller.drain_effects().pop() {
            Some(Effect::RefreshToken { request, .. }) => request,
            other => panic!("unexpected {:?}", other),
        };
        h.controller.leave();
        h.controller.on_token_refreshed(request, Ok("late".into()), h.t0);
        assert!(h.controller.drain_effects().is_empty());
        assert_eq!(h.controller.phase(), ConnectionPhase::Disconnected);
    }

    #[test]
    fn test_route_guard_tears_down() {
        let mut h = harness();
        let (log, _) = h.connect();
        assert!(!h.controller.on_route_change("/channels/1/voice/12"));
        assert!(h.controller.phase().is_connected());

        assert!(h.controller.on_route_change("/channels/1/12"));
        assert_eq!(h.controller.phase(), ConnectionPhase::Disconnected);
        assert!(log.borrow().closed.is_some());
    }

    #[test]
    fn test_device_change_while_connected_rejoins() {
        let mut h = harness();
        let (log, _) = h.connect();

        h.controller.change_device(DeviceKind::Input, "mic-2").unwrap();
        assert_eq!(log.borrow().sent_types().last().unwrap(), "leave");
        assert_eq!(h.controller.phase(), ConnectionPhase::Connecting);
        assert_eq!(h.controller.inventory().selected(DeviceKind::Input), Some("mic-2"));

        let _ = h.open_after_refresh(h.t0);
        assert_eq!(h.media.borrow().last_request.as_ref().unwrap().device_id, "mic-2");
    }

    #[test]
    fn test_output_change_routes_playback() {
        let mut h = harness();
        h.controller.change_device(DeviceKind::Output, "spk-1").unwrap();
        assert_eq!(h.output.selected().as_deref(), Some("spk-1"));
        assert_eq!(h.controller.phase(), ConnectionPhase::Disconnected);
    }

    #[test]
    fn test_preview_snapshot_and_failure() {
        let mut h = harness();
        h.controller.open_preview();
        assert!(matches!(
            h.controller.drain_effects().as_slice(),
            [Effect::FetchParticipants { channel_id, token }] if channel_id == "12" && token == "t0"
        ));
        h.controller.on_preview_loaded(Ok(vec![Participant::new(9u64, "z")]));
        assert_eq!(h.controller.flow().snapshot().map(|s| s.len()), Some(1));

        h.controller.on_preview_loaded(Err(VoiceError::Connection("refused".into())));
        assert_eq!(h.controller.last_error(), Some(PREVIEW_FAILURE));
        assert!(h.controller.cancel_preview());
    }

    #[test]
    fn test_member_state_updates_roster() {
        let mut h = harness();
        let (_log, attempt) = h.connect();
        h.controller.on_transport_text(
            attempt,
            r#"{"type":"participants","participants":[{"id":4,"username":"d"}],"isEchoMode":false}"#,
            h.t0,
        );
        h.controller
            .on_transport_text(attempt, r#"{"type":"deafen_state","isDeafened":true,"userId":4}"#, h.t0);
        assert!(h.controller.roster().iter().next().unwrap().is_deafened);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut h = harness();
        let _ = h.connect();
        let snapshot = serde_json::to_value(h.controller.snapshot()).unwrap();
        assert_eq!(snapshot["status"], "connected");
        assert_eq!(snapshot["volume"], 100);
        assert_eq!(snapshot["selected_input"], "mic-1");
    }
}
