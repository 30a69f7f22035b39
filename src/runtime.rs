//! # Session Runtime
//!
//! Drives a [`VoiceController`] on tokio: executes its effects, feeds network
//! results, captured audio and user commands back into it, and wakes it up when
//! its next timer is due.
//!
//! ## Event sources (one `select!` loop):
//! - network results from spawned REST calls and socket tasks
//! - microphone blocks from the capture backend
//! - [`Command`]s from the user interface
//! - the controller's next timer deadline

use crate::api::ApiClient;
use crate::audio::device::{DeviceDescriptor, DeviceKind};
use crate::audio::playback::AudioOutput;
use crate::auth::TokenStore;
use crate::config::AppConfig;
use crate::controller::{Effect, Toggled, VoiceController};
use crate::error::VoiceResult;
use crate::media::{CapturedBlock, MediaDevices};
use crate::session::SessionSnapshot;
use crate::transport::{spawn_connection, NetworkEvent};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// User actions accepted by the runtime.
#[derive(Debug)]
pub enum Command {
    OpenPreview,
    Join,
    CancelPreview,
    ToggleMute,
    ToggleDeafen,
    ToggleVideo,
    ToggleScreenShare,
    SetVolume(u8),
    SelectDevice(DeviceKind, String),
    ListDevices(oneshot::Sender<VoiceResult<Vec<DeviceDescriptor>>>),
    Status(oneshot::Sender<SessionSnapshot>),
    Navigate(String),
    Leave,
    Quit,
}

pub struct Runtime {
    controller: VoiceController,
    api: ApiClient,
    network_tx: mpsc::UnboundedSender<NetworkEvent>,
    network_rx: mpsc::UnboundedReceiver<NetworkEvent>,
    capture_rx: mpsc::UnboundedReceiver<CapturedBlock>,
}

impl Runtime {
    pub fn new(
        config: AppConfig,
        channel_id: impl Into<String>,
        tokens: TokenStore,
        devices: Box<dyn MediaDevices>,
        output: Box<dyn AudioOutput>,
    ) -> VoiceResult<Self> {
        let api = ApiClient::new(config.api_base_url())?;
        let (network_tx, network_rx) = mpsc::unbounded_channel();
        let (capture_tx, capture_rx) = mpsc::unbounded_channel();
        let controller = VoiceController::new(config, channel_id, tokens, devices, output, capture_tx);

        Ok(Self {
            controller,
            api,
            network_tx,
            network_rx,
            capture_rx,
        })
    }

    /// Run until `Quit` arrives or the command channel closes. Leaves the
    /// channel before returning.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) -> VoiceResult<()> {
        info!(channel_id = %self.controller.session().channel_id, "Voice session runtime started");

        loop {
            self.dispatch_effects();
            let deadline = self.controller.next_deadline();

            tokio::select! {
                Some(event) = self.network_rx.recv() => {
                    self.handle_network(event);
                }
                Some(block) = self.capture_rx.recv() => {
                    self.controller.on_capture_block(block);
                }
                command = commands.recv() => {
                    match command {
                        Some(Command::Quit) | None => break,
                        Some(command) => self.apply(command),
                    }
                }
                _ = wait_until(deadline) => {
                    self.controller.poll_timers(Instant::now());
                }
            }
        }

        self.controller.leave();
        info!("Voice session runtime stopped");
        Ok(())
    }

    fn dispatch_effects(&mut self) {
        for effect in self.controller.drain_effects() {
            match effect {
                Effect::FetchParticipants { channel_id, token } => {
                    let api = self.api.clone();
                    let events = self.network_tx.clone();
                    tokio::spawn(async move {
                        let result = api.fetch_participants(&channel_id, &token).await;
                        let _ = events.send(NetworkEvent::PreviewLoaded(result));
                    });
                }
                Effect::RefreshToken { request, token } => {
                    let api = self.api.clone();
                    let events = self.network_tx.clone();
                    tokio::spawn(async move {
                        let result = api.refresh_token(&token).await;
                        let _ = events.send(NetworkEvent::TokenRefreshed { request, result });
                    });
                }
                Effect::OpenTransport { attempt, url } => {
                    debug!(attempt, "Opening signaling socket");
                    spawn_connection(attempt, url, self.network_tx.clone());
                }
            }
        }
    }

    fn handle_network(&mut self, event: NetworkEvent) {
        let now = Instant::now();
        match event {
            NetworkEvent::PreviewLoaded(result) => self.controller.on_preview_loaded(result),
            NetworkEvent::TokenRefreshed { request, result } => {
                self.controller.on_token_refreshed(request, result, now)
            }
            NetworkEvent::Opened { attempt, transport } => {
                self.controller.on_transport_open(attempt, Box::new(transport))
            }
            NetworkEvent::Text { attempt, text } => self.controller.on_transport_text(attempt, &text, now),
            NetworkEvent::Binary { attempt, data } => self.controller.on_transport_binary(attempt, &data, now),
            NetworkEvent::Closed { attempt, code, reason } => {
                self.controller.on_transport_closed(attempt, code, &reason, now)
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::OpenPreview => self.controller.open_preview(),
            Command::Join => self.controller.join(),
            Command::CancelPreview => {
                self.controller.cancel_preview();
            }
            Command::ToggleMute => log_toggle("mute", self.controller.toggle_mute()),
            Command::ToggleDeafen => log_toggle("deafen", self.controller.toggle_deafen()),
            Command::ToggleVideo => log_toggle("video", self.controller.toggle_video()),
            Command::ToggleScreenShare => log_toggle("screen share", self.controller.toggle_screen_share()),
            Command::SetVolume(value) => {
                self.controller.set_volume(value);
            }
            Command::SelectDevice(kind, id) => {
                if let Err(e) = self.controller.change_device(kind, &id) {
                    warn!("Device change failed: {}", e);
                }
            }
            Command::ListDevices(reply) => {
                let result = self.controller.refresh_devices().map(|list| list.to_vec());
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                let _ = reply.send(self.controller.snapshot());
            }
            Command::Navigate(path) => {
                self.controller.on_route_change(&path);
            }
            Command::Leave => self.controller.leave(),
            Command::Quit => {}
        }
    }
}

fn log_toggle(what: &str, toggled: Toggled) {
    match toggled.delivery {
        Ok(()) => debug!(enabled = toggled.enabled, "{} state sent", what),
        Err(e) => warn!(enabled = toggled.enabled, "{} state not delivered: {}", what, e),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMedia, RecordingOutput};

    fn runtime() -> Runtime {
        let mut config = AppConfig::default();
        config.server.secure = false;
        config.server.port = 1;
        let (media, _log) = FakeMedia::new();
        Runtime::new(
            config,
            "7",
            TokenStore::in_memory("t"),
            Box::new(media),
            Box::new(RecordingOutput::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_quit_leaves_and_returns() {
        let runtime = runtime();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Command::SetVolume(30)).unwrap();
        tx.send(Command::Quit).unwrap();
        runtime.run(rx).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_reply() {
        let mut runtime = runtime();
        let (reply, response) = oneshot::channel();
        runtime.apply(Command::SetVolume(55));
        runtime.apply(Command::Status(reply));
        let snapshot = response.await.unwrap();
        assert_eq!(snapshot.volume.get(), 55);
        assert_eq!(snapshot.status, "disconnected");
    }

    #[tokio::test]
    async fn test_failed_token_refresh_reaches_controller() {
        let mut runtime = runtime();
        runtime.apply(Command::Join);
        runtime.dispatch_effects();

        let event = runtime.network_rx.recv().await.unwrap();
        runtime.handle_network(event);
        let snapshot = runtime.controller.snapshot();
        assert_eq!(snapshot.status, "disconnected");
        assert_eq!(snapshot.last_error.as_deref(), Some("Authentication failed. Please log in again."));
    }
}
