//! # Voice Session - Command Line Client
//!
//! Joins one voice channel and drives it from stdin.
//!
//! ## Usage:
//! ```text
//! voice-session <channel-id> [--join]
//! ```
//!
//! ## Startup:
//! 1. **Loads configuration** from `config.toml`, `VOICE_*` variables and
//!    `SERVER_IP` / `SERVER_PORT`
//! 2. **Sets up logging** through `RUST_LOG`
//! 3. **Loads the access token** from the configured token file or `VOICE_TOKEN`
//! 4. **Opens the preview** (or joins straight away with `--join`)
//! 5. **Runs the session** until `quit`, end of input, SIGINT or SIGTERM
//!
//! Built with `--features hardware` it captures from the real microphone and
//! plays through the real speakers; otherwise it runs headless.

use anyhow::{Context, Result};
use std::io::BufRead;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_session::audio::playback::AudioOutput;
use voice_session::auth::TokenStore;
use voice_session::cli::{self, CliCommand};
use voice_session::media::MediaDevices;
use voice_session::{AppConfig, Command, Runtime};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    let mut args = std::env::args().skip(1);
    let channel_id = args
        .next()
        .or_else(|| std::env::var("VOICE_CHANNEL_ID").ok())
        .context("usage: voice-session <channel-id> [--join]")?;
    let auto_join = args.any(|a| a == "--join");

    let tokens = TokenStore::from_config(&config.auth, std::env::var("VOICE_TOKEN").ok())?;

    info!("Starting voice-session v{}", env!("CARGO_PKG_VERSION"));
    info!("Server: {}", config.ws_base_url());

    let (devices, output) = backends();
    let runtime = Runtime::new(config, channel_id, tokens, devices, output)?;

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let first = if auto_join { Command::Join } else { Command::OpenPreview };
    let _ = commands_tx.send(first);
    setup_signal_handlers(commands_tx.clone());
    spawn_stdin_reader(commands_tx);

    runtime.run(commands_rx).await?;
    info!("Session closed");
    Ok(())
}

/// Initialize tracing. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_session=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

#[cfg(feature = "hardware")]
fn backends() -> (Box<dyn MediaDevices>, Box<dyn AudioOutput>) {
    use voice_session::audio::backend::{CpalMedia, CpalOutput};
    (Box::new(CpalMedia::new()), Box::new(CpalOutput::new()))
}

#[cfg(not(feature = "hardware"))]
fn backends() -> (Box<dyn MediaDevices>, Box<dyn AudioOutput>) {
    use voice_session::audio::playback::HeadlessOutput;
    use voice_session::media::HeadlessMedia;
    warn!("Built without the 'hardware' feature: no microphone or speakers");
    (Box::new(HeadlessMedia), Box::new(HeadlessOutput))
}

/// Translate SIGTERM/SIGINT into a `Quit` so the session leaves cleanly.
fn setup_signal_handlers(commands: mpsc::UnboundedSender<Command>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        let _ = commands.send(Command::Quit);
    });
}

/// Read commands from stdin on a plain thread so a pending read never holds
/// up shutdown. End of input quits.
fn spawn_stdin_reader(commands: mpsc::UnboundedSender<Command>) {
    std::thread::spawn(move || {
        println!("{}", cli::HELP);
        for line in std::io::stdin().lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            };
            let parsed = match cli::parse(&line) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => continue,
                Err(message) => {
                    println!("{}", message);
                    continue;
                }
            };
            let quitting = parsed == CliCommand::Quit;
            if !forward(parsed, &commands) || quitting {
                return;
            }
        }
        let _ = commands.send(Command::Quit);
    });
}

/// Send one command; returns false once the runtime is gone.
fn forward(parsed: CliCommand, commands: &mpsc::UnboundedSender<Command>) -> bool {
    let command = match parsed {
        CliCommand::Help => {
            println!("{}", cli::HELP);
            return true;
        }
        CliCommand::Devices => {
            let (reply, response) = oneshot::channel();
            if commands.send(Command::ListDevices(reply)).is_err() {
                return false;
            }
            match response.blocking_recv() {
                Ok(Ok(devices)) => print_json(&devices),
                Ok(Err(e)) => println!("{}", e.user_message()),
                Err(_) => return false,
            }
            return true;
        }
        CliCommand::Status => {
            let (reply, response) = oneshot::channel();
            if commands.send(Command::Status(reply)).is_err() {
                return false;
            }
            match response.blocking_recv() {
                Ok(snapshot) => print_json(&snapshot),
                Err(_) => return false,
            }
            return true;
        }
        CliCommand::Preview => Command::OpenPreview,
        CliCommand::Join => Command::Join,
        CliCommand::Cancel => Command::CancelPreview,
        CliCommand::Mute => Command::ToggleMute,
        CliCommand::Deafen => Command::ToggleDeafen,
        CliCommand::Video => Command::ToggleVideo,
        CliCommand::Share => Command::ToggleScreenShare,
        CliCommand::Volume(value) => Command::SetVolume(value),
        CliCommand::Device(kind, id) => Command::SelectDevice(kind, id),
        CliCommand::Navigate(path) => Command::Navigate(path),
        CliCommand::Leave => Command::Leave,
        CliCommand::Quit => Command::Quit,
    };
    commands.send(command).is_ok()
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}
