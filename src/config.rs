//! # Configuration Management
//!
//! This module handles loading and managing client configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with VOICE_ prefix, `__` between sections)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `SERVER_IP` / `SERVER_PORT` deployment overrides
//! 2. Environment variables (VOICE_SERVER__HOST, VOICE_AUDIO__FRAME_SIZE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Complete client configuration.
///
/// ## Why separate config structs:
/// The signaling timers, the audio pipeline and the server address change for
/// different reasons, so each group gets its own section in config.toml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub signaling: SignalingConfig,
    pub audio: AudioConfig,
    pub video: VideoConfig,
    pub auth: AuthConfig,
}

/// Where the session server lives.
///
/// ## Fields:
/// - `host`: IP address or hostname of the backend
/// - `port`: TCP port shared by the REST API and the WebSocket endpoint
/// - `secure`: use `https`/`wss` instead of `http`/`ws`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

/// Signaling channel timers, all in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingConfig {
    pub ping_interval_secs: u64,
    pub health_check_interval_secs: u64,
    pub reconnect_delay_secs: u64,
    pub connect_timeout_secs: u64,
}

/// Audio capture and playback settings.
///
/// ## Sample rates:
/// Capture and playback rates are independent on purpose. The observed client
/// captured at 48 kHz and built playback buffers at 16 kHz; both are exposed
/// here instead of being hard-coded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub capture_channels: u16,
    /// Samples per outbound frame (per channel)
    pub frame_size: usize,
    pub playback_sample_rate: u32,
    pub playback_mode: PlaybackMode,
    /// Initial volume, 0-100
    pub default_volume: u8,
}

/// How received frames are handed to the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackMode {
    /// Every frame starts as soon as it arrives, independent of the others
    Immediate,
    /// Frames are given consecutive start offsets so they neither overlap nor gap
    Scheduled,
}

/// Camera capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub ideal_width: u32,
    pub ideal_height: u32,
}

/// Bearer token persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// File the bearer token is read from and written back to on refresh.
    /// `None` keeps the token in memory only.
    pub token_path: Option<String>,
    /// Local user id announced with video/screen-share messages
    pub user_id: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                secure: true,
            },
            signaling: SignalingConfig {
                ping_interval_secs: 15,
                health_check_interval_secs: 30,
                reconnect_delay_secs: 3,
                connect_timeout_secs: 5,
            },
            audio: AudioConfig {
                capture_sample_rate: 48_000,
                capture_channels: 2,
                frame_size: 4096,
                playback_sample_rate: 16_000,
                playback_mode: PlaybackMode::Immediate,
                default_volume: 100,
            },
            video: VideoConfig {
                ideal_width: 1280,
                ideal_height: 720,
            },
            auth: AuthConfig {
                token_path: None,
                user_id: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `VOICE_SERVER__HOST=10.0.0.5`: Override server host
    /// - `VOICE_AUDIO__PLAYBACK_MODE=scheduled`: Switch playback scheduling on
    /// - `SERVER_IP=10.0.0.5` / `SERVER_PORT=8000`: Deployment shortcuts
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("VOICE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("SERVER_IP") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("SERVER_PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let timers = [
            ("ping_interval_secs", self.signaling.ping_interval_secs),
            ("health_check_interval_secs", self.signaling.health_check_interval_secs),
            ("reconnect_delay_secs", self.signaling.reconnect_delay_secs),
            ("connect_timeout_secs", self.signaling.connect_timeout_secs),
        ];
        for (name, value) in timers {
            if value == 0 {
                return Err(anyhow::anyhow!("Signaling timer {} must be greater than 0", name));
            }
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if !(1..=2).contains(&self.audio.capture_channels) {
            return Err(anyhow::anyhow!("Capture channel count must be 1 or 2"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Audio frame size must be greater than 0"));
        }

        if self.audio.default_volume > 100 {
            return Err(anyhow::anyhow!("Default volume must be between 0 and 100"));
        }

        Ok(())
    }

    /// Base URL for REST calls, e.g. `https://127.0.0.1:8000`.
    pub fn api_base_url(&self) -> String {
        let scheme = if self.server.secure { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server.host, self.server.port)
    }

    /// Base URL for the signaling socket, e.g. `wss://127.0.0.1:8000`.
    pub fn ws_base_url(&self) -> String {
        let scheme = if self.server.secure { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.server.host, self.server.port)
    }
}

impl SignalingConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
