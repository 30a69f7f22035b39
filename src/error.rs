//! # Error Handling
//!
//! This module defines the error type shared by every part of the voice session
//! controller and the rules for how each kind of failure is treated.
//!
//! ## Error Categories:
//! - **Authentication**: token refresh failed or the server rejected the user
//!   (close codes 4000/4003). Fatal to the session, the user has to log in again.
//! - **Authorization**: invalid channel or not a member (4001/4002). Fatal to the channel.
//! - **Connection**: lost or timed-out transport (1006 and other unexpected closes).
//!   Recovered automatically through a scheduled reconnect.
//! - **Device**: missing or denied microphone, camera or screen source. The feature
//!   stays disabled, the session keeps running.
//! - **Protocol**: malformed inbound JSON, base64 or PCM. Logged and dropped.
//!
//! ## Propagation:
//! Failures are caught where they happen and turned into a user-visible status
//! string plus a state transition. Nothing in here is allowed to escape a timer
//! or transport callback.

use std::fmt;

/// Errors produced by the voice session controller.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(VoiceError::Device("Selected audio device not found".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceError {
    /// Token refresh failed or the server reported an unknown/unauthenticated user
    Authentication(String),

    /// Channel does not exist or the user is not allowed into it
    Authorization(String),

    /// Transport-level failure that a reconnect may recover from
    Connection(String),

    /// Microphone, camera or display source is missing or permission was denied
    Device(String),

    /// Inbound data could not be decoded
    Protocol(String),

    /// A message was sent while the transport was not open (never queued)
    NotConnected,

    /// Configuration file or environment variable problems
    Config(String),

    /// Anything that does not fit the categories above
    Internal(String),
}

impl VoiceError {
    /// Whether the failure is recovered by scheduling a reconnect.
    ///
    /// Only transient connectivity problems qualify; authentication and
    /// authorization failures require user action and are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VoiceError::Connection(_))
    }

    /// Short machine-readable kind, used in logs and status snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::Authentication(_) => "authentication",
            VoiceError::Authorization(_) => "authorization",
            VoiceError::Connection(_) => "connection",
            VoiceError::Device(_) => "device",
            VoiceError::Protocol(_) => "protocol",
            VoiceError::NotConnected => "not_connected",
            VoiceError::Config(_) => "config",
            VoiceError::Internal(_) => "internal",
        }
    }

    /// The text shown to the user for this error.
    ///
    /// For most variants this is the message itself; the server-side close texts
    /// ("You are not a member of this server.") are stored verbatim.
    pub fn user_message(&self) -> String {
        match self {
            VoiceError::Authentication(msg)
            | VoiceError::Authorization(msg)
            | VoiceError::Connection(msg)
            | VoiceError::Device(msg)
            | VoiceError::Protocol(msg)
            | VoiceError::Config(msg)
            | VoiceError::Internal(msg) => msg.clone(),
            VoiceError::NotConnected => "Not connected to the voice channel.".to_string(),
        }
    }
}

impl fmt::Display for VoiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceError::Authentication(msg) => write!(f, "Authentication error: {}", msg),
            VoiceError::Authorization(msg) => write!(f, "Authorization error: {}", msg),
            VoiceError::Connection(msg) => write!(f, "Connection error: {}", msg),
            VoiceError::Device(msg) => write!(f, "Device error: {}", msg),
            VoiceError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            VoiceError::NotConnected => write!(f, "Transport is not open"),
            VoiceError::Config(msg) => write!(f, "Configuration error: {}", msg),
            VoiceError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for VoiceError {}

/// Automatic conversion from anyhow::Error to VoiceError.
impl From<anyhow::Error> for VoiceError {
    fn from(err: anyhow::Error) -> Self {
        VoiceError::Internal(err.to_string())
    }
}

/// Malformed JSON always comes from the other side of the wire, so it is a
/// protocol error rather than an internal one.
impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Protocol(format!("Invalid base64 audio payload: {}", err))
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        VoiceError::Connection(format!("HTTP request failed: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::Connection(format!("WebSocket error: {}", err))
    }
}

impl From<std::io::Error> for VoiceError {
    fn from(err: std::io::Error) -> Self {
        VoiceError::Internal(format!("I/O error: {}", err))
    }
}

/// Shorthand for `Result<T, VoiceError>`.
pub type VoiceResult<T> = Result<T, VoiceError>;
