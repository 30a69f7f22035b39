//! # Voice Session Controller
//!
//! Client side of a voice channel: joins over a WebSocket signaling channel,
//! streams compressed microphone audio, plays back what the server relays, and
//! keeps the participant roster, mute/deafen/video/screen-share flags and the
//! connection lifecycle consistent across reconnects, token refreshes and
//! teardown.
//!
//! ## Layout:
//! - **controller**: the synchronous session state machine (no I/O)
//! - **runtime**: tokio event loop that executes the controller's effects
//! - **transport** / **api**: WebSocket and REST collaborators
//! - **audio** / **media**: capture, DSP, playback and device access
//! - **protocol** / **roster** / **session** / **preview**: data model

pub mod api;
pub mod audio;
pub mod auth;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod media;
pub mod preview;
pub mod protocol;
pub mod roster;
pub mod runtime;
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use controller::{Effect, Toggled, VoiceController};
pub use error::{VoiceError, VoiceResult};
pub use runtime::{Command, Runtime};
