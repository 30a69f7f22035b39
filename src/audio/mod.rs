//! # Audio Module
//!
//! Everything between the microphone and the signaling socket, and between
//! the socket and the speakers.
//!
//! ## Key Components:
//! - **Processor**: compressor, gain, clipping and PCM16 framing
//! - **Buffer**: accumulates device blocks into fixed-size frames
//! - **Capture**: microphone lifecycle and outbound frame gating
//! - **Playback**: decoding, volume/deafen gain and output scheduling
//! - **Device**: input/output inventory and selection
//!
//! ## Wire Format:
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: Mono (first input channel only)
//! - **Encoding**: base64 inside `audio` JSON messages

pub mod buffer;       // Fixed-size frame accumulation
pub mod capture;      // Microphone capture and frame gating
pub mod device;       // Device inventory and selection
pub mod playback;     // Inbound audio playback
pub mod processor;    // Dynamics, clipping and PCM codec

#[cfg(feature = "hardware")]
pub mod backend;      // cpal devices
