//! # Voice Session State
//!
//! Everything the user interface observes about the current voice session:
//! connection phase, local media flags, volume, the remote roster and the last
//! user-facing error.
//!
//! ## Connection Lifecycle:
//! 1. **Disconnected**: no transport; initial state and the state after any failure
//! 2. **Connecting**: token refresh and socket handshake in flight
//! 3. **Connected**: socket open and `join` sent; carries the server's echo-mode flag
//!
//! Echo mode only exists while connected, so it lives inside the `Connected`
//! variant instead of next to it.

use crate::audio::playback::Volume;
use crate::protocol::{Participant, SignalMessage};
use crate::roster::Roster;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Where the signaling connection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected { echo_mode: bool },
}

impl ConnectionPhase {
    /// Status string used in snapshots and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Disconnected => "disconnected",
            ConnectionPhase::Connecting => "connecting",
            ConnectionPhase::Connected { .. } => "connected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionPhase::Connected { .. })
    }

    pub fn echo_mode(&self) -> bool {
        matches!(self, ConnectionPhase::Connected { echo_mode: true })
    }
}

/// Counters for one controller's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub connect_attempts: u32,
    pub reconnects_scheduled: u32,
    pub frames_sent: u64,
    /// Processed while muted and never sent
    pub frames_suppressed: u64,
    /// Processed while the transport was not open
    pub frames_offline: u64,
    pub frames_played: u64,
    /// Received while deafened or at zero volume
    pub frames_discarded: u64,
    pub protocol_errors: u32,
}

/// Mutable session state owned by the controller.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: Uuid,
    pub channel_id: String,
    phase: ConnectionPhase,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub volume: Volume,
    pub roster: Roster,
    last_error: Option<String>,
    pub stats: SessionStats,
    pub created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new(channel_id: impl Into<String>, volume: Volume) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            channel_id: channel_id.into(),
            phase: ConnectionPhase::Disconnected,
            is_muted: false,
            is_deafened: false,
            is_video_enabled: false,
            is_screen_sharing: false,
            volume,
            roster: Roster::new(),
            last_error: None,
            stats: SessionStats::default(),
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn set_connecting(&mut self) {
        debug!(from = self.phase.as_str(), "Phase -> connecting");
        self.phase = ConnectionPhase::Connecting;
    }

    /// Enter `Connected`, keeping the echo flag if already connected.
    pub fn set_connected(&mut self) {
        if self.phase.is_connected() {
            return;
        }
        debug!(from = self.phase.as_str(), "Phase -> connected");
        self.phase = ConnectionPhase::Connected { echo_mode: false };
        self.connected_at = Some(Utc::now());
    }

    pub fn set_disconnected(&mut self) {
        if self.phase != ConnectionPhase::Disconnected {
            debug!(from = self.phase.as_str(), "Phase -> disconnected");
        }
        self.phase = ConnectionPhase::Disconnected;
        self.connected_at = None;
    }

    /// Update the echo flag. Ignored unless connected.
    pub fn set_echo_mode(&mut self, echo_mode: bool) {
        if let ConnectionPhase::Connected { echo_mode: current } = &mut self.phase {
            *current = echo_mode;
        }
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.last_error = Some(message.into());
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Video and screen-share flags go false whenever the transport is lost.
    pub fn clear_visual_flags(&mut self) {
        self.is_video_enabled = false;
        self.is_screen_sharing = false;
    }

    /// Leaving destroys the session: media flags and the roster reset, volume
    /// and the last error survive.
    pub fn reset_after_leave(&mut self) {
        self.set_disconnected();
        self.is_muted = false;
        self.is_deafened = false;
        self.clear_visual_flags();
        self.roster.clear();
    }

    /// Apply a remote member's `*_state` / `video_*` / `screen_share_*` message to
    /// the roster. Returns false if the message is not a per-user update or the
    /// user is unknown.
    pub fn apply_member_update(&mut self, message: &SignalMessage) -> bool {
        let (user_id, flag, value) = match message {
            SignalMessage::MuteState { is_muted, user_id: Some(id) } => (id, MemberFlag::Muted, *is_muted),
            SignalMessage::DeafenState { is_deafened, user_id: Some(id) } => {
                (id, MemberFlag::Deafened, *is_deafened)
            }
            SignalMessage::VideoState { is_enabled, user_id: Some(id) } => (id, MemberFlag::Video, *is_enabled),
            SignalMessage::ScreenShareState { is_enabled, user_id: Some(id) } => {
                (id, MemberFlag::ScreenShare, *is_enabled)
            }
            SignalMessage::VideoStart { user_id: Some(id) } => (id, MemberFlag::Video, true),
            SignalMessage::VideoStop { user_id: Some(id) } => (id, MemberFlag::Video, false),
            SignalMessage::ScreenShareStart { user_id: Some(id) } => (id, MemberFlag::ScreenShare, true),
            SignalMessage::ScreenShareStop { user_id: Some(id) } => (id, MemberFlag::ScreenShare, false),
            _ => return false,
        };

        let Some(participant) = self.roster.get_mut(user_id) else {
            return false;
        };
        match flag {
            MemberFlag::Muted => participant.is_muted = value,
            MemberFlag::Deafened => participant.is_deafened = value,
            MemberFlag::Video => participant.is_video_enabled = value,
            MemberFlag::ScreenShare => participant.is_screen_sharing = value,
        }
        true
    }

    pub fn uptime_seconds(&self) -> i64 {
        self.connected_at
            .map(|t| Utc::now().signed_duration_since(t).num_seconds())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy)]
enum MemberFlag {
    Muted,
    Deafened,
    Video,
    ScreenShare,
}

/// Serializable view of the session for status output.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub channel_id: String,
    pub status: &'static str,
    pub is_echo_mode: bool,
    pub join_flow: &'static str,
    pub transport_open: bool,
    pub is_muted: bool,
    pub is_deafened: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub volume: Volume,
    pub participants: Vec<Participant>,
    pub last_error: Option<String>,
    pub selected_input: Option<String>,
    pub selected_output: Option<String>,
    pub stats: SessionStats,
    pub uptime_seconds: i64,
    pub timestamp: String,
}
