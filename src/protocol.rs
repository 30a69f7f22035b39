//! # Signaling Protocol
//!
//! JSON messages exchanged with the voice session server over the signaling
//! socket. Every text frame is one JSON object with a `type` discriminator;
//! binary frames carry raw audio and never go through this module.
//!
//! ## Message Format:
//! - **Client → Server**: `join`, `leave`, `ping`, `pong`, `audio`, the `*_state`
//!   toggles and the `video_*` / `screen_share_*` announcements
//! - **Server → Client**: `participants`, `participant_joined`, `participant_left`,
//!   `connection_status`, `token_refresh`, `ping`, `pong`, `audio`, `echo`
//!
//! Field names follow the server's camelCase (`isEchoMode`, `userId`, `isMuted`).
//! There are no sequence numbers; ordering comes from the transport.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Identifier of a channel member.
///
/// The server sends ids as JSON numbers in some messages and strings in others,
/// so both are normalized to a string here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for ParticipantId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(text) => ParticipantId(text),
            RawId::Signed(n) => ParticipantId(n.to_string()),
            RawId::Unsigned(n) => ParticipantId(n.to_string()),
        })
    }
}

/// One remote member of the voice channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,

    #[serde(default)]
    pub username: String,

    /// Avatar reference (URL or asset key), if the user has one
    #[serde(default, alias = "avatar", alias = "avatar_url", skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,

    #[serde(default, alias = "is_muted")]
    pub is_muted: bool,

    #[serde(default, alias = "is_deafened")]
    pub is_deafened: bool,

    #[serde(default, alias = "is_video_enabled")]
    pub is_video_enabled: bool,

    #[serde(default, alias = "is_screen_sharing")]
    pub is_screen_sharing: bool,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            avatar_ref: None,
            is_muted: false,
            is_deafened: false,
            is_video_enabled: false,
            is_screen_sharing: false,
        }
    }

    /// Name shown in member lists; blank usernames render as "Unknown User".
    pub fn display_name(&self) -> &str {
        if self.username.trim().is_empty() {
            "Unknown User"
        } else {
            &self.username
        }
    }
}

/// Every message that can travel over the signaling socket as text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Join,
    Leave,
    Ping,
    Pong,

    /// One encoded audio frame (base64 of little-endian i16 PCM)
    Audio {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },

    /// Full roster snapshot
    #[serde(rename_all = "camelCase")]
    Participants {
        #[serde(default)]
        participants: Option<Vec<Participant>>,
        #[serde(default)]
        is_echo_mode: bool,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantJoined {
        #[serde(default)]
        participant: Option<Participant>,
        #[serde(default)]
        is_echo_mode: bool,
    },

    #[serde(rename_all = "camelCase")]
    ParticipantLeft {
        #[serde(default)]
        user_id: Option<ParticipantId>,
        #[serde(default)]
        is_echo_mode: bool,
    },

    ConnectionStatus {
        status: String,
    },

    TokenRefresh {
        token: String,
    },

    #[serde(rename_all = "camelCase")]
    VideoStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<ParticipantId>,
    },

    #[serde(rename_all = "camelCase")]
    VideoStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<ParticipantId>,
    },

    #[serde(rename_all = "camelCase")]
    ScreenShareStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<ParticipantId>,
    },

    #[serde(rename_all = "camelCase")]
    ScreenShareStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<ParticipantId>,
    },

    #[serde(rename_all = "camelCase")]
    MuteState {
        is_muted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<ParticipantId>,
    },

    #[serde(rename_all = "camelCase")]
    DeafenState {
        is_deafened: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<ParticipantId>,
    },

    #[serde(rename_all = "camelCase")]
    VideoState {
        is_enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<ParticipantId>,
    },

    #[serde(rename_all = "camelCase")]
    ScreenShareState {
        is_enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<ParticipantId>,
    },

    /// The server bouncing one of our own messages back (echo mode)
    Echo {
        #[serde(default)]
        original_message: Option<serde_json::Value>,
    },

    /// Any `type` this client does not know about
    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    /// Parse one inbound text frame.
    pub fn decode(text: &str) -> VoiceResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serialize for an outbound text frame.
    pub fn encode(&self) -> VoiceResult<String> {
        serde_json::to_string(self)
            .map_err(|e| VoiceError::Internal(format!("Failed to encode {}: {}", self.type_name(), e)))
    }

    /// Wire name of the message type, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            SignalMessage::Join => "join",
            SignalMessage::Leave => "leave",
            SignalMessage::Ping => "ping",
            SignalMessage::Pong => "pong",
            SignalMessage::Audio { .. } => "audio",
            SignalMessage::Participants { .. } => "participants",
            SignalMessage::ParticipantJoined { .. } => "participant_joined",
            SignalMessage::ParticipantLeft { .. } => "participant_left",
            SignalMessage::ConnectionStatus { .. } => "connection_status",
            SignalMessage::TokenRefresh { .. } => "token_refresh",
            SignalMessage::VideoStart { .. } => "video_start",
            SignalMessage::VideoStop { .. } => "video_stop",
            SignalMessage::ScreenShareStart { .. } => "screen_share_start",
            SignalMessage::ScreenShareStop { .. } => "screen_share_stop",
            SignalMessage::MuteState { .. } => "mute_state",
            SignalMessage::DeafenState { .. } => "deafen_state",
            SignalMessage::VideoState { .. } => "video_state",
            SignalMessage::ScreenShareState { .. } => "screen_share_state",
            SignalMessage::Echo { .. } => "echo",
            SignalMessage::Unknown => "unknown",
        }
    }

    /// Audio payload carried inside an `echo`, if the echoed message was `audio`.
    ///
    /// Echoed audio is played exactly like a direct `audio` message; anything
    /// else inside an echo is ignored.
    pub fn echoed_audio(&self) -> Option<&str> {
        let SignalMessage::Echo { original_message: Some(original) } = self else {
            return None;
        };
        if original.get("type").and_then(|t| t.as_str()) != Some("audio") {
            return None;
        }
        original.get("data").and_then(|d| d.as_str()).filter(|d| !d.is_empty())
    }
}
