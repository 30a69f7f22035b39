//! # Signaling Channel
//!
//! Owns the transport to the session server and every timer tied to it.
//!
//! ## Connect attempts:
//! Each connect is numbered. Transport events carry the attempt number they
//! belong to and are ignored once a newer attempt (or a leave) superseded it;
//! a late-opening stale socket is closed with code 1000 immediately.
//!
//! ## Timers (deadlines polled by the controller):
//! - **connect timeout**: 5 s after the attempt starts, cleared on open
//! - **ping**: every 15 s, sends `ping` while the transport is open
//! - **health check**: every 30 s, reports when the transport is not open
//! - **reconnect**: 3 s after a transient failure; more than one may be pending
//!
//! ## Close codes:
//! | code  | meaning                  | reconnect |
//! |-------|--------------------------|-----------|
//! | 4000  | authentication failed    | no        |
//! | 4001  | invalid voice channel    | no        |
//! | 4002  | not a member             | no        |
//! | 4003  | user not found           | no        |
//! | 1006  | connection lost          | yes       |
//! | 1000  | normal closure           | no        |
//! | other | unexpected closure       | yes       |

use crate::config::SignalingConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::SignalMessage;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Abnormal closure reported by the client side when the socket drops.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Text shown when the connect timeout fires.
pub const TIMEOUT_MESSAGE: &str = "Connection timeout. Please try again.";

/// An open (or opening) bidirectional message transport.
pub trait Transport {
    fn is_open(&self) -> bool;

    fn send_text(&mut self, text: String) -> VoiceResult<()>;

    /// Close with a status code. Must be safe to call on a closed transport.
    fn close(&mut self, code: u16, reason: &str);
}

/// How a close code is handled.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseOutcome {
    pub code: u16,
    pub error: VoiceError,
    pub reconnect: bool,
}

impl CloseOutcome {
    pub fn message(&self) -> String {
        self.error.user_message()
    }
}

/// Map a close code and reason to the user-visible error and the reconnect policy.
pub fn classify_close(code: u16, reason: &str) -> CloseOutcome {
    let (error, reconnect) = match code {
        4000 => (VoiceError::Authentication("Authentication failed. Please log in again.".into()), false),
        4001 => (VoiceError::Authorization("Invalid voice channel.".into()), false),
        4002 => (VoiceError::Authorization("You are not a member of this server.".into()), false),
        4003 => (VoiceError::Authentication("User not found. Please log in again.".into()), false),
        CLOSE_ABNORMAL => (VoiceError::Connection("Connection lost. Attempting to reconnect...".into()), true),
        other => {
            let reason = if reason.trim().is_empty() { "Unknown error" } else { reason };
            let message = format!("Connection closed: {}", reason);
            (VoiceError::Connection(message), other != CLOSE_NORMAL)
        }
    };
    CloseOutcome { code, error, reconnect }
}

/// Timer that came due during [`SignalingChannel::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    ConnectTimeout,
    Ping,
    HealthCheck,
    Reconnect,
}

#[derive(Debug, Clone, Default)]
struct Timers {
    connect_deadline: Option<Instant>,
    next_ping: Option<Instant>,
    next_health_check: Option<Instant>,
    reconnects: Vec<Instant>,
}

impl Timers {
    fn clear_session_timers(&mut self) {
        self.connect_deadline = None;
        self.next_ping = None;
        self.next_health_check = None;
    }

    fn next_deadline(&self) -> Option<Instant> {
        [self.connect_deadline, self.next_ping, self.next_health_check]
            .into_iter()
            .flatten()
            .chain(self.reconnects.iter().copied())
            .min()
    }
}

/// Transport plus timers for the current connect attempt.
pub struct SignalingChannel {
    config: SignalingConfig,
    transport: Option<Box<dyn Transport>>,
    attempt: Option<u64>,
    next_attempt: u64,
    timers: Timers,
    last_pong: Option<Instant>,
}

impl SignalingChannel {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            config,
            transport: None,
            attempt: None,
            next_attempt: 1,
            timers: Timers::default(),
            last_pong: None,
        }
    }

    /// `{ws_base}/ws/voice/{channel_id}?token={token}`
    pub fn endpoint_url(ws_base: &str, channel_id: &str, token: &str) -> String {
        format!(
            "{}/ws/voice/{}?token={}",
            ws_base.trim_end_matches('/'),
            urlencoding::encode(channel_id),
            urlencoding::encode(token)
        )
    }

    /// Start a new attempt, superseding any previous one.
    ///
    /// Arms the connect timeout and the ping / health-check intervals.
    pub fn begin_attempt(&mut self, now: Instant) -> u64 {
        if let Some(mut previous) = self.transport.take() {
            debug!(attempt = ?self.attempt, "Closing transport of superseded attempt");
            previous.close(CLOSE_NORMAL, "Superseded by new connection");
        }

        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.attempt = Some(attempt);

        self.timers.connect_deadline = Some(now + self.config.connect_timeout());
        self.timers.next_ping = Some(now + self.config.ping_interval());
        self.timers.next_health_check = Some(now + self.config.health_check_interval());
        debug!(attempt, "Connect attempt started");
        attempt
    }

    pub fn current_attempt(&self) -> Option<u64> {
        self.attempt
    }

    pub fn is_current(&self, attempt: u64) -> bool {
        self.attempt == Some(attempt)
    }

    /// Take ownership of the transport that opened for `attempt`.
    ///
    /// Returns false (and closes the transport) if the attempt is stale.
    pub fn attach(&mut self, attempt: u64, mut transport: Box<dyn Transport>) -> bool {
        if !self.is_current(attempt) {
            debug!(attempt, current = ?self.attempt, "Closing transport from stale attempt");
            transport.close(CLOSE_NORMAL, "Stale connection");
            return false;
        }
        self.timers.connect_deadline = None;
        self.transport = Some(transport);
        true
    }

    pub fn is_open(&self) -> bool {
        self.transport.as_ref().map(|t| t.is_open()).unwrap_or(false)
    }

    /// Serialize and send one message. Nothing is queued while the transport is closed.
    pub fn send(&mut self, message: &SignalMessage) -> VoiceResult<()> {
        let transport = match self.transport.as_mut() {
            Some(t) if t.is_open() => t,
            _ => {
                debug!(message_type = message.type_name(), "Dropping message, transport not open");
                return Err(VoiceError::NotConnected);
            }
        };
        let text = message.encode()?;
        transport.send_text(text)
    }

    /// The transport for `attempt` closed. Returns false for stale attempts.
    pub fn release(&mut self, attempt: u64) -> bool {
        if !self.is_current(attempt) {
            return false;
        }
        self.transport = None;
        self.attempt = None;
        self.timers.clear_session_timers();
        true
    }

    /// Give up on the current attempt after a connect timeout.
    pub fn abandon_attempt(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close(CLOSE_NORMAL, "Connection timeout");
        }
        self.attempt = None;
        self.timers.clear_session_timers();
    }

    /// Schedule one reconnect after the configured delay.
    pub fn schedule_reconnect(&mut self, now: Instant) {
        let at = now + self.config.reconnect_delay();
        info!(delay_secs = self.config.reconnect_delay_secs, "Reconnect scheduled");
        self.timers.reconnects.push(at);
    }

    pub fn pending_reconnects(&self) -> usize {
        self.timers.reconnects.len()
    }

    pub fn record_pong(&mut self, now: Instant) {
        self.last_pong = Some(now);
    }

    pub fn last_pong(&self) -> Option<Instant> {
        self.last_pong
    }

    /// Collect every timer that is due at `now`, re-arming the intervals.
    pub fn poll(&mut self, now: Instant) -> Vec<TimerEvent> {
        let mut fired = Vec::new();

        if self.timers.connect_deadline.is_some_and(|t| t <= now) {
            self.timers.connect_deadline = None;
            fired.push(TimerEvent::ConnectTimeout);
        }

        if let Some(at) = self.timers.next_ping {
            if at <= now {
                self.timers.next_ping = Some(now + self.config.ping_interval());
                fired.push(TimerEvent::Ping);
            }
        }

        if let Some(at) = self.timers.next_health_check {
            if at <= now {
                self.timers.next_health_check = Some(now + self.config.health_check_interval());
                fired.push(TimerEvent::HealthCheck);
            }
        }

        let before = self.timers.reconnects.len();
        self.timers.reconnects.retain(|t| *t > now);
        for _ in self.timers.reconnects.len()..before {
            fired.push(TimerEvent::Reconnect);
        }

        fired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Leave: best-effort `leave`, close with 1000, cancel every timer
    /// including pending reconnects. Returns true if anything was torn down.
    pub fn shutdown(&mut self) -> bool {
        let had_anything = self.transport.is_some()
            || self.attempt.is_some()
            || self.timers.next_deadline().is_some();

        if self.is_open() {
            if let Err(e) = self.send(&SignalMessage::Leave) {
                warn!("Failed to send leave: {}", e);
            }
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close(CLOSE_NORMAL, "User left channel");
        }
        self.attempt = None;
        self.timers = Timers::default();
        self.last_pong = None;
        had_anything
    }
}
