//! # Join Flow and Routing
//!
//! The pre-join preview and the route guard.
//!
//! ## Flow:
//! Preview (participant snapshot loading/loaded) → Joined → Left,
//! or Preview → Dismissed when the user cancels.

use crate::protocol::Participant;

/// Where the user is in the join flow.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinFlow {
    /// Nothing shown yet
    Idle,
    /// Preview open; `participants` is `None` until the snapshot arrives
    Preview { participants: Option<Vec<Participant>> },
    Joined,
    /// Preview closed without joining
    Dismissed,
    Left,
}

impl JoinFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinFlow::Idle => "idle",
            JoinFlow::Preview { .. } => "preview",
            JoinFlow::Joined => "joined",
            JoinFlow::Dismissed => "dismissed",
            JoinFlow::Left => "left",
        }
    }

    pub fn begin_preview(&mut self) {
        *self = JoinFlow::Preview { participants: None };
    }

    /// Store the snapshot if the preview is still open. Returns false otherwise.
    pub fn set_snapshot(&mut self, list: Vec<Participant>) -> bool {
        match self {
            JoinFlow::Preview { participants } => {
                *participants = Some(list);
                true
            }
            _ => false,
        }
    }

    pub fn is_preview(&self) -> bool {
        matches!(self, JoinFlow::Preview { .. })
    }

    pub fn snapshot(&self) -> Option<&[Participant]> {
        match self {
            JoinFlow::Preview { participants: Some(list) } => Some(list),
            _ => None,
        }
    }

    pub fn join(&mut self) {
        *self = JoinFlow::Joined;
    }

    /// Close the preview without joining. Returns false if no preview was open.
    pub fn cancel(&mut self) -> bool {
        if self.is_preview() {
            *self = JoinFlow::Dismissed;
            true
        } else {
            false
        }
    }

    pub fn leave(&mut self) {
        if *self == JoinFlow::Joined {
            *self = JoinFlow::Left;
        }
    }
}

/// The voice view is mounted only under paths containing `/voice/`.
pub fn is_voice_route(path: &str) -> bool {
    path.contains("/voice/")
}

/// Text-channel route the UI returns to after leaving a voice route.
pub fn text_channel_route(path: &str) -> String {
    path.replacen("/voice/", "/", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_snapshot_only_while_open() {
        let mut flow = JoinFlow::Idle;
        assert!(!flow.set_snapshot(vec![]));

        flow.begin_preview();
        assert!(flow.snapshot().is_none());
        assert!(flow.set_snapshot(vec![Participant::new(1u64, "a")]));
        assert_eq!(flow.snapshot().map(|s| s.len()), Some(1));

        flow.join();
        assert!(!flow.set_snapshot(vec![]));
        assert!(!flow.cancel());
        flow.leave();
        assert_eq!(flow, JoinFlow::Left);
    }

    #[test]
    fn test_cancel_dismisses_preview() {
        let mut flow = JoinFlow::Idle;
        flow.begin_preview();
        assert!(flow.cancel());
        assert_eq!(flow.as_str(), "dismissed");
    }

    #[test]
    fn test_route_guard() {
        assert!(is_voice_route("/channels/3/voice/12"));
        assert!(!is_voice_route("/channels/3/12"));
        assert!(!is_voice_route("/voice"));
        assert_eq!(text_channel_route("/channels/3/voice/12"), "/channels/3/12");
    }
}
