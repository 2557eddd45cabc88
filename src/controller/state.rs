//! Device state enum and per-conversation session flags.

use std::fmt;

/// The single device-wide state.  Exactly one value is active at a time and
/// transitions happen only through the conversation controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unknown,
    Starting,
    Idle,
    Connecting,
    Listening,
    Speaking,
    /// Waiting for the user to confirm an activation code.
    Activating,
    /// Terminal: requires a restart.
    Error,
}

impl DeviceState {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Starting => "starting",
            DeviceState::Idle => "idle",
            DeviceState::Connecting => "connecting",
            DeviceState::Listening => "listening",
            DeviceState::Speaking => "speaking",
            DeviceState::Activating => "activating",
            DeviceState::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceState::Error)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Flags scoped to one conversation, created on a successful handshake and
/// destroyed when the channel closes.
#[derive(Debug, Clone, Default)]
pub struct ConversationSession {
    /// Identifier assigned by the server hello, echoed on control messages.
    pub session_id: Option<String>,
    /// Auto-resume listening when the server finishes speaking.
    pub keep_listening: bool,
    /// Suppress further playback until the next listening turn.
    pub aborted: bool,
}

impl ConversationSession {
    pub fn new(session_id: Option<String>, keep_listening: bool) -> Self {
        Self {
            session_id,
            keep_listening,
            aborted: false,
        }
    }
}
