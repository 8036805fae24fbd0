//! Presentation phase derivation.
//!
//! Collapses the bootstrap, connection, and protocol outputs into the single
//! composite phase the consumer renders. Pure: same inputs, same phase.

use crate::chat::connection::ConnState;

/// Composite presentation phase for one chat binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatPhase {
    /// History and session state are still being fetched.
    LoadingHistory,
    /// First dial in flight.
    Connecting,
    /// Live and ready for outbound sends.
    ConnectedIdle,
    /// Live, counterpart is composing.
    ConnectedTyping,
    /// Abnormal close observed; attempt number is 1-based.
    Reconnecting { attempt: u32 },
    /// Session over (closed at bootstrap, terminal event, or normal close).
    Ended,
    /// Reconnect budget exhausted; manual user action required.
    Failed,
}

impl ChatPhase {
    /// Terminal phases never change again for the binding's lifetime.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Outbound sends are permitted only while connected and not typing.
    pub fn can_send(&self) -> bool {
        matches!(self, Self::ConnectedIdle)
    }
}

impl std::fmt::Display for ChatPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoadingHistory => write!(f, "loading_history"),
            Self::Connecting => write!(f, "connecting"),
            Self::ConnectedIdle => write!(f, "connected_idle"),
            Self::ConnectedTyping => write!(f, "connected_typing"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting(attempt {attempt})"),
            Self::Ended => write!(f, "ended"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Everything the phase is derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInputs {
    /// History load resolved (success or failure).
    pub history_loaded: bool,
    pub conn: ConnState,
    /// Current reconnect attempt count.
    pub attempts: u32,
    /// Counterpart typing indicator.
    pub typing: bool,
    /// Session over: closed at bootstrap or terminal event received.
    pub ended: bool,
    /// Cleared by normal close, caller teardown, or terminal event.
    pub allow_reconnect: bool,
}

/// Derive the composite phase.
pub fn derive(inputs: &StateInputs) -> ChatPhase {
    if inputs.ended {
        return ChatPhase::Ended;
    }
    if !inputs.history_loaded {
        return ChatPhase::LoadingHistory;
    }
    match inputs.conn {
        ConnState::Terminated => ChatPhase::Failed,
        ConnState::Reconnecting => ChatPhase::Reconnecting {
            attempt: inputs.attempts,
        },
        ConnState::Connecting => ChatPhase::Connecting,
        ConnState::Open => {
            if inputs.typing {
                ChatPhase::ConnectedTyping
            } else {
                ChatPhase::ConnectedIdle
            }
        }
        // Before the first dial the channel reads as connecting; after a
        // normal close (reconnect permanently off) the session is over.
        ConnState::Disconnected => {
            if inputs.allow_reconnect {
                ChatPhase::Connecting
            } else {
                ChatPhase::Ended
            }
        }
    }
}
