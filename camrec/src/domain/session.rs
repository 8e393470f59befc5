//! Capture session state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle states of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The capture process is being launched and has not opened a segment yet.
    #[default]
    Starting,
    /// The capture process is producing segments.
    Running,
    /// The capture process exited unexpectedly or stopped making progress.
    Crashed,
    /// A graceful stop was requested and is in progress.
    Stopping,
    /// The session is over. Terminal.
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Crashed => "crashed",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "crashed" => Some(Self::Crashed),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Whether the session still owns (or is about to own) a capture process.
    pub fn is_active(&self) -> bool {
        !matches!(self, Self::Stopped)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        match (self, target) {
            (from, to) if *from == to => true,

            (Starting, Running | Crashed | Stopping) => true,
            (Running, Crashed | Stopping) => true,

            // Automatic restart, or give up after a persistent fault.
            (Crashed, Starting | Stopping | Stopped) => true,

            (Stopping, Stopped) => true,

            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: SessionState) -> Result<SessionState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
