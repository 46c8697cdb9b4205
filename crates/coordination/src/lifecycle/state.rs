//! Worker lifecycle states and their transition table

use std::fmt;

use serde::{Deserialize, Serialize};

use super::LifecycleError;

/// Lifecycle of one worker process
///
/// ```text
/// Start ──► Serve ──► Drain ──► Exit
///   │                            ▲
///   └────────────────────────────┘  (start-up failure)
/// ```
///
/// No cycles: a restarted process begins again at `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Launching the backend and registering
    Start,
    /// Heartbeating and serving sessions
    Serve,
    /// Refusing new sessions and waiting for open ones
    Drain,
    /// Deregistered, backend stopped
    Exit,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Serve => "serve",
            Self::Drain => "drain",
            Self::Exit => "exit",
        }
    }

    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (Self::Start, Self::Serve)
                | (Self::Start, Self::Exit)
                | (Self::Serve, Self::Drain)
                | (Self::Drain, Self::Exit)
        )
    }

    /// Return `next` if the table allows it
    pub fn transition(self, next: LifecycleState) -> Result<LifecycleState, LifecycleError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(LifecycleError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::Exit
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
