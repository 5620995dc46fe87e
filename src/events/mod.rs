//! Events broadcast by a call session
//!
//! Carries state changes for the UI and side-effect commands for whoever
//! owns audio capture and the server connection.

use serde::{Deserialize, Serialize};

use crate::state::{Effect, Event, State, Transition};

/// Why a call session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The user hung up
    HungUp,
    /// The signal source went away
    Closed,
}

/// Events emitted by the driver during a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    /// The machine entered a new state
    StateChanged {
        current: State,
        last: Option<State>,
        action: Event,
    },

    /// A transition asked for a side effect
    Command { command: Effect },

    /// The session is over and its machine discarded
    SessionEnded { reason: EndReason },
}

impl From<&Transition> for CallEvent {
    fn from(transition: &Transition) -> Self {
        CallEvent::StateChanged {
            current: transition.current,
            last: transition.last,
            action: transition.action,
        }
    }
}

impl std::fmt::Display for CallEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallEvent::StateChanged { current, last: Some(last), action } => {
                write!(f, "STATE_CHANGED ({last} -> {current} via {action})")
            }
            CallEvent::StateChanged { current, last: None, action } => {
                write!(f, "STATE_CHANGED (-> {current} via {action})")
            }
            CallEvent::Command { command } => write!(f, "COMMAND ({command:?})"),
            CallEvent::SessionEnded { reason } => write!(f, "SESSION_ENDED ({reason:?})"),
        }
    }
}
