//! Signals fed to the driver by the client that owns audio and the socket

use serde::{Deserialize, Serialize};

/// Observations from the outside world
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// Server connection is up
    ConnectionReady,
    /// Server connection failed or dropped
    ConnectionLost,
    /// Microphone level crossed the speech threshold
    RecordingStarted,
    /// Microphone went quiet again
    RecordingStopped,
    /// A response arrived; `id` identifies the payload for de-duplication
    Response { id: String },
    /// User tapped the screen
    Tap,
    /// Explicit interrupt request
    Interrupt,
    /// Explicit reconnect request
    Retry,
    /// User ended the call
    HangUp,
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::ConnectionReady => write!(f, "CONNECTION_READY"),
            Signal::ConnectionLost => write!(f, "CONNECTION_LOST"),
            Signal::RecordingStarted => write!(f, "RECORDING_STARTED"),
            Signal::RecordingStopped => write!(f, "RECORDING_STOPPED"),
            Signal::Response { id } => write!(f, "RESPONSE ({id})"),
            Signal::Tap => write!(f, "TAP"),
            Signal::Interrupt => write!(f, "INTERRUPT"),
            Signal::Retry => write!(f, "RETRY"),
            Signal::HangUp => write!(f, "HANG_UP"),
        }
    }
}
