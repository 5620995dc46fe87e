//! States, events and the static transition table
//!
//! ```text
//! Calling ──connectionReady──> Welcome ──finishWelcome/interrupt──> Listening
//!                                                                     │  ↑
//!                                                          userSpeaking  finishSpeaking/interrupt
//!                                                                     ↓  │
//!                               Thinking ──receiveResponse──> Speaking ─┘
//!
//! any (except NetworkError) ──connectionLost──> NetworkError ──retry──> Reconnecting
//! Reconnecting ──connectionReady──> Calling
//! ```

use serde::{Deserialize, Serialize};

/// The seven states a voice call can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Dialing, waiting for the connection to come up
    Calling,
    /// Playing the welcome prompt
    Welcome,
    /// User finished talking, waiting for the server response
    Thinking,
    /// Playing the streamed reply
    Speaking,
    /// Waiting for the user to talk
    Listening,
    /// Connection failed or dropped
    NetworkError,
    /// Retry requested, waiting for the connection to come back
    Reconnecting,
}

impl State {
    /// Every state, in declaration order
    pub const ALL: [State; 7] = [
        State::Calling,
        State::Welcome,
        State::Thinking,
        State::Speaking,
        State::Listening,
        State::NetworkError,
        State::Reconnecting,
    ];

    /// Wire name of the state
    pub fn as_str(self) -> &'static str {
        match self {
            State::Calling => "calling",
            State::Welcome => "welcome",
            State::Thinking => "thinking",
            State::Speaking => "speaking",
            State::Listening => "listening",
            State::NetworkError => "network_error",
            State::Reconnecting => "reconnecting",
        }
    }

    /// Parse a wire name back into a state
    pub fn from_name(name: &str) -> Option<State> {
        State::ALL.into_iter().find(|state| state.as_str() == name)
    }

    /// States the user may interrupt by tapping the screen
    pub fn is_interruptible(self) -> bool {
        matches!(self, State::Welcome | State::Thinking | State::Speaking)
    }

    /// Events that have a table entry from this state
    pub fn permitted_events(self) -> Vec<Event> {
        Event::ALL
            .into_iter()
            .filter(|event| rule(self, *event).is_some())
            .collect()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::Calling
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Signals that drive the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Event {
    ConnectionReady,
    ConnectionLost,
    FinishWelcome,
    Interrupt,
    UserSpeaking,
    ReceiveResponse,
    FinishSpeaking,
    Retry,
}

impl Event {
    /// Every event, in declaration order
    pub const ALL: [Event; 8] = [
        Event::ConnectionReady,
        Event::ConnectionLost,
        Event::FinishWelcome,
        Event::Interrupt,
        Event::UserSpeaking,
        Event::ReceiveResponse,
        Event::FinishSpeaking,
        Event::Retry,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Event::ConnectionReady => "connectionReady",
            Event::ConnectionLost => "connectionLost",
            Event::FinishWelcome => "finishWelcome",
            Event::Interrupt => "interrupt",
            Event::UserSpeaking => "userSpeaking",
            Event::ReceiveResponse => "receiveResponse",
            Event::FinishSpeaking => "finishSpeaking",
            Event::Retry => "retry",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Calls out to the driver that accompany a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Begin capturing microphone audio
    StartListening,
    /// Drop the pending or playing server response
    ClearResponse,
    /// Re-establish the server connection
    Reconnect,
}

/// A single row of the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub target: State,
    /// Effects in invocation order
    pub effects: &'static [Effect],
}

const NONE: &[Effect] = &[];
const START_LISTENING: &[Effect] = &[Effect::StartListening];
const INTERRUPT_AND_LISTEN: &[Effect] = &[Effect::ClearResponse, Effect::StartListening];
const RECONNECT: &[Effect] = &[Effect::Reconnect];

/// Look up the table entry for `(state, event)`
///
/// Returns `None` for pairs the table does not list; callers treat that as a
/// silent no-op.
pub fn rule(state: State, event: Event) -> Option<Rule> {
    use Event as E;
    use State as S;

    let (target, effects) = match (state, event) {
        (S::Calling, E::ConnectionReady) => (S::Welcome, NONE),

        (S::Welcome, E::FinishWelcome) => (S::Listening, START_LISTENING),
        (S::Welcome, E::Interrupt) => (S::Listening, INTERRUPT_AND_LISTEN),

        (S::Thinking, E::ReceiveResponse) => (S::Speaking, NONE),
        (S::Thinking, E::Interrupt) => (S::Listening, INTERRUPT_AND_LISTEN),

        (S::Speaking, E::FinishSpeaking) => (S::Listening, START_LISTENING),
        (S::Speaking, E::Interrupt) => (S::Listening, INTERRUPT_AND_LISTEN),

        (S::Listening, E::UserSpeaking) => (S::Thinking, NONE),

        (S::NetworkError, E::Retry) => (S::Reconnecting, RECONNECT),

        (S::Reconnecting, E::ConnectionReady) => (S::Calling, NONE),

        // Connection loss is global, except once already in NetworkError
        (
            S::Calling | S::Welcome | S::Thinking | S::Speaking | S::Listening | S::Reconnecting,
            E::ConnectionLost,
        ) => (S::NetworkError, NONE),

        _ => return None,
    };

    Some(Rule { target, effects })
}
