//! Conversation state machine for a voice call
//!
//! Seven states, driven by eight events:
//! - Calling: dialing, waiting for the connection
//! - Welcome: playing the greeting, auto-advances to Listening
//! - Listening / Thinking / Speaking: the conversational turn loop
//! - NetworkError / Reconnecting: manual recovery cycle back to Calling
//!
//! Undefined `(state, event)` pairs are silent no-ops.

mod machine;
mod observer;
mod table;

#[cfg(test)]
mod proptests;

pub use machine::{CallContext, ConversationMachine, TransitionResult};
pub use observer::{ObserveKind, ParseKindError, Subscription, Transition};
pub use table::{rule, Effect, Event, Rule, State};
