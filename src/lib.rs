//! voice-call-daemon: conversation state machine for voice-call clients
//!
//! The daemon hosts one conversation state machine per call. A UI client
//! that owns audio capture and the server connection feeds it signals over a
//! Unix socket and receives state changes and side-effect commands back.
//!
//! - [`state`]: the conversation state machine itself
//! - [`driver`]: timers, debouncing and gating around the machine
//! - [`ipc`]: length-prefixed JSON protocol and socket server

pub mod config;
pub mod driver;
pub mod events;
pub mod ipc;
pub mod lifecycle;
pub mod state;
