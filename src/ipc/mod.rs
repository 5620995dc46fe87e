//! IPC module for daemon-UI communication

mod protocol;
mod server;

pub use protocol::{
    read_frame, write_frame, CallStatus, FrameError, Notification, Request, Response,
    MAX_FRAME_LEN,
};
pub use server::Server;
