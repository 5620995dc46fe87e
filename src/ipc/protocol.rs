//! IPC message protocol definitions
//!
//! All messages are JSON-encoded, prefixed with a 4-byte little-endian length.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::driver::Signal;
use crate::events::CallEvent;
use crate::state::{Event, State};

/// Largest accepted message body
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Errors reading or writing a frame
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("message of {0} bytes exceeds the frame size limit")]
    TooLarge(usize),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Requests from UI to daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Request current call status
    GetStatus,

    /// Feed a signal to the active call session
    Signal { signal: Signal },

    /// Ping to check connectivity
    Ping,

    /// Subscribe to call event notifications
    Subscribe,
}

/// Responses from daemon to UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Current call status
    Status(CallStatus),

    /// Signal handed to the call session
    Accepted,

    /// Pong response to ping
    Pong,

    /// Subscription confirmed
    Subscribed,

    /// Error response
    Error { code: String, message: String },
}

/// Push notification from daemon to UI (for subscribed clients)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Something happened in the call session
    Event { event: CallEvent },
}

/// Full call status snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStatus {
    /// Daemon version
    pub version: String,

    /// Current conversation state
    pub state: State,

    /// Events the current state accepts, for rendering enabled actions
    pub actions: Vec<Event>,

    /// Uptime in seconds
    pub uptime_secs: u64,
}

impl CallStatus {
    pub fn for_state(state: State) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state,
            actions: state.permitted_events(),
            uptime_secs: 0,
        }
    }
}

impl Default for CallStatus {
    fn default() -> Self {
        Self::for_state(State::default())
    }
}

/// Read one length-prefixed JSON message
///
/// Returns `Ok(None)` when the peer closed the stream between messages.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut msg_buf = vec![0u8; len];
    reader.read_exact(&mut msg_buf).await?;

    Ok(Some(serde_json::from_slice(&msg_buf)?))
}

/// Write one length-prefixed JSON message
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body.len()));
    }

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
