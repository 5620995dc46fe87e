//! Unix domain socket server for IPC
//!
//! Provides request-response communication and push notifications of call
//! events to subscribed clients.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::driver::Signal;
use crate::events::CallEvent;
use crate::state::State;

use super::protocol::{read_frame, write_frame, CallStatus, FrameError, Notification, Request, Response};

/// IPC Server handling client connections
pub struct Server {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    shared: Shared,
    shutdown_tx: broadcast::Sender<()>,
}

/// Handles every client task needs
#[derive(Clone)]
struct Shared {
    state: Arc<RwLock<ServerState>>,
    /// Signals forwarded to the active call session
    signal_tx: mpsc::Sender<Signal>,
    /// Call events for subscribed clients
    events: broadcast::Sender<CallEvent>,
}

/// Shared server state
struct ServerState {
    status: CallStatus,
    start_time: std::time::Instant,
}

/// Anything written back to a client
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outgoing {
    Response(Response),
    Notification(Notification),
}

impl Server {
    /// Create a new IPC server
    pub fn new(
        socket_path: &Path,
        signal_tx: mpsc::Sender<Signal>,
        events: broadcast::Sender<CallEvent>,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).context("failed to create socket directory")?;
        }

        // Remove stale socket if it exists
        if socket_path.exists() {
            std::fs::remove_file(socket_path).context("failed to remove stale socket")?;
        }

        let listener = UnixListener::bind(socket_path).context("failed to bind Unix socket")?;

        // Set socket permissions to owner-only (0600)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        let state = Arc::new(RwLock::new(ServerState {
            status: CallStatus::default(),
            start_time: std::time::Instant::now(),
        }));

        info!(?socket_path, "IPC server listening");

        Ok(Self {
            socket_path: socket_path.to_owned(),
            listener: Some(listener),
            shared: Shared {
                state,
                signal_tx,
                events,
            },
            shutdown_tx,
        })
    }

    /// Update the reported call state
    pub async fn set_state(&self, state: State) {
        let mut server_state = self.shared.state.write().await;
        let old_state = server_state.status.state;
        server_state.status.state = state;
        server_state.status.actions = state.permitted_events();

        if old_state != state {
            debug!(from = %old_state, to = %state, "IPC server: state updated");
        }
    }

    /// Run the server, accepting connections
    pub async fn run(&self) -> Result<()> {
        let listener = self.listener.as_ref().context("server not initialized")?;

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("client connected");
                    let shared = self.shared.clone();
                    let mut shutdown_rx = self.shutdown_tx.subscribe();

                    tokio::spawn(async move {
                        tokio::select! {
                            result = handle_client(stream, shared) => {
                                if let Err(e) = result {
                                    warn!(?e, "client handler error");
                                }
                            }
                            _ = shutdown_rx.recv() => {
                                debug!("client handler shutting down");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(?e, "accept error");
                }
            }
        }
    }

    /// Gracefully shutdown the server
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        // Remove socket file
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(?e, "failed to remove socket file");
            }
        }

        info!("IPC server shutdown complete");
    }
}

/// Serve one client until it disconnects
///
/// Responses and notifications share a single writer task so frames never
/// interleave.
async fn handle_client<S>(stream: S, shared: Shared) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::channel::<Outgoing>(64);

    let writer_task: JoinHandle<Result<(), FrameError>> = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            write_frame(&mut writer, &msg).await?;
        }
        Ok(())
    });
    let mut forwarder: Option<JoinHandle<()>> = None;

    let result = loop {
        let request: Request = match read_frame(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("client disconnected");
                break Ok(());
            }
            Err(e) => break Err(e),
        };
        debug!(?request, "received request");

        let response = process_request(request, &shared, &out_tx, &mut forwarder).await;
        if out_tx.send(Outgoing::Response(response)).await.is_err() {
            break Ok(());
        }
    };

    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    drop(out_tx);
    match writer_task.await {
        Ok(Err(e)) if result.is_ok() => Err(e),
        _ => result,
    }
}

/// Process a request and return a response
async fn process_request(
    request: Request,
    shared: &Shared,
    out_tx: &mpsc::Sender<Outgoing>,
    forwarder: &mut Option<JoinHandle<()>>,
) -> Response {
    match request {
        Request::Ping => Response::Pong,

        Request::GetStatus => {
            let mut state = shared.state.write().await;
            state.status.uptime_secs = state.start_time.elapsed().as_secs();
            Response::Status(state.status.clone())
        }

        Request::Signal { signal } => match shared.signal_tx.send(signal).await {
            Ok(()) => Response::Accepted,
            Err(e) => Response::Error {
                code: "session_closed".to_string(),
                message: format!("no call session to receive {}", e.0),
            },
        },

        Request::Subscribe => {
            if forwarder.is_none() {
                *forwarder = Some(spawn_forwarder(shared.events.subscribe(), out_tx.clone()));
                debug!("client subscribed to notifications");
            }
            Response::Subscribed
        }
    }
}

/// Copy call events to one client until either side goes away
fn spawn_forwarder(
    mut events: broadcast::Receiver<CallEvent>,
    out_tx: mpsc::Sender<Outgoing>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let note = Notification::Event { event };
                    if out_tx.send(Outgoing::Notification(note)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "subscriber lagged, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
