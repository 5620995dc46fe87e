//! voice-call-daemon: Background daemon hosting the voice-call state machine
//!
//! This daemon provides:
//! - One conversation state machine per call session
//! - Auto-transition timers, speech debounce and tap gating
//! - IPC server for the UI client that owns audio and the server connection
//!
//! Audio capture and the WebSocket transport stay in the client; the daemon
//! only sends it `start_listening`, `clear_response` and `reconnect` commands.

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voice_call_daemon::config::Config;
use voice_call_daemon::driver::{CallDriver, Signal};
use voice_call_daemon::events::{CallEvent, EndReason};
use voice_call_daemon::ipc::Server;
use voice_call_daemon::lifecycle::ShutdownSignal;
use voice_call_daemon::state::State;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "voice-call-daemon starting"
    );

    // Load configuration
    let config = Config::load().context("failed to load configuration")?;
    config.ensure_dirs()?;
    info!(?config.socket_path, ?config.timing, "configuration loaded");

    // Create shutdown signal handler
    let shutdown = ShutdownSignal::new();

    // Create channels for inter-component communication
    // IPC clients -> call driver
    let (signal_tx, mut signal_rx) = mpsc::channel::<Signal>(32);
    // Call driver -> IPC server (state changes and commands)
    let (event_tx, _event_rx) = broadcast::channel::<CallEvent>(64);

    let server = Server::new(&config.socket_path, signal_tx, event_tx.clone())?;

    // Call driver -> IPC status snapshot (latest state only)
    let (status_tx, mut status_rx) = watch::channel(State::Calling);
    let mut command_rx = event_tx.subscribe();
    let server_for_status = &server;

    info!("daemon initialized, entering main loop");

    // Main event loop
    tokio::select! {
        // Run call sessions back to back; each starts in Calling
        _ = async {
            loop {
                let mut driver = CallDriver::new(config.timing, event_tx.clone())
                    .with_status(status_tx.clone());
                if driver.run(&mut signal_rx).await == EndReason::Closed {
                    break;
                }
            }
        } => {
            info!("signal source closed");
        }

        // Run the IPC server (accepts client connections)
        result = server.run() => {
            if let Err(e) = result {
                error!(?e, "IPC server error");
            }
        }

        // Keep the IPC status snapshot in step with the machine
        _ = async {
            while status_rx.changed().await.is_ok() {
                let state = *status_rx.borrow_and_update();
                server_for_status.set_state(state).await;
            }
        } => {
            info!("status updates stopped");
        }

        // Log commands sent to the client
        _ = async {
            loop {
                match command_rx.recv().await {
                    Ok(CallEvent::Command { command }) => {
                        info!(?command, "command issued to client");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "call event receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        } => {
            info!("call event handler exited");
        }

        // Wait for shutdown signal
        result = shutdown.wait() => {
            match result {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(?e, "failed to install signal handlers"),
            }
        }
    }

    // Cleanup
    info!("shutting down...");

    server.shutdown().await;

    info!("voice-call-daemon stopped");

    Ok(())
}
