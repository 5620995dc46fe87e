//! One-shot timers owned by the state they were armed for
//!
//! A [`ScopedTimer`] delivers a value into the driver's input channel after a
//! delay. Dropping it aborts the underlying task, so leaving a state releases
//! its timer by simply replacing or clearing the handle.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// A cancellable delayed delivery
#[derive(Debug)]
pub struct ScopedTimer {
    handle: JoinHandle<()>,
}

impl ScopedTimer {
    /// Send `value` on `tx` once `delay` has elapsed, unless dropped first
    pub fn arm<T>(delay: Duration, tx: mpsc::UnboundedSender<T>, value: T) -> Self
    where
        T: Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(value).is_err() {
                trace!("timer fired after its receiver closed");
            }
        });
        Self { handle }
    }

    /// Whether the delivery has already happened (or been aborted)
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
