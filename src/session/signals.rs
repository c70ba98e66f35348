//! OS signal integration for the loop controller.
//!
//! ```text
//! first SIGTERM/SIGINT  ──► ControllerHandle::stop()        (graceful)
//! second SIGTERM/SIGINT ──► ControllerHandle::force_stop()  (skip cleanup)
//! ```
//!
//! The listener exits on its own once the controller reaches `stopped`.
//!
//! # Example
//!
//! ```rust,ignore
//! use mender::session::signals::SignalListener;
//!
//! let (handle, task) = controller.spawn();
//! tokio::spawn(SignalListener::new(handle).listen());
//! let summary = task.await??;
//! ```

use tracing::{info, warn};

use crate::controller::{ControllerHandle, StopRequest};
use crate::error::Result;

/// Translates shutdown signals into stop requests.
#[derive(Debug)]
pub struct SignalListener {
    handle: ControllerHandle,
    received: u32,
}

impl SignalListener {
    #[must_use]
    pub fn new(handle: ControllerHandle) -> Self {
        Self {
            handle,
            received: 0,
        }
    }

    /// Number of shutdown signals seen so far.
    pub fn received(&self) -> u32 {
        self.received
    }

    /// React to one shutdown signal and return the resulting request.
    pub fn escalate(&mut self) -> StopRequest {
        self.received += 1;
        if self.received == 1 {
            info!("Shutdown signal received; finishing the current cycle");
            self.handle.stop();
            StopRequest::Graceful
        } else {
            warn!("Second shutdown signal received; forcing stop");
            self.handle.force_stop();
            StopRequest::Force
        }
    }

    /// Listen for SIGTERM/SIGINT (Ctrl+C on Windows) until the controller stops.
    ///
    /// # Errors
    ///
    /// Returns an error if signal handler registration fails.
    pub async fn listen(mut self) -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            let handle = self.handle.clone();

            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT");
                    }
                    _ = handle.wait_stopped() => return Ok(()),
                }
                if self.escalate() == StopRequest::Force {
                    return Ok(());
                }
            }
        }

        #[cfg(windows)]
        {
            let handle = self.handle.clone();
            loop {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        result?;
                        info!("Received Ctrl+C");
                    }
                    _ = handle.wait_stopped() => return Ok(()),
                }
                if self.escalate() == StopRequest::Force {
                    return Ok(());
                }
            }
        }
    }
}
