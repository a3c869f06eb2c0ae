//! Graceful shutdown
//!
//! `main` owns the [`ShutdownController`]; the dispatcher and the health
//! server each hold a [`ShutdownSignal`] and stop once it fires. The
//! dispatcher finishes the key it is working on before returning.

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve once shutdown is triggered or the controller is dropped
    pub async fn wait(&mut self) {
        // An error means the sender is gone, which also ends the process
        let _ = self.receiver.wait_for(|stopped| *stopped).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }
}

#[derive(Debug)]
pub struct ShutdownController {
    sender: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn shutdown(&self) {
        self.sender.send_replace(true);
        info!("Shutdown signal sent");
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }
}

pub fn shutdown_channel() -> (ShutdownController, ShutdownSignal) {
    let (sender, receiver) = watch::channel(false);
    (ShutdownController { sender }, ShutdownSignal { receiver })
}

/// Wait for SIGTERM or SIGINT and return its name
///
/// # Errors
/// Fails if a signal handler cannot be installed.
#[cfg(unix)]
pub async fn wait_for_signal() -> Result<&'static str, std::io::Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    info!(signal = name, "Received termination signal");
    Ok(name)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> Result<&'static str, std::io::Error> {
    tokio::signal::ctrl_c().await?;
    info!(signal = "CTRL_C", "Received termination signal");
    Ok("CTRL_C")
}
