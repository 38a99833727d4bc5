use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::error::{GateError, Result};

/// Install a handler that cancels the returned token on SIGTERM or SIGINT.
///
/// The poll loop checks the token between cycles and during waits; a job
/// that is already running is still bounded by its own deadline.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let trigger = token.clone();

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| GateError::Config(format!("failed to install SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| GateError::Config(format!("failed to install SIGINT handler: {}", e)))?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, stopping after the current cycle");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, stopping after the current cycle");
            }
        }
        trigger.cancel();
    });

    Ok(token)
}
