//! Signal handling

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Installs SIGTERM and SIGINT handlers
///
/// The returned token is cancelled when either signal arrives. The control
/// loop stops claiming once it fires; an item in flight still finishes.
pub fn install_shutdown_handler() -> Result<CancellationToken> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, finishing current image before shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, finishing current image before shutdown"),
        }
        trigger.cancel();
    });

    Ok(token)
}
