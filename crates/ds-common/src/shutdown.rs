//! Process shutdown wiring

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Returns a token that is cancelled when the process receives Ctrl-C.
///
/// The listener task also exits if the token is cancelled by other means.
pub fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let listener = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Shutdown signal received"),
                    Err(e) => error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
                }
                listener.cancel();
            }
            _ = listener.cancelled() => {}
        }
    });

    token
}
