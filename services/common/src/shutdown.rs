//! Process-wide shutdown signal

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Spawn a task that cancels the returned token on Ctrl-C.
///
/// The token is the single cancellation signal handed to every background loop.
pub fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for interrupt signal: {}", e);
            return;
        }
        info!("Received interrupt signal, shutting down gracefully");
        trigger.cancel();
    });

    token
}
