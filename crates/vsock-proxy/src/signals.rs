//! OS termination signals.

use tokio::signal;
use tracing::{error, info};

/// Resolves on the first SIGINT or SIGTERM.
///
/// If a handler cannot be installed the error is logged and that signal is
/// never reported, so the other one still works.
pub async fn shutdown_signal() {
    let interrupt = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                error!(error = %e, "failed to install SIGINT handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!(signal = "SIGINT", "shutdown signal received"),
        () = terminate => info!(signal = "SIGTERM", "shutdown signal received"),
    }
}
