use tokio_util::sync::CancellationToken;

/// Cancel `shutdown` on Ctrl+C (and SIGTERM on unix).
pub fn watch_signals(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nCtrl+C received, shutting down...");
            }
            _ = terminate() => {
                eprintln!("SIGTERM received, shutting down...");
            }
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
