use tokio::signal;

/// Resolves on SIGTERM or SIGINT. Used as the `with_graceful_shutdown` future
/// so axum stops accepting new connections while letting in-flight handlers
/// finish.
pub async fn wait_for_shutdown_signal() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");
    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => tracing::info!(service = crate::SERVICE, "received SIGTERM"),
        _ = interrupt.recv() => tracing::info!(service = crate::SERVICE, "received SIGINT"),
    }

    tracing::info!(service = crate::SERVICE, "shutting down gracefully");
}
