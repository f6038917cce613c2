use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancel a token on SIGTERM or SIGINT.
///
/// The processor stops claiming as soon as the token fires and gives running
/// jobs the configured grace period. A second signal is not needed: anything
/// still running after the grace period is abandoned to the ledger.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::error!(error = %e, "Failed to install signal handlers, falling back to Ctrl-C");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Ctrl-C handler failed");
                }
                trigger.cancel();
                return;
            }
        };

        let name = wait_for_first(&mut sigterm, &mut sigint).await;
        tracing::info!(signal = name, "Received shutdown signal, draining");
        trigger.cancel();
    });

    token
}

async fn wait_for_first(sigterm: &mut Signal, sigint: &mut Signal) -> &'static str {
    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}
