use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Waits for SIGTERM or SIGINT and cancels `token`.
///
/// Falls back to ctrl-c when the unix handlers cannot be installed.
pub async fn listen_shutdown(token: CancellationToken) {
    let signal_name = wait_for_signal().await;
    warn!("shutdown signal received: {signal_name}");
    token.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = signal(SignalKind::terminate())
        .and_then(|term| signal(SignalKind::interrupt()).map(|int| (term, int)));

    let (mut sigterm, mut sigint) = match handlers {
        Ok(pair) => pair,
        Err(err) => {
            warn!("failed to install unix signal handlers: error={err}");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: error={err}");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
