//! Signal handling for graceful shutdown.
//!
//! SIGINT (Ctrl-C) and SIGTERM cancel the supervisor's token; the loop then
//! finishes its current step and runs the at-exit logic. A second signal
//! while shutting down exits immediately.
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal forces an immediate exit.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Spawn a task that cancels `token` on the first SIGINT/SIGTERM.
#[cfg(unix)]
pub fn install(token: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        tracing::info!(signal = name, "shutdown requested");
        token.cancel();

        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        tracing::warn!(signal = name, "second signal, exiting immediately");
        std::process::exit(FORCED_EXIT_CODE);
    });
    Ok(())
}

#[cfg(not(unix))]
pub fn install(token: CancellationToken) -> std::io::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            token.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("second Ctrl-C, exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });
    Ok(())
}
