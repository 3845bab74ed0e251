/// Process lifecycle: the panic guard and shutdown signals.
use std::panic;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::event::DaemonEvent;
use crate::state::EmergencyUnlock;

/// Installs a process-wide panic hook that forces the lock state to UNLOCKED
/// before the previous hook runs, so a fault anywhere never leaves the keyboard
/// suppressed.  The hook itself and the instance marker are released by `Drop`
/// while the panicking thread unwinds.
pub fn install_panic_guard(unlock: EmergencyUnlock) {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        if unlock.force() {
            error!(%info, "panic; keyboard forced unlocked");
        } else {
            error!(%info, "panic while a transition held the lock state");
        }
        previous(info);
    }));
}

/// Resolves on Ctrl+C, or SIGTERM where the platform has it.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => debug!("received SIGTERM"),
                    _ = ctrl_c() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "failed to register SIGTERM handler"),
        }
    }

    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => debug!("received Ctrl+C"),
        Err(e) => {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

/// Sends [`DaemonEvent::Shutdown`] once a shutdown signal arrives.
pub async fn forward_shutdown(tx: mpsc::Sender<DaemonEvent>) {
    shutdown_signal().await;
    let _ = tx.send(DaemonEvent::Shutdown).await;
}
