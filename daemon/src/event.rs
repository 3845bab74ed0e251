use tokio::sync::mpsc;

use crate::config::Config;
use crate::state::{LockState, ToggleRequest, Trigger};

#[derive(Debug)]
pub enum DaemonEvent {
    /// The hotkey matched or the overlay was clicked.
    Toggle(ToggleRequest),
    /// The keyboard hook callback panicked; suppression must be released.
    HookFault,
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// Ctrl+C or SIGTERM received; the daemon should unlock and exit.
    Shutdown,
}

/// Non-blocking handle used by OS callback threads to reach the main loop.
///
/// Every send is a `try_send`: a full or closed channel drops the message rather
/// than stalling the hook or the overlay window procedure.
#[derive(Clone)]
pub struct ToggleSender {
    tx: mpsc::Sender<DaemonEvent>,
}

impl ToggleSender {
    pub fn new(tx: mpsc::Sender<DaemonEvent>) -> Self {
        Self { tx }
    }

    /// Returns `false` if the request could not be queued.
    pub fn request(&self, trigger: Trigger, observed: LockState) -> bool {
        self.tx
            .try_send(DaemonEvent::Toggle(ToggleRequest { trigger, observed }))
            .is_ok()
    }

    pub fn hook_fault(&self) -> bool {
        self.tx.try_send(DaemonEvent::HookFault).is_ok()
    }
}
