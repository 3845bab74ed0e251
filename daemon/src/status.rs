use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::Settings;
use crate::observer::LockObserver;
use crate::state::LockState;

/// Runtime status written by the daemon to `<config dir>/PawGate/status.toml`.
/// A tray icon reads this file (read-only) to display the lock state.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LockStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    pub state: LockState,
    /// Canonical form of the registered hotkey, if registration succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hotkey: Option<String>,
    /// RFC 3339 timestamp of the moment the keyboard was locked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_since: Option<String>,
    /// Human-readable message for the last failed lock attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LockStatus {
    /// Constructs the initial unlocked status on daemon startup.
    pub fn new(settings: &Settings) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            state: LockState::Unlocked,
            hotkey: settings.hotkey.map(|b| b.to_string()),
            locked_since: None,
            error: None,
        }
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.  Failures are logged; a
/// status write must never affect the lock itself.
pub fn write_status(path: &Path, status: &LockStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), error = %e, "failed to create status directory");
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                warn!(path = %path.display(), error = %e, "failed to write status file");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize status"),
    }
}

/// Observer that mirrors every transition into the status file.
pub struct StatusFile {
    path: PathBuf,
    status: LockStatus,
}

impl StatusFile {
    pub fn new(path: PathBuf, settings: &Settings) -> Self {
        Self { path, status: LockStatus::new(settings) }
    }

    pub fn publish(&self) {
        write_status(&self.path, &self.status);
        debug!(state = %self.status.state, "status published");
    }
}

impl LockObserver for StatusFile {
    fn on_locked(&mut self) {
        self.status.state = LockState::Locked;
        self.status.locked_since = Some(chrono::Local::now().to_rfc3339());
        self.status.error = None;
        self.publish();
    }

    fn on_unlocked(&mut self) {
        self.status.state = LockState::Unlocked;
        self.status.locked_since = None;
        self.publish();
    }

    fn on_failure(&mut self, error: &str) {
        self.status.error = Some(error.to_string());
        self.publish();
    }

    fn on_reconfigured(&mut self, settings: &Settings) {
        self.status.hotkey = settings.hotkey.map(|b| b.to_string());
        self.publish();
    }
}
