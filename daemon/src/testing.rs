/// Test doubles for the platform seams.
use std::sync::{Arc, Mutex};

use crate::config::Settings;
use crate::hook::{HookInstallError, KeyEventHandler, KeyboardHook};
use crate::observer::LockObserver;
use crate::overlay::{Appearance, Overlay, OverlayError};

#[derive(Default)]
struct HookState {
    installed: bool,
    refuse: bool,
    installs: usize,
}

/// In-memory keyboard hook.  Clones share state so a test can keep a handle
/// after boxing one into the suppressor.
#[derive(Clone, Default)]
pub struct FakeHook {
    state: Arc<Mutex<HookState>>,
}

impl FakeHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refuse(&self, refuse: bool) {
        self.state.lock().unwrap().refuse = refuse;
    }

    pub fn installs(&self) -> usize {
        self.state.lock().unwrap().installs
    }

    pub fn is_installed(&self) -> bool {
        self.state.lock().unwrap().installed
    }

    /// Simulates the OS silently removing the hook.
    pub fn uninstall_externally(&self) {
        self.state.lock().unwrap().installed = false;
    }
}

impl KeyboardHook for FakeHook {
    fn install(&mut self, _handler: Arc<dyn KeyEventHandler>) -> Result<(), HookInstallError> {
        let mut state = self.state.lock().unwrap();
        if state.installed {
            return Ok(());
        }
        if state.refuse {
            return Err(HookInstallError::Refused("refused by test".into()));
        }
        state.installed = true;
        state.installs += 1;
        Ok(())
    }

    fn uninstall(&mut self) {
        self.state.lock().unwrap().installed = false;
    }

    fn is_installed(&self) -> bool {
        FakeHook::is_installed(self)
    }
}

/// Shared, ordered log of calls made on recording doubles.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<&'static str>>>);

impl Recorder {
    fn push(&self, call: &'static str) {
        self.0.lock().unwrap().push(call);
    }

    pub fn take(&self) -> Vec<&'static str> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

pub struct RecordingOverlay {
    recorder: Recorder,
}

impl RecordingOverlay {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl Overlay for RecordingOverlay {
    fn show(&mut self) -> Result<(), OverlayError> {
        self.recorder.push("overlay.show");
        Ok(())
    }

    fn hide(&mut self) -> Result<(), OverlayError> {
        self.recorder.push("overlay.hide");
        Ok(())
    }

    fn set_appearance(&mut self, _appearance: Appearance) -> Result<(), OverlayError> {
        self.recorder.push("overlay.appearance");
        Ok(())
    }
}

pub struct RecordingObserver {
    recorder: Recorder,
}

impl RecordingObserver {
    pub fn new(recorder: Recorder) -> Self {
        Self { recorder }
    }
}

impl LockObserver for RecordingObserver {
    fn on_locked(&mut self) {
        self.recorder.push("locked");
    }

    fn on_unlocked(&mut self) {
        self.recorder.push("unlocked");
    }

    fn on_failure(&mut self, _error: &str) {
        self.recorder.push("failure");
    }

    fn on_reconfigured(&mut self, _settings: &Settings) {
        self.recorder.push("reconfigured");
    }
}
