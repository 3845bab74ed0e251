/// Lock state and the state machine that is the single authority over it.
///
/// The committed [`LockState`] lives in one `Arc<RwLock<_>>`.  The machine holds
/// the write guard across check, activate and commit, so no two transitions ever
/// interleave.  The hook thread reads through a [`StateReader`] with `try_read`
/// and never waits on a transition.
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard, TryLockError};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::hook::HookInstallError;
use crate::observer::LockObserver;
use crate::overlay::Overlay;
use crate::suppressor::Suppressor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockState {
    #[default]
    Unlocked,
    Locked,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockState::Unlocked => "unlocked",
            LockState::Locked => "locked",
        })
    }
}

// ── Shared cell ───────────────────────────────────────────────────────────────

/// Owner of the process-wide lock state.  Only the state machine writes it.
#[derive(Debug, Default)]
pub struct LockCell {
    inner: Arc<RwLock<LockState>>,
}

impl LockCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reader(&self) -> StateReader {
        StateReader { inner: Arc::clone(&self.inner) }
    }

    pub fn emergency(&self) -> EmergencyUnlock {
        EmergencyUnlock { inner: Arc::clone(&self.inner) }
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, LockState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self) -> LockState {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Non-blocking read access for callback threads.
#[derive(Debug, Clone)]
pub struct StateReader {
    inner: Arc<RwLock<LockState>>,
}

impl StateReader {
    /// `None` while a transition holds the write guard.
    pub fn current(&self) -> Option<LockState> {
        match self.inner.try_read() {
            Ok(state) => Some(*state),
            Err(TryLockError::Poisoned(poisoned)) => Some(*poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

/// Last-resort handle for the panic guard: forces the cell to UNLOCKED without
/// waiting.
#[derive(Debug, Clone)]
pub struct EmergencyUnlock {
    inner: Arc<RwLock<LockState>>,
}

impl EmergencyUnlock {
    /// Returns `false` if a transition currently holds the cell.
    pub fn force(&self) -> bool {
        match self.inner.try_write() {
            Ok(mut state) => {
                *state = LockState::Unlocked;
                true
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                *poisoned.into_inner() = LockState::Unlocked;
                true
            }
            Err(TryLockError::WouldBlock) => false,
        }
    }
}

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Hotkey,
    OverlayClick,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Hotkey => "hotkey",
            Trigger::OverlayClick => "overlay click",
        })
    }
}

/// A toggle request together with the state its trigger saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleRequest {
    pub trigger: Trigger,
    pub observed: LockState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Locked,
    Unlocked,
    /// The request was based on a state that is no longer current.
    Stale,
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("could not engage keyboard suppression")]
    Hook(#[from] HookInstallError),
}

// ── State machine ─────────────────────────────────────────────────────────────

pub struct LockStateMachine {
    cell: LockCell,
    suppressor: Suppressor,
    overlay: Box<dyn Overlay>,
    observers: Vec<Box<dyn LockObserver>>,
    shut_down: bool,
}

impl LockStateMachine {
    pub fn new(cell: LockCell, suppressor: Suppressor, overlay: Box<dyn Overlay>) -> Self {
        Self {
            cell,
            suppressor,
            overlay,
            observers: Vec::new(),
            shut_down: false,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn LockObserver>) {
        self.observers.push(observer);
    }

    pub fn state(&self) -> LockState {
        self.cell.get()
    }

    /// Derived: the overlay is visible exactly while LOCKED.
    pub fn overlay_visible(&self) -> bool {
        self.state() == LockState::Locked
    }

    /// Commits the transition requested by `request`, or drops it as stale if
    /// the state changed since the trigger observed it.
    pub fn handle(&mut self, request: ToggleRequest) -> Result<Outcome, TransitionError> {
        let mut state = self.cell.write();
        if *state != request.observed {
            debug!(
                trigger = %request.trigger,
                observed = %request.observed,
                current = %*state,
                "stale toggle request dropped"
            );
            return Ok(Outcome::Stale);
        }

        match *state {
            LockState::Unlocked => {
                if let Err(e) = self.suppressor.activate() {
                    drop(state);
                    error!(error = %e, "failed to lock keyboard; staying unlocked");
                    let message = e.to_string();
                    self.observers.iter_mut().for_each(|o| o.on_failure(&message));
                    return Err(e.into());
                }
                *state = LockState::Locked;
                drop(state);

                if let Err(e) = self.overlay.show() {
                    warn!(error = %e, "failed to show overlay");
                }
                info!(trigger = %request.trigger, "keyboard locked");
                self.observers.iter_mut().for_each(|o| o.on_locked());
                Ok(Outcome::Locked)
            }
            LockState::Locked => {
                *state = LockState::Unlocked;
                self.suppressor.deactivate();
                drop(state);

                self.after_unlock();
                info!(trigger = %request.trigger, "keyboard unlocked");
                Ok(Outcome::Unlocked)
            }
        }
    }

    /// Forces UNLOCKED after a hook fault.  Returns `true` if the keyboard was locked.
    ///
    /// The panic guard may already have reset the cell, so an engaged suppressor
    /// also counts as locked.
    pub fn recover(&mut self) -> bool {
        let mut state = self.cell.write();
        let was_locked = *state == LockState::Locked || self.suppressor.is_active();
        *state = LockState::Unlocked;
        self.suppressor.deactivate();
        drop(state);

        if was_locked {
            self.after_unlock();
            warn!("keyboard force-unlocked after a hook fault");
        }
        was_locked
    }

    /// Applies reloaded settings.  Never changes the lock state.
    pub fn reconfigure(&mut self, settings: &Settings) {
        if let Err(e) = self.overlay.set_appearance(settings.appearance) {
            warn!(error = %e, "failed to update overlay appearance");
        }
        self.observers.iter_mut().for_each(|o| o.on_reconfigured(settings));
    }

    /// Unlocks, hides the overlay and removes the keyboard hook.  Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        let was_locked = self.recover();
        if !was_locked {
            // recover() only hides the overlay when a lock was released.
            let _ = self.overlay.hide();
        }
        self.suppressor.uninstall();
        info!("lock state machine shut down");
    }

    fn after_unlock(&mut self) {
        if let Err(e) = self.overlay.hide() {
            warn!(error = %e, "failed to hide overlay");
        }
        self.observers.iter_mut().for_each(|o| o.on_unlocked());
    }
}

impl Drop for LockStateMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
