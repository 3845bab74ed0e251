/// Scan-code suppression: the per-event decision and the handle that keeps the
/// keyboard hook alive.
///
/// Decision order for every raw event:
///   1. An allow-listed OS combination passes, whatever the lock state, and so
///      do the modifier keys that make one up (Ctrl, Alt, Shift).  The OS only
///      recognises a combination whose modifiers it has seen go down.
///   2. Otherwise, while LOCKED the event is swallowed.
///   3. Otherwise it passes.
///
/// Refinements sit in front of that order in [`KeyFilter`]: presses of the hotkey
/// combination and their releases are consumed, and the release of a key whose
/// press was already forwarded always passes so nothing is left logically held
/// when the lock engages.
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, warn};

use crate::event::ToggleSender;
use crate::hook::{HookInstallError, KeyEventHandler, KeyboardHook};
use crate::hotkey::{HotkeyBinding, HotkeyListener};
use crate::keys::{vk, KeyDirection, KeyEvent, KeyTracker, ModifierState, MULTIMEDIA_KEYS};
use crate::state::{LockState, StateReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Suppress,
    PassThrough,
}

// ── Policy ────────────────────────────────────────────────────────────────────

const MAX_KEY_CODE: u32 = 0xFF;
const _: () = assert!(*MULTIMEDIA_KEYS.end() <= MAX_KEY_CODE);

/// An OS-reserved combination that is never swallowed.
#[derive(Debug, Clone, Copy)]
pub struct AllowedCombo {
    pub name: &'static str,
    pub modifiers: ModifierState,
    pub key: u32,
}

impl AllowedCombo {
    /// The terminal key arrives while at least the combination's modifiers are held.
    fn covers(&self, key: u32, held: ModifierState) -> bool {
        key == self.key
            && (held.ctrl || !self.modifiers.ctrl)
            && (held.alt || !self.modifiers.alt)
            && (held.shift || !self.modifiers.shift)
            && (held.win || !self.modifiers.win)
    }
}

#[derive(Debug, Clone)]
pub struct SuppressionPolicy {
    allowed: Vec<AllowedCombo>,
}

impl Default for SuppressionPolicy {
    fn default() -> Self {
        Self {
            allowed: vec![
                AllowedCombo {
                    name: "secure attention sequence",
                    modifiers: ModifierState { ctrl: true, alt: true, ..ModifierState::NONE },
                    key: vk::DELETE,
                },
                AllowedCombo {
                    name: "task manager",
                    modifiers: ModifierState { ctrl: true, shift: true, ..ModifierState::NONE },
                    key: vk::ESCAPE,
                },
            ],
        }
    }
}

impl SuppressionPolicy {
    pub fn allowed(&self) -> &[AllowedCombo] {
        &self.allowed
    }

    pub fn is_allowed(&self, key: u32, held: ModifierState) -> bool {
        self.allowed.iter().any(|combo| combo.covers(key, held))
    }

    /// Every virtual-key code.  The multimedia range lies inside it.
    pub fn governs(&self, key: u32) -> bool {
        key <= MAX_KEY_CODE
    }

    /// `true` for a modifier key that some allow-listed combination requires.
    pub fn is_reserved_modifier(&self, key: u32) -> bool {
        let required: fn(&ModifierState) -> bool = match key {
            vk::CONTROL | vk::LCONTROL | vk::RCONTROL => |m| m.ctrl,
            vk::MENU | vk::LMENU | vk::RMENU => |m| m.alt,
            vk::SHIFT | vk::LSHIFT | vk::RSHIFT => |m| m.shift,
            vk::LWIN | vk::RWIN => |m| m.win,
            _ => return false,
        };
        self.allowed.iter().any(|combo| required(&combo.modifiers))
    }

    /// `true` if pressing `binding` would also match an allow-listed combination.
    pub fn shadows(&self, binding: &HotkeyBinding) -> bool {
        self.is_allowed(binding.key(), binding.modifiers())
    }
}

/// Pure suppression decision.  `state` is `None` when the lock state could not be
/// read without blocking; that case fails open.
pub fn decide(
    policy: &SuppressionPolicy,
    event: &KeyEvent,
    held: ModifierState,
    state: Option<LockState>,
) -> Verdict {
    if !policy.governs(event.vk)
        || policy.is_allowed(event.vk, held)
        || policy.is_reserved_modifier(event.vk)
    {
        return Verdict::PassThrough;
    }
    match state {
        Some(LockState::Locked) => Verdict::Suppress,
        Some(LockState::Unlocked) | None => Verdict::PassThrough,
    }
}

// ── Key filter (runs on the hook thread) ──────────────────────────────────────

#[derive(Default)]
struct FilterKeys {
    /// Every physically held key, suppressed or not.
    held: KeyTracker,
    /// Keys whose press reached the rest of the system.
    forwarded: KeyTracker,
    /// Hotkey terminal keys whose press was consumed.
    consumed: KeyTracker,
}

pub struct KeyFilter {
    keys: Mutex<FilterKeys>,
    listener: Arc<HotkeyListener>,
    policy: SuppressionPolicy,
    state: StateReader,
    faults: ToggleSender,
}

impl KeyFilter {
    pub fn new(
        listener: Arc<HotkeyListener>,
        policy: SuppressionPolicy,
        state: StateReader,
        faults: ToggleSender,
    ) -> Self {
        Self {
            keys: Mutex::new(FilterKeys::default()),
            listener,
            policy,
            state,
            faults,
        }
    }

    fn reset_held(&self) {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        keys.held.clear();
        keys.consumed.clear();
    }
}

impl KeyEventHandler for KeyFilter {
    fn on_event(&self, event: &KeyEvent) -> Verdict {
        // Only the hook thread takes this lock.
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        let repeat = keys.held.apply(event);
        let held = keys.held.modifiers();

        self.listener.observe(event, held, repeat);
        if event.is_down() && self.listener.is_binding(event.vk, held) {
            keys.consumed.apply(event);
            return Verdict::Suppress;
        }
        // A consumed press never reached anyone, so neither does its release.
        let was_consumed = keys.consumed.is_down(event.vk);
        keys.consumed.apply(&KeyEvent { direction: KeyDirection::Up, ..*event });
        if was_consumed && !event.is_down() {
            return Verdict::Suppress;
        }

        let verdict = if !event.is_down() && keys.forwarded.is_down(event.vk) {
            Verdict::PassThrough
        } else {
            decide(&self.policy, event, held, self.state.current())
        };

        if verdict == Verdict::PassThrough || !event.is_down() {
            keys.forwarded.apply(event);
        }
        if event.is_down() && self.policy.is_allowed(event.vk, held) {
            // The OS may switch to the secure desktop; those releases never come back here.
            keys.held.release_modifiers();
        }
        verdict
    }

    fn on_fault(&self) {
        self.reset_held();
        error!("keyboard hook callback panicked; releasing suppression");
        if !self.faults.hook_fault() {
            warn!("hook fault could not be reported; event channel unavailable");
        }
    }

    fn on_session_change(&self) {
        self.reset_held();
        debug!("session changed; held keys forgotten");
    }
}

// ── Suppressor ────────────────────────────────────────────────────────────────

/// Owns the keyboard hook.  The hook stays installed for the whole process
/// lifetime (it also carries hotkey matching); `activate`/`deactivate` only track
/// whether suppression is engaged and make sure the hook is still there.
pub struct Suppressor {
    hook: Box<dyn KeyboardHook>,
    filter: Arc<KeyFilter>,
    active: bool,
}

impl Suppressor {
    pub fn new(hook: Box<dyn KeyboardHook>, filter: Arc<KeyFilter>) -> Self {
        Self { hook, filter, active: false }
    }

    pub fn install(&mut self) -> Result<(), HookInstallError> {
        let handler: Arc<dyn KeyEventHandler> = self.filter.clone();
        self.hook.install(handler)
    }

    pub fn activate(&mut self) -> Result<(), HookInstallError> {
        if !self.hook.is_installed() {
            warn!("keyboard hook is not installed; reinstalling");
            self.install()?;
        }
        self.active = true;
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn uninstall(&mut self) {
        self.active = false;
        self.hook.uninstall();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
