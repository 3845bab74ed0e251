/// Lock/unlock hotkey: binding grammar, the listener that matches it against raw
/// key events, and the OS-level claim that keeps other applications from binding
/// the same combination.
///
/// The listener never suppresses anything.  It is fed every raw event by the
/// keyboard hook *before* the suppression decision, so the hotkey keeps working
/// while the keyboard is locked even though its keys are swallowed.
///
/// One toggle is raised per matched press: a key-down for a terminal key that is
/// already held (auto-repeat) never re-triggers.
use std::fmt;
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::event::ToggleSender;
use crate::keys::{self, KeyEvent, ModifierState};
use crate::state::{StateReader, Trigger};
use crate::suppressor::SuppressionPolicy;

// ── Binding ───────────────────────────────────────────────────────────────────

/// A parsed key combination: modifiers plus exactly one terminal key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HotkeyBinding {
    modifiers: ModifierState,
    key: u32,
}

impl HotkeyBinding {
    pub const fn new(modifiers: ModifierState, key: u32) -> Self {
        Self { modifiers, key }
    }

    pub fn modifiers(&self) -> ModifierState {
        self.modifiers
    }

    pub fn key(&self) -> u32 {
        self.key
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingParseError {
    #[error("hotkey is empty")]
    Empty,

    #[error("unknown key '{0}'")]
    UnknownKey(String),

    #[error("modifier '{0}' appears more than once")]
    DuplicateModifier(String),

    #[error("'{0}' names more than one non-modifier key")]
    MultipleKeys(String),

    #[error("hotkey has no non-modifier key")]
    MissingKey,
}

/// Parses `"ctrl+shift+l"`-style strings.  Case-insensitive, whitespace around
/// `+` is ignored.
impl FromStr for HotkeyBinding {
    type Err = BindingParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(BindingParseError::Empty);
        }

        let mut modifiers = ModifierState::NONE;
        let mut key = None;

        for part in s.split('+').map(str::trim) {
            let flag = match part.to_ascii_lowercase().as_str() {
                "ctrl" | "control" => &mut modifiers.ctrl,
                "alt" => &mut modifiers.alt,
                "shift" => &mut modifiers.shift,
                "win" | "windows" | "super" => &mut modifiers.win,
                _ => {
                    let code = keys::parse_key(part)
                        .ok_or_else(|| BindingParseError::UnknownKey(part.to_string()))?;
                    if key.replace(code).is_some() {
                        return Err(BindingParseError::MultipleKeys(s.trim().to_string()));
                    }
                    continue;
                }
            };
            if std::mem::replace(flag, true) {
                return Err(BindingParseError::DuplicateModifier(part.to_string()));
            }
        }

        let key = key.ok_or(BindingParseError::MissingKey)?;
        Ok(Self { modifiers, key })
    }
}

/// Canonical form, modifiers in Ctrl, Alt, Shift, Win order: `Ctrl+Shift+L`.
impl fmt::Display for HotkeyBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.modifiers.is_empty() {
            write!(f, "{}+", self.modifiers)?;
        }
        f.write_str(&keys::key_name(self.key))
    }
}

// ── Registration ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("{binding} uses a modifier as its terminal key")]
    ModifierKey { binding: String },

    #[error("{binding} is reserved by the operating system")]
    Reserved { binding: String },

    #[error("{binding} is already registered by another application")]
    AlreadyClaimed { binding: String },

    #[error("hotkey registration failed: {0}")]
    Os(String),
}

/// Reserves a combination at the OS level so no other application can bind it.
pub trait HotkeyClaim: Send + Sync {
    fn claim(&self, binding: &HotkeyBinding) -> Result<(), RegistrationError>;
    fn release(&self);
}

/// Claim backend for platforms without a global hotkey registry.
#[cfg(any(not(windows), test))]
pub struct NoClaim;

#[cfg(any(not(windows), test))]
impl HotkeyClaim for NoClaim {
    fn claim(&self, _binding: &HotkeyBinding) -> Result<(), RegistrationError> {
        Ok(())
    }

    fn release(&self) {}
}

/// Returns the claim backend for the current platform.
pub fn platform_claim() -> Box<dyn HotkeyClaim> {
    #[cfg(windows)]
    {
        Box::new(imp::OsHotkeyClaim::new())
    }

    #[cfg(not(windows))]
    {
        Box::new(NoClaim)
    }
}

// ── Listener ──────────────────────────────────────────────────────────────────

pub struct HotkeyListener {
    /// Read from the hook thread with `try_read`; written only by `register`.
    binding: RwLock<Option<HotkeyBinding>>,
    policy: SuppressionPolicy,
    claim: Box<dyn HotkeyClaim>,
    state: StateReader,
    toggles: ToggleSender,
}

impl HotkeyListener {
    pub fn new(
        policy: SuppressionPolicy,
        claim: Box<dyn HotkeyClaim>,
        state: StateReader,
        toggles: ToggleSender,
    ) -> Self {
        Self {
            binding: RwLock::new(None),
            policy,
            claim,
            state,
            toggles,
        }
    }

    /// Registers `binding` as the toggle combination, replacing any previous one.
    ///
    /// On failure the previously registered binding (if any) stays in effect.
    pub fn register(&self, binding: HotkeyBinding) -> Result<(), RegistrationError> {
        if keys::is_modifier(binding.key()) {
            return Err(RegistrationError::ModifierKey { binding: binding.to_string() });
        }
        if self.policy.shadows(&binding) {
            return Err(RegistrationError::Reserved { binding: binding.to_string() });
        }
        if self.binding() == Some(binding) {
            debug!(%binding, "hotkey already registered");
            return Ok(());
        }

        self.claim.claim(&binding)?;
        *self.binding.write().unwrap_or_else(PoisonError::into_inner) = Some(binding);
        info!(%binding, "hotkey registered");
        Ok(())
    }

    pub fn unregister(&self) {
        self.claim.release();
        if let Some(binding) = self.binding.write().unwrap_or_else(PoisonError::into_inner).take() {
            info!(%binding, "hotkey unregistered");
        }
    }

    pub fn binding(&self) -> Option<HotkeyBinding> {
        *self.binding.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// `true` if `key` pressed with exactly `held` is the registered combination.
    pub fn is_binding(&self, key: u32, held: ModifierState) -> bool {
        match self.binding.try_read() {
            Ok(guard) => guard.as_ref().is_some_and(|b| b.key() == key && b.modifiers() == held),
            Err(_) => false,
        }
    }

    /// Matches one raw event against the registered binding and raises a toggle
    /// request on a fresh press.  Returns `true` if a request was sent.
    ///
    /// Called on the hook thread: never blocks.
    pub fn observe(&self, event: &KeyEvent, modifiers: ModifierState, repeat: bool) -> bool {
        let Ok(guard) = self.binding.try_read() else {
            return false;
        };
        let Some(binding) = *guard else {
            return false;
        };
        drop(guard);

        if !event.is_down() || repeat || event.vk != binding.key() || modifiers != binding.modifiers() {
            return false;
        }

        let Some(observed) = self.state.current() else {
            debug!(%binding, "hotkey press raced a transition; ignored");
            return false;
        };

        if self.toggles.request(Trigger::Hotkey, observed) {
            debug!(%binding, %observed, "hotkey matched");
            true
        } else {
            warn!(%binding, "hotkey press dropped; event channel unavailable");
            false
        }
    }
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Mutex, PoisonError};
    use std::thread::JoinHandle;

    use tracing::{debug, trace};
    use windows::Win32::Foundation::{LPARAM, WPARAM};
    use windows::Win32::System::Threading::GetCurrentThreadId;
    use windows::Win32::UI::Input::KeyboardAndMouse::{
        RegisterHotKey, UnregisterHotKey, HOT_KEY_MODIFIERS, MOD_ALT, MOD_CONTROL, MOD_NOREPEAT,
        MOD_SHIFT, MOD_WIN,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        GetMessageW, PostThreadMessageW, MSG, WM_HOTKEY, WM_QUIT,
    };

    use super::{HotkeyBinding, HotkeyClaim, RegistrationError};
    use crate::keys::ModifierState;

    const HOTKEY_ID: i32 = 1;

    /// A thread that owns one `RegisterHotKey` registration.  Registrations are
    /// bound to the registering thread's message queue, so the thread pumps
    /// messages until it is told to quit.
    struct ClaimThread {
        thread: JoinHandle<()>,
        thread_id: u32,
    }

    impl ClaimThread {
        fn stop(self) {
            unsafe {
                let _ = PostThreadMessageW(self.thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
            }
            let _ = self.thread.join();
        }
    }

    pub struct OsHotkeyClaim {
        active: Mutex<Option<ClaimThread>>,
    }

    impl OsHotkeyClaim {
        pub fn new() -> Self {
            Self { active: Mutex::new(None) }
        }
    }

    impl HotkeyClaim for OsHotkeyClaim {
        fn claim(&self, binding: &HotkeyBinding) -> Result<(), RegistrationError> {
            let flags = modifier_flags(binding.modifiers());
            let vk = binding.key();
            let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<u32, String>>(1);

            let thread = std::thread::Builder::new()
                .name("hotkey-claim".into())
                .spawn(move || run_claim_pump(flags, vk, ready_tx))
                .map_err(|e| RegistrationError::Os(e.to_string()))?;

            match ready_rx.recv() {
                Ok(Ok(thread_id)) => {
                    let previous = self
                        .active
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .replace(ClaimThread { thread, thread_id });
                    if let Some(previous) = previous {
                        previous.stop();
                    }
                    Ok(())
                }
                Ok(Err(e)) => {
                    let _ = thread.join();
                    debug!(error = %e, "RegisterHotKey failed");
                    Err(RegistrationError::AlreadyClaimed { binding: binding.to_string() })
                }
                Err(_) => {
                    let _ = thread.join();
                    Err(RegistrationError::Os("hotkey thread exited before reporting".into()))
                }
            }
        }

        fn release(&self) {
            if let Some(active) = self.active.lock().unwrap_or_else(PoisonError::into_inner).take() {
                active.stop();
            }
        }
    }

    impl Drop for OsHotkeyClaim {
        fn drop(&mut self) {
            self.release();
        }
    }

    fn modifier_flags(modifiers: ModifierState) -> u32 {
        let mut flags = MOD_NOREPEAT.0;
        if modifiers.ctrl {
            flags |= MOD_CONTROL.0;
        }
        if modifiers.alt {
            flags |= MOD_ALT.0;
        }
        if modifiers.shift {
            flags |= MOD_SHIFT.0;
        }
        if modifiers.win {
            flags |= MOD_WIN.0;
        }
        flags
    }

    fn run_claim_pump(flags: u32, vk: u32, ready_tx: std_mpsc::SyncSender<Result<u32, String>>) {
        unsafe {
            if let Err(e) = RegisterHotKey(None, HOTKEY_ID, HOT_KEY_MODIFIERS(flags), vk) {
                let _ = ready_tx.send(Err(e.to_string()));
                return;
            }
            let _ = ready_tx.send(Ok(GetCurrentThreadId()));
            drop(ready_tx);

            let mut msg = MSG::default();
            // GetMessageW: >0 = message, 0 = WM_QUIT, <0 = error.
            while GetMessageW(&mut msg, None, 0, 0).0 > 0 {
                // Matching happens in the keyboard hook; WM_HOTKEY is only drained.
                if msg.message == WM_HOTKEY {
                    trace!("WM_HOTKEY drained");
                }
            }

            let _ = UnregisterHotKey(None, HOTKEY_ID);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DaemonEvent;
    use crate::keys::vk;
    use crate::state::{LockCell, LockState};
    use tokio::sync::mpsc;

    fn ctrl() -> ModifierState {
        ModifierState { ctrl: true, ..ModifierState::NONE }
    }

    fn parse(s: &str) -> HotkeyBinding {
        s.parse().unwrap()
    }

    struct RejectingClaim;

    impl HotkeyClaim for RejectingClaim {
        fn claim(&self, binding: &HotkeyBinding) -> Result<(), RegistrationError> {
            Err(RegistrationError::AlreadyClaimed { binding: binding.to_string() })
        }

        fn release(&self) {}
    }

    fn listener_with(
        claim: Box<dyn HotkeyClaim>,
    ) -> (HotkeyListener, LockCell, mpsc::Receiver<DaemonEvent>) {
        let cell = LockCell::new();
        let (tx, rx) = mpsc::channel(8);
        let listener = HotkeyListener::new(
            SuppressionPolicy::default(),
            claim,
            cell.reader(),
            ToggleSender::new(tx),
        );
        (listener, cell, rx)
    }

    fn listener() -> (HotkeyListener, LockCell, mpsc::Receiver<DaemonEvent>) {
        listener_with(Box::new(NoClaim))
    }

    // ── parsing ───────────────────────────────────────────────────────────────

    #[test]
    fn parse_simple_binding() {
        let b = parse("ctrl+b");
        assert_eq!(b.modifiers(), ctrl());
        assert_eq!(b.key(), 'B' as u32);
    }

    #[test]
    fn parse_all_modifiers() {
        let b = parse("ctrl+shift+alt+f12");
        assert_eq!(
            b.modifiers(),
            ModifierState { ctrl: true, alt: true, shift: true, win: false }
        );
        assert_eq!(b.key(), vk::F1 + 11);
    }

    #[test]
    fn parse_is_case_and_whitespace_insensitive() {
        assert_eq!(parse("ctrl+b"), parse("CTRL+B"));
        assert_eq!(parse("ctrl+b"), parse(" Ctrl + b "));
        assert_eq!(parse("ctrl+b"), parse("control+b"));
        assert_eq!(parse("win+pause"), parse("super+Pause"));
    }

    #[test]
    fn parse_digits_and_media_keys() {
        for i in 0..=9u32 {
            assert_eq!(parse(&format!("ctrl+{i}")).key(), '0' as u32 + i);
        }
        assert_eq!(parse("ctrl+alt+volumemute").key(), vk::VOLUME_MUTE);
    }

    #[test]
    fn parse_errors_are_typed() {
        assert_eq!("".parse::<HotkeyBinding>(), Err(BindingParseError::Empty));
        assert_eq!("ctrl+shift".parse::<HotkeyBinding>(), Err(BindingParseError::MissingKey));
        assert_eq!(
            "ctrl+ctrl+b".parse::<HotkeyBinding>(),
            Err(BindingParseError::DuplicateModifier("ctrl".into()))
        );
        assert!(matches!(
            "ctrl+a+b".parse::<HotkeyBinding>(),
            Err(BindingParseError::MultipleKeys(_))
        ));
        assert_eq!(
            "not+a+valid+key+combo".parse::<HotkeyBinding>(),
            Err(BindingParseError::UnknownKey("not".into()))
        );
        assert!(matches!("invalid+++hotkey".parse::<HotkeyBinding>(), Err(_)));
    }

    #[test]
    fn display_is_canonical() {
        assert_eq!(parse("shift+ctrl+l").to_string(), "Ctrl+Shift+L");
        assert_eq!(parse("f8").to_string(), "F8");
        assert_eq!(parse("win+alt+pgup").to_string(), "Alt+Win+PageUp");
    }

    // ── register ──────────────────────────────────────────────────────────────

    #[test]
    fn register_stores_binding() {
        let (l, _cell, _rx) = listener();
        l.register(parse("ctrl+l")).unwrap();
        assert_eq!(l.binding(), Some(parse("ctrl+l")));
    }

    #[test]
    fn register_rejects_allow_listed_combination() {
        let (l, _cell, _rx) = listener();
        let err = l.register(parse("ctrl+alt+delete")).unwrap_err();
        assert!(matches!(err, RegistrationError::Reserved { .. }));
        assert_eq!(l.binding(), None);
    }

    #[test]
    fn register_rejects_modifier_terminal_key() {
        let (l, _cell, _rx) = listener();
        let binding = HotkeyBinding::new(ctrl(), vk::LSHIFT);
        assert!(matches!(l.register(binding), Err(RegistrationError::ModifierKey { .. })));
    }

    #[test]
    fn failed_claim_reports_error() {
        let (l, _cell, _rx) = listener_with(Box::new(RejectingClaim));
        let err = l.register(parse("ctrl+l")).unwrap_err();
        assert!(matches!(err, RegistrationError::AlreadyClaimed { .. }));
        assert_eq!(l.binding(), None);
    }

    #[test]
    fn unregister_clears_binding() {
        let (l, _cell, _rx) = listener();
        l.register(parse("ctrl+l")).unwrap();
        l.unregister();
        assert_eq!(l.binding(), None);
    }

    // ── observe ───────────────────────────────────────────────────────────────

    #[test]
    fn matched_press_requests_toggle_with_observed_state() {
        let (l, _cell, mut rx) = listener();
        l.register(parse("ctrl+l")).unwrap();

        assert!(l.observe(&KeyEvent::down('L' as u32), ctrl(), false));

        match rx.try_recv().unwrap() {
            DaemonEvent::Toggle(req) => {
                assert_eq!(req.trigger, Trigger::Hotkey);
                assert_eq!(req.observed, LockState::Unlocked);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn auto_repeat_does_not_retrigger() {
        let (l, _cell, mut rx) = listener();
        l.register(parse("ctrl+l")).unwrap();

        assert!(l.observe(&KeyEvent::down('L' as u32), ctrl(), false));
        assert!(!l.observe(&KeyEvent::down('L' as u32), ctrl(), true));
        assert!(!l.observe(&KeyEvent::down('L' as u32), ctrl(), true));
        assert!(!l.observe(&KeyEvent::up('L' as u32), ctrl(), false));

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn modifiers_must_match_exactly() {
        let (l, _cell, mut rx) = listener();
        l.register(parse("ctrl+l")).unwrap();

        let ctrl_shift = ModifierState { shift: true, ..ctrl() };
        assert!(!l.observe(&KeyEvent::down('L' as u32), ctrl_shift, false));
        assert!(!l.observe(&KeyEvent::down('L' as u32), ModifierState::NONE, false));
        assert!(!l.observe(&KeyEvent::down('K' as u32), ctrl(), false));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn nothing_matches_without_registration() {
        let (l, _cell, mut rx) = listener();
        assert!(!l.observe(&KeyEvent::down('L' as u32), ctrl(), false));
        assert!(rx.try_recv().is_err());
    }
}
