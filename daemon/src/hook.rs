/// Low-level keyboard hook capability.
///
/// The real backend installs `WH_KEYBOARD_LL` on a dedicated message-pump thread
/// and hands every raw event to a [`KeyEventHandler`], whose [`Verdict`] decides
/// whether the event reaches the rest of the system.  Everything above this
/// trait is platform-neutral and is tested with synthetic events.
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::keys::KeyEvent;
use crate::suppressor::Verdict;

/// Receives every raw keyboard event on the hook thread.
///
/// Implementations must return promptly; the OS silently removes hooks that
/// stall.
pub trait KeyEventHandler: Send + Sync {
    fn on_event(&self, event: &KeyEvent) -> Verdict;

    /// Called after `on_event` panicked.  The event has already been passed through.
    fn on_fault(&self);

    /// The interactive session was locked, unlocked or switched.  Key releases
    /// made meanwhile were delivered elsewhere.
    fn on_session_change(&self) {}
}

pub trait KeyboardHook: Send {
    /// Installs the hook, routing events to `handler`.  Installing an already
    /// installed hook is a no-op.
    fn install(&mut self, handler: Arc<dyn KeyEventHandler>) -> Result<(), HookInstallError>;

    /// Removes the hook and stops its thread.  Idempotent.
    fn uninstall(&mut self);

    /// `true` while the hook thread is running.  Windows may also drop a hook
    /// whose callback exceeds `LowLevelHooksTimeout` without telling the thread;
    /// that case is not detected here, and keys then flow through unsuppressed
    /// while overlay-click unlock keeps working.
    fn is_installed(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum HookInstallError {
    #[error("the operating system refused the keyboard hook: {0}")]
    Refused(String),

    #[error("failed to spawn the hook thread")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("hook thread exited before reporting")]
    ThreadDied,

    #[cfg(any(not(windows), test))]
    #[error("low-level keyboard hooks are not supported on this platform")]
    Unsupported,
}

/// Runs `handler` for one event, converting a panic into a pass-through plus a
/// fault report.  Unwinding must never cross the `extern "system"` boundary.
pub fn dispatch(handler: &dyn KeyEventHandler, event: &KeyEvent) -> Verdict {
    match panic::catch_unwind(AssertUnwindSafe(|| handler.on_event(event))) {
        Ok(verdict) => verdict,
        Err(_) => {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| handler.on_fault()));
            Verdict::PassThrough
        }
    }
}

/// Backend for platforms without a low-level keyboard hook.
#[cfg(any(not(windows), test))]
pub struct UnsupportedHook;

#[cfg(any(not(windows), test))]
impl KeyboardHook for UnsupportedHook {
    fn install(&mut self, _handler: Arc<dyn KeyEventHandler>) -> Result<(), HookInstallError> {
        Err(HookInstallError::Unsupported)
    }

    fn uninstall(&mut self) {}

    fn is_installed(&self) -> bool {
        false
    }
}

/// Returns the keyboard hook backend for the current platform.
pub fn platform_hook() -> Box<dyn KeyboardHook> {
    #[cfg(windows)]
    {
        Box::new(imp::WindowsHook::new())
    }

    #[cfg(not(windows))]
    {
        Box::new(UnsupportedHook)
    }
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::cell::RefCell;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::mpsc as std_mpsc;
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use tracing::{debug, info, warn};
    use windows::core::w;
    use windows::Win32::Foundation::{HINSTANCE, HWND, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::System::RemoteDesktop::{
        WTSRegisterSessionNotification, WTSUnRegisterSessionNotification, NOTIFY_FOR_THIS_SESSION,
    };
    use windows::Win32::System::Threading::GetCurrentThreadId;
    use windows::Win32::UI::WindowsAndMessaging::{
        CallNextHookEx, CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW,
        GetMessageW, PostThreadMessageW, RegisterClassW, SetWindowsHookExW, UnhookWindowsHookEx,
        HWND_MESSAGE, KBDLLHOOKSTRUCT, MSG, WH_KEYBOARD_LL, WINDOW_EX_STYLE, WINDOW_STYLE,
        WM_KEYUP, WM_QUIT, WM_SYSKEYUP, WM_WTSSESSION_CHANGE, WNDCLASSW,
    };

    use super::{dispatch, HookInstallError, KeyEventHandler, KeyboardHook};
    use crate::keys::{KeyDirection, KeyEvent};
    use crate::suppressor::Verdict;

    thread_local! {
        /// Handler for the hook installed on this thread.  Only the hook thread
        /// ever sets it, and the hook procedure runs on that same thread.
        static HANDLER: RefCell<Option<Arc<dyn KeyEventHandler>>> = RefCell::new(None);
    }

    /// Low-level keyboard hook procedure.
    ///
    /// Returning a non-zero value without calling `CallNextHookEx` swallows the
    /// event for every application.
    unsafe extern "system" fn keyboard_proc(n_code: i32, w_param: WPARAM, l_param: LPARAM) -> LRESULT {
        if n_code >= 0 {
            let kb = &*(l_param.0 as *const KBDLLHOOKSTRUCT);
            let message = w_param.0 as u32;
            let direction = if message == WM_KEYUP || message == WM_SYSKEYUP {
                KeyDirection::Up
            } else {
                KeyDirection::Down
            };
            let event = KeyEvent { vk: kb.vkCode, scan_code: kb.scanCode, direction };

            let verdict = HANDLER.with(|slot| {
                slot.borrow()
                    .as_ref()
                    .map(|handler| dispatch(handler.as_ref(), &event))
            });
            if verdict == Some(Verdict::Suppress) {
                return LRESULT(1);
            }
        }
        CallNextHookEx(None, n_code, w_param, l_param)
    }

    /// Receives `WM_WTSSESSION_CHANGE`.  Key releases made on the lock screen or
    /// the secure desktop never reach the hook, so the handler forgets held keys.
    unsafe extern "system" fn session_proc(hwnd: HWND, msg: u32, w_param: WPARAM, l_param: LPARAM) -> LRESULT {
        if msg == WM_WTSSESSION_CHANGE {
            HANDLER.with(|slot| {
                if let Some(handler) = slot.borrow().as_ref() {
                    let _ = panic::catch_unwind(AssertUnwindSafe(|| handler.on_session_change()));
                }
            });
            return LRESULT(0);
        }
        DefWindowProcW(hwnd, msg, w_param, l_param)
    }

    /// Creates a message-only window on the hook thread and subscribes it to
    /// session notifications.  `None` if either step fails.
    unsafe fn create_session_window() -> Option<HWND> {
        let hinstance = match GetModuleHandleW(None) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "GetModuleHandleW failed; session changes are not tracked");
                return None;
            }
        };
        let class_name = w!("PawGateSessionSink");
        let wc = WNDCLASSW {
            hInstance: hinstance.into(),
            lpszClassName: class_name,
            lpfnWndProc: Some(session_proc),
            ..Default::default()
        };
        // Fails harmlessly when the class survives from an earlier install.
        let _ = RegisterClassW(&wc);

        let hwnd = match CreateWindowExW(
            WINDOW_EX_STYLE::default(),
            class_name,
            w!("PawGate session"),
            WINDOW_STYLE::default(),
            0,
            0,
            0,
            0,
            HWND_MESSAGE,
            None,
            hinstance,
            None,
        ) {
            Ok(hwnd) => hwnd,
            Err(e) => {
                warn!(error = %e, "session window unavailable; session changes are not tracked");
                return None;
            }
        };
        if let Err(e) = WTSRegisterSessionNotification(hwnd, NOTIFY_FOR_THIS_SESSION) {
            warn!(error = %e, "session notifications unavailable");
            let _ = DestroyWindow(hwnd);
            return None;
        }
        Some(hwnd)
    }

    struct HookThread {
        thread: JoinHandle<()>,
        thread_id: u32,
    }

    pub struct WindowsHook {
        running: Option<HookThread>,
    }

    impl WindowsHook {
        pub fn new() -> Self {
            Self { running: None }
        }
    }

    impl KeyboardHook for WindowsHook {
        fn install(&mut self, handler: Arc<dyn KeyEventHandler>) -> Result<(), HookInstallError> {
            if self.is_installed() {
                return Ok(());
            }
            // A previous thread that died on its own still needs joining.
            self.uninstall();

            let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<u32, String>>(1);
            let thread = std::thread::Builder::new()
                .name("keyboard-hook".into())
                .spawn(move || run_message_pump(handler, ready_tx))
                .map_err(HookInstallError::ThreadSpawn)?;

            match ready_rx.recv() {
                Ok(Ok(thread_id)) => {
                    self.running = Some(HookThread { thread, thread_id });
                    info!("keyboard hook installed");
                    Ok(())
                }
                Ok(Err(e)) => {
                    let _ = thread.join();
                    Err(HookInstallError::Refused(e))
                }
                Err(_) => {
                    let _ = thread.join();
                    Err(HookInstallError::ThreadDied)
                }
            }
        }

        fn uninstall(&mut self) {
            if let Some(running) = self.running.take() {
                post_quit(running.thread_id);
                let _ = running.thread.join();
            }
        }

        fn is_installed(&self) -> bool {
            self.running.as_ref().is_some_and(|r| !r.thread.is_finished())
        }
    }

    impl Drop for WindowsHook {
        fn drop(&mut self) {
            self.uninstall();
        }
    }

    /// Installs `WH_KEYBOARD_LL`, runs a Windows message pump until `WM_QUIT`,
    /// then uninstalls the hook.
    ///
    /// Reports the thread ID (or the install error) on `ready_tx` before entering
    /// the pump so the caller can later post `WM_QUIT`.
    fn run_message_pump(
        handler: Arc<dyn KeyEventHandler>,
        ready_tx: std_mpsc::SyncSender<Result<u32, String>>,
    ) {
        HANDLER.with(|slot| *slot.borrow_mut() = Some(handler));

        unsafe {
            let hook = match SetWindowsHookExW(WH_KEYBOARD_LL, Some(keyboard_proc), HINSTANCE::default(), 0) {
                Ok(hook) => hook,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let session = create_session_window();
            let _ = ready_tx.send(Ok(GetCurrentThreadId()));
            drop(ready_tx);

            let mut msg = MSG::default();
            // GetMessageW: >0 = message, 0 = WM_QUIT, <0 = error.
            while GetMessageW(&mut msg, None, 0, 0).0 > 0 {
                DispatchMessageW(&msg);
            }

            if let Some(hwnd) = session {
                let _ = WTSUnRegisterSessionNotification(hwnd);
                let _ = DestroyWindow(hwnd);
            }
            let _ = UnhookWindowsHookEx(hook);
        }

        HANDLER.with(|slot| slot.borrow_mut().take());
        debug!("hook thread exited");
    }

    /// Posts `WM_QUIT` to `thread_id`, causing its `GetMessageW` loop to exit.
    fn post_quit(thread_id: u32) {
        unsafe {
            let _ = PostThreadMessageW(thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
