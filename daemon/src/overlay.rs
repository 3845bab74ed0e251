/// Click-to-unlock overlay.
///
/// A full-screen, topmost, semi-transparent surface shown while the keyboard is
/// locked.  A click anywhere on it asks the state machine to unlock; the overlay
/// itself owns no lock-state logic and only reacts to `show` / `hide`.
use tracing::{info, warn};

use crate::config::{DEFAULT_OPACITY_PERCENT, DEFAULT_OVERLAY_RGB};
use crate::event::ToggleSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appearance {
    /// Already clamped to the configured range.
    pub opacity_percent: u8,
    pub color: (u8, u8, u8),
}

impl Default for Appearance {
    fn default() -> Self {
        Self { opacity_percent: DEFAULT_OPACITY_PERCENT, color: DEFAULT_OVERLAY_RGB }
    }
}

impl Appearance {
    /// Layered-window alpha (0-255) for the opacity percentage.
    pub fn alpha(&self) -> u8 {
        (u32::from(self.opacity_percent.min(100)) * 255 / 100) as u8
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("failed to spawn the overlay thread")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("overlay window could not be created: {0}")]
    Create(String),

    #[error("overlay window did not accept the request: {0}")]
    Post(String),
}

pub trait Overlay: Send {
    fn show(&mut self) -> Result<(), OverlayError>;
    fn hide(&mut self) -> Result<(), OverlayError>;
    fn set_appearance(&mut self, appearance: Appearance) -> Result<(), OverlayError>;
}

/// Overlay that only logs.  Used where no window can be created.
pub struct HeadlessOverlay {
    appearance: Appearance,
}

impl HeadlessOverlay {
    pub fn new(appearance: Appearance) -> Self {
        Self { appearance }
    }
}

impl Overlay for HeadlessOverlay {
    fn show(&mut self) -> Result<(), OverlayError> {
        info!(opacity = self.appearance.opacity_percent, "overlay shown (headless)");
        Ok(())
    }

    fn hide(&mut self) -> Result<(), OverlayError> {
        info!("overlay hidden (headless)");
        Ok(())
    }

    fn set_appearance(&mut self, appearance: Appearance) -> Result<(), OverlayError> {
        self.appearance = appearance;
        Ok(())
    }
}

/// Creates the overlay for the current platform.  Clicks on it are delivered
/// through `clicks`.  Falls back to [`HeadlessOverlay`] if the window cannot be
/// created.
pub fn platform_overlay(appearance: Appearance, clicks: ToggleSender) -> Box<dyn Overlay> {
    #[cfg(windows)]
    {
        match imp::WindowOverlay::spawn(appearance, clicks) {
            Ok(overlay) => Box::new(overlay),
            Err(e) => {
                warn!(error = %e, "overlay window unavailable; unlocking by click is disabled");
                Box::new(HeadlessOverlay::new(appearance))
            }
        }
    }

    #[cfg(not(windows))]
    {
        drop(clicks);
        warn!("no overlay window on this platform; unlocking by click is disabled");
        Box::new(HeadlessOverlay::new(appearance))
    }
}

// ── Windows implementation ────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use std::cell::{Cell, RefCell};
    use std::sync::mpsc as std_mpsc;
    use std::thread::JoinHandle;

    use tracing::{debug, warn};
    use windows::core::w;
    use windows::Win32::Foundation::{COLORREF, HWND, LPARAM, LRESULT, TRUE, WPARAM};
    use windows::Win32::Graphics::Gdi::{
        BeginPaint, CreateSolidBrush, DeleteObject, EndPaint, FillRect, InvalidateRect, HBRUSH,
        PAINTSTRUCT,
    };
    use windows::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, GetMessageW,
        GetSystemMetrics, LoadCursorW, PostMessageW, PostQuitMessage, RegisterClassW,
        SetLayeredWindowAttributes, SetWindowPos, ShowWindow, TranslateMessage, HWND_TOPMOST,
        IDC_ARROW, LWA_ALPHA, MSG, SM_CXVIRTUALSCREEN, SM_CYVIRTUALSCREEN, SM_XVIRTUALSCREEN,
        SM_YVIRTUALSCREEN, SWP_SHOWWINDOW, SW_HIDE, WM_APP, WM_CLOSE, WM_DESTROY, WM_LBUTTONDOWN,
        WM_MBUTTONDOWN, WM_PAINT, WM_RBUTTONDOWN, WNDCLASSW, WS_EX_LAYERED, WS_EX_TOOLWINDOW,
        WS_EX_TOPMOST, WS_POPUP,
    };

    use super::{Appearance, Overlay, OverlayError};
    use crate::event::ToggleSender;
    use crate::state::{LockState, Trigger};

    const WM_OVERLAY_SHOW: u32 = WM_APP + 1;
    const WM_OVERLAY_HIDE: u32 = WM_APP + 2;
    /// wParam = alpha, lParam = COLORREF.
    const WM_OVERLAY_APPEARANCE: u32 = WM_APP + 3;
    const WM_OVERLAY_DESTROY: u32 = WM_APP + 4;

    thread_local! {
        static CLICKS: RefCell<Option<ToggleSender>> = RefCell::new(None);
        static BRUSH: Cell<HBRUSH> = Cell::new(HBRUSH::default());
    }

    pub struct WindowOverlay {
        /// Raw HWND; window handles are only used to post messages across threads.
        hwnd: isize,
        thread: Option<JoinHandle<()>>,
    }

    impl WindowOverlay {
        pub fn spawn(appearance: Appearance, clicks: ToggleSender) -> Result<Self, OverlayError> {
            let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<isize, String>>(1);
            let thread = std::thread::Builder::new()
                .name("overlay-pump".into())
                .spawn(move || run_window(appearance, clicks, ready_tx))
                .map_err(OverlayError::ThreadSpawn)?;

            match ready_rx.recv() {
                Ok(Ok(hwnd)) => Ok(Self { hwnd, thread: Some(thread) }),
                Ok(Err(e)) => {
                    let _ = thread.join();
                    Err(OverlayError::Create(e))
                }
                Err(_) => {
                    let _ = thread.join();
                    Err(OverlayError::Create("overlay thread exited before reporting".into()))
                }
            }
        }

        fn post(&self, msg: u32, wparam: WPARAM, lparam: LPARAM) -> Result<(), OverlayError> {
            unsafe { PostMessageW(HWND(self.hwnd as _), msg, wparam, lparam) }
                .map_err(|e| OverlayError::Post(e.to_string()))
        }
    }

    impl Overlay for WindowOverlay {
        fn show(&mut self) -> Result<(), OverlayError> {
            self.post(WM_OVERLAY_SHOW, WPARAM(0), LPARAM(0))
        }

        fn hide(&mut self) -> Result<(), OverlayError> {
            self.post(WM_OVERLAY_HIDE, WPARAM(0), LPARAM(0))
        }

        fn set_appearance(&mut self, appearance: Appearance) -> Result<(), OverlayError> {
            self.post(
                WM_OVERLAY_APPEARANCE,
                WPARAM(appearance.alpha() as usize),
                LPARAM(colorref(appearance.color).0 as isize),
            )
        }
    }

    impl Drop for WindowOverlay {
        fn drop(&mut self) {
            let _ = self.post(WM_OVERLAY_DESTROY, WPARAM(0), LPARAM(0));
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn colorref((r, g, b): (u8, u8, u8)) -> COLORREF {
        COLORREF(u32::from(r) | (u32::from(g) << 8) | (u32::from(b) << 16))
    }

    unsafe fn apply_appearance(hwnd: HWND, alpha: u8, color: COLORREF) {
        let old = BRUSH.with(|b| b.replace(CreateSolidBrush(color)));
        if !old.is_invalid() {
            let _ = DeleteObject(old);
        }
        if let Err(e) = SetLayeredWindowAttributes(hwnd, COLORREF(0), alpha, LWA_ALPHA) {
            warn!(error = %e, "SetLayeredWindowAttributes failed");
        }
        let _ = InvalidateRect(hwnd, None, TRUE);
    }

    /// Stretches the window over every monitor and raises it above everything.
    unsafe fn cover_virtual_screen(hwnd: HWND) {
        let x = GetSystemMetrics(SM_XVIRTUALSCREEN);
        let y = GetSystemMetrics(SM_YVIRTUALSCREEN);
        let cx = GetSystemMetrics(SM_CXVIRTUALSCREEN);
        let cy = GetSystemMetrics(SM_CYVIRTUALSCREEN);
        if let Err(e) = SetWindowPos(hwnd, HWND_TOPMOST, x, y, cx, cy, SWP_SHOWWINDOW) {
            warn!(error = %e, "SetWindowPos failed");
        }
    }

    unsafe extern "system" fn wnd_proc(hwnd: HWND, msg: u32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
        match msg {
            WM_OVERLAY_SHOW => {
                cover_virtual_screen(hwnd);
                LRESULT(0)
            }
            WM_OVERLAY_HIDE => {
                let _ = ShowWindow(hwnd, SW_HIDE);
                LRESULT(0)
            }
            WM_OVERLAY_APPEARANCE => {
                apply_appearance(hwnd, wparam.0 as u8, COLORREF(lparam.0 as u32));
                LRESULT(0)
            }
            WM_OVERLAY_DESTROY => {
                let _ = DestroyWindow(hwnd);
                LRESULT(0)
            }
            WM_PAINT => {
                let mut ps = PAINTSTRUCT::default();
                let hdc = BeginPaint(hwnd, &mut ps);
                FillRect(hdc, &ps.rcPaint, BRUSH.with(Cell::get));
                let _ = EndPaint(hwnd, &ps);
                LRESULT(0)
            }
            WM_LBUTTONDOWN | WM_RBUTTONDOWN | WM_MBUTTONDOWN => {
                CLICKS.with(|slot| {
                    if let Some(clicks) = slot.borrow().as_ref() {
                        if !clicks.request(Trigger::OverlayClick, LockState::Locked) {
                            warn!("overlay click dropped; event channel unavailable");
                        }
                    }
                });
                LRESULT(0)
            }
            // Alt+F4 must not remove the overlay while locked.
            WM_CLOSE => LRESULT(0),
            WM_DESTROY => {
                PostQuitMessage(0);
                LRESULT(0)
            }
            _ => DefWindowProcW(hwnd, msg, wparam, lparam),
        }
    }

    fn run_window(
        appearance: Appearance,
        clicks: ToggleSender,
        ready_tx: std_mpsc::SyncSender<Result<isize, String>>,
    ) {
        CLICKS.with(|slot| *slot.borrow_mut() = Some(clicks));

        unsafe {
            let hinstance = match GetModuleHandleW(None) {
                Ok(h) => h,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };
            let class_name = w!("PawGateOverlay");
            let wc = WNDCLASSW {
                hInstance: hinstance.into(),
                lpszClassName: class_name,
                lpfnWndProc: Some(wnd_proc),
                hCursor: LoadCursorW(None, IDC_ARROW).unwrap_or_default(),
                ..Default::default()
            };
            if RegisterClassW(&wc) == 0 {
                let _ = ready_tx.send(Err("RegisterClassW failed".into()));
                return;
            }

            let hwnd = match CreateWindowExW(
                WS_EX_LAYERED | WS_EX_TOPMOST | WS_EX_TOOLWINDOW,
                class_name,
                w!("PawGate"),
                WS_POPUP,
                GetSystemMetrics(SM_XVIRTUALSCREEN),
                GetSystemMetrics(SM_YVIRTUALSCREEN),
                GetSystemMetrics(SM_CXVIRTUALSCREEN),
                GetSystemMetrics(SM_CYVIRTUALSCREEN),
                None,
                None,
                hinstance,
                None,
            ) {
                Ok(hwnd) => hwnd,
                Err(e) => {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
            };

            apply_appearance(hwnd, appearance.alpha(), colorref(appearance.color));
            let _ = ready_tx.send(Ok(hwnd.0 as isize));
            drop(ready_tx);

            let mut msg = MSG::default();
            // GetMessageW: >0 = message, 0 = WM_QUIT, <0 = error.
            while GetMessageW(&mut msg, None, 0, 0).0 > 0 {
                let _ = TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }

            let brush = BRUSH.with(|b| b.replace(HBRUSH::default()));
            if !brush.is_invalid() {
                let _ = DeleteObject(brush);
            }
        }

        CLICKS.with(|slot| slot.borrow_mut().take());
        debug!("overlay thread exited");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpha_scales_percent_to_byte() {
        let at = |pct| Appearance { opacity_percent: pct, color: (0, 0, 0) }.alpha();
        assert_eq!(at(0), 0);
        assert_eq!(at(30), 76);
        assert_eq!(at(90), 229);
        assert_eq!(at(100), 255);
        assert_eq!(at(200), 255);
    }

    #[test]
    fn default_appearance_is_forest_green_at_thirty_percent() {
        let a = Appearance::default();
        assert_eq!(a.opacity_percent, 30);
        assert_eq!(a.color, (0x1B, 0x5E, 0x20));
    }

    #[test]
    fn headless_overlay_accepts_every_request() {
        let mut o = HeadlessOverlay::new(Appearance::default());
        assert!(o.show().is_ok());
        assert!(o.set_appearance(Appearance { opacity_percent: 90, color: (0, 0, 0) }).is_ok());
        assert!(o.hide().is_ok());
    }
}
