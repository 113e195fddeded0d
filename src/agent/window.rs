//! Window enumeration, foregrounding and minimisation inside the guest.
//!
//! The watcher only ever needs three things from the window manager: the
//! dimensions of the window owned by the target process (to spot the
//! fixed-size anti-cheat splash), a way to push the target's windows to
//! the foreground once it is ready, and a way to minimise configured
//! helper windows before launch. Ownership is checked by pid so a foreign
//! foreground window can never stand in for the application's own. All of
//! it is Win32 inside the guest; elsewhere the operations degrade to
//! no-ops so the watcher logic stays testable.

/// A top-level window as seen by the watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowInfo {
    /// Native handle, opaque outside this module.
    pub handle: isize,
    /// Pid of the owning process.
    pub pid: u32,
    pub title: String,
    pub width: i32,
    pub height: i32,
}

/// Helper windows that must never be mistaken for the application window
/// or dragged to the foreground.
const TITLE_BLACKLIST: &[&str] = &[
    "MSCTFIME UI",
    "Default IME",
    "Battery Watcher",
    "WinEventHub",
    "$AS",
    "$Hour",
];

/// Substring match against the blacklist; empty titles are also skipped.
pub fn title_is_blacklisted(title: &str) -> bool {
    title.is_empty() || TITLE_BLACKLIST.iter().any(|frag| title.contains(frag))
}

pub use imp::{bring_to_foreground, main_window, minimise_windows};

// ---------------------------------------------------------------------------
// Win32
// ---------------------------------------------------------------------------

#[cfg(windows)]
mod imp {
    use super::{WindowInfo, title_is_blacklisted};
    use tracing::{debug, warn};
    use windows::Win32::Foundation::{BOOL, HWND, LPARAM, RECT};
    use windows::Win32::UI::WindowsAndMessaging::{
        EnumWindows, GWL_STYLE, GetWindowLongW, GetWindowRect, GetWindowTextW,
        GetWindowThreadProcessId, HWND_NOTOPMOST, HWND_TOPMOST, IsWindowVisible, SW_MINIMIZE,
        SWP_NOMOVE, SWP_NOSIZE, SWP_SHOWWINDOW, SetForegroundWindow, SetWindowPos, ShowWindow,
        WS_DISABLED,
    };

    fn window_info(hwnd: HWND) -> Option<WindowInfo> {
        unsafe {
            if !IsWindowVisible(hwnd).as_bool() {
                return None;
            }
            let style = GetWindowLongW(hwnd, GWL_STYLE) as u32;
            if style & WS_DISABLED.0 != 0 {
                return None;
            }
            let mut buf = [0u16; 512];
            let len = GetWindowTextW(hwnd, &mut buf) as usize;
            let title = String::from_utf16_lossy(&buf[..len]);
            if title_is_blacklisted(&title) {
                return None;
            }
            let mut pid = 0u32;
            GetWindowThreadProcessId(hwnd, Some(&mut pid));
            let mut rect = RECT::default();
            GetWindowRect(hwnd, &mut rect).ok()?;
            Some(WindowInfo {
                handle: hwnd.0 as isize,
                pid,
                title,
                width: rect.right - rect.left,
                height: rect.bottom - rect.top,
            })
        }
    }

    fn visible_windows() -> Vec<WindowInfo> {
        unsafe extern "system" fn collect(hwnd: HWND, lparam: LPARAM) -> BOOL {
            let windows = unsafe { &mut *(lparam.0 as *mut Vec<WindowInfo>) };
            if let Some(info) = window_info(hwnd) {
                windows.push(info);
            }
            BOOL(1)
        }

        let mut windows: Vec<WindowInfo> = Vec::new();
        let lparam = LPARAM(&mut windows as *mut _ as isize);
        if let Err(e) = unsafe { EnumWindows(Some(collect), lparam) } {
            warn!(error = %e, "window enumeration failed");
        }
        windows
    }

    /// Frontmost visible window owned by one of the given pids. Enumeration
    /// order is z-order, so the first owned match is the one the user sees.
    pub fn main_window(pids: &[u32]) -> Option<WindowInfo> {
        visible_windows()
            .into_iter()
            .find(|win| pids.contains(&win.pid))
    }

    fn set_topmost(hwnd: HWND, insert_after: HWND) {
        let flags = SWP_NOMOVE | SWP_NOSIZE | SWP_SHOWWINDOW;
        if let Err(e) = unsafe { SetWindowPos(hwnd, insert_after, 0, 0, 0, 0, flags) } {
            debug!(error = %e, "SetWindowPos failed");
        }
    }

    /// Push every window owned by the given pids to the foreground. Each is
    /// briefly made topmost to force it above whatever held the z-order;
    /// unless `always_on_top`, the pin is released immediately after.
    pub fn bring_to_foreground(pids: &[u32], always_on_top: bool) {
        for win in visible_windows() {
            if !pids.contains(&win.pid) {
                continue;
            }
            debug!(title = %win.title, pid = win.pid, "bringing window to foreground");
            let hwnd = HWND(win.handle as *mut core::ffi::c_void);
            set_topmost(hwnd, HWND_TOPMOST);
            if !always_on_top {
                set_topmost(hwnd, HWND_NOTOPMOST);
            }
            unsafe {
                let _ = SetForegroundWindow(hwnd);
            }
        }
    }

    /// Minimise every visible window whose title contains one of the given
    /// fragments (case-insensitive).
    pub fn minimise_windows(fragments: &[String]) {
        if fragments.is_empty() {
            return;
        }
        for win in visible_windows() {
            let title = win.title.to_lowercase();
            if fragments.iter().any(|f| title.contains(&f.to_lowercase())) {
                debug!(title = %win.title, "minimising window");
                unsafe {
                    let _ = ShowWindow(HWND(win.handle as *mut core::ffi::c_void), SW_MINIMIZE);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stub for non-Windows builds (development and unit tests)
// ---------------------------------------------------------------------------

#[cfg(not(windows))]
mod imp {
    use super::WindowInfo;

    pub fn main_window(_pids: &[u32]) -> Option<WindowInfo> {
        None
    }

    pub fn bring_to_foreground(_pids: &[u32], _always_on_top: bool) {}

    pub fn minimise_windows(_fragments: &[String]) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_windows_are_blacklisted() {
        assert!(title_is_blacklisted("MSCTFIME UI"));
        assert!(title_is_blacklisted("Default IME"));
        assert!(title_is_blacklisted("$AS overlay 3"));
        assert!(title_is_blacklisted("Clock $Hour"));
        assert!(title_is_blacklisted(""));
    }

    #[test]
    fn application_windows_are_not() {
        assert!(!title_is_blacklisted("DiRT Rally"));
        assert!(!title_is_blacklisted("Steam"));
    }
}
