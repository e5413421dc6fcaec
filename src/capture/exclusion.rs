//! Keeping the overlay window out of its own capture.

use super::WindowHandle;
use crate::error::Result;

/// Marks `window` (an HWND) as excluded from screen capture.
#[cfg(target_os = "windows")]
pub(crate) fn exclude_from_capture(window: WindowHandle) -> Result<bool> {
    use crate::error::CrtError;
    use windows::Win32::Foundation::HWND;
    use windows::Win32::UI::WindowsAndMessaging::{SetWindowDisplayAffinity, WDA_EXCLUDEFROMCAPTURE};

    let hwnd = HWND(window as isize as *mut std::ffi::c_void);
    unsafe { SetWindowDisplayAffinity(hwnd, WDA_EXCLUDEFROMCAPTURE) }
        .map_err(|e| CrtError::Capture(format!("SetWindowDisplayAffinity failed: {e}")))?;
    Ok(true)
}

/// `NSWindowSharingNone`
#[cfg(target_os = "macos")]
const NS_WINDOW_SHARING_NONE: usize = 0;

/// Marks `window` (an NSWindow) as excluded from screen capture.
///
/// Must run on the main thread, like every other AppKit call on the window.
#[cfg(target_os = "macos")]
pub(crate) fn exclude_from_capture(window: WindowHandle) -> Result<bool> {
    use crate::error::CrtError;
    use objc::runtime::Object;
    use objc::{msg_send, sel, sel_impl};

    let ns_window = window as usize as *mut Object;
    if ns_window.is_null() {
        return Err(CrtError::Capture("overlay has no NSWindow".into()));
    }
    unsafe {
        let _: () = msg_send![ns_window, setSharingType: NS_WINDOW_SHARING_NONE];
    }
    Ok(true)
}

/// The NSWindow that owns `ns_view`, as a window handle.
#[cfg(target_os = "macos")]
pub(crate) fn ns_window_of_view(ns_view: *mut std::ffi::c_void) -> Option<WindowHandle> {
    use objc::runtime::Object;
    use objc::{msg_send, sel, sel_impl};

    let ns_view = ns_view as *mut Object;
    if ns_view.is_null() {
        return None;
    }
    let ns_window: *mut Object = unsafe { msg_send![ns_view, window] };
    (!ns_window.is_null()).then(|| ns_window as usize as WindowHandle)
}

/// No exclusion API on this platform.
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
pub(crate) fn exclude_from_capture(_window: WindowHandle) -> Result<bool> {
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "macos")]
    #[test]
    fn test_null_window_is_rejected() {
        assert!(ns_window_of_view(std::ptr::null_mut()).is_none());
        assert!(exclude_from_capture(0).is_err());
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    #[test]
    fn test_unsupported_platform_reports_no_exclusion() {
        assert!(!exclude_from_capture(42).unwrap());
    }
}
