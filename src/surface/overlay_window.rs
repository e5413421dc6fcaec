//! Transparent, click-through, always-on-top winit window covering one display.

use super::{PresentationSurface, SharedSize};
use crate::capture::{DisplayInfo, WindowHandle};
use crate::error::{CrtError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use winit::dpi::{PhysicalPosition, PhysicalSize};
use winit::event_loop::ActiveEventLoop;
use winit::raw_window_handle::{HasWindowHandle, RawWindowHandle};
use winit::window::{Window, WindowLevel};

/// The overlay window.
pub struct OverlayWindow {
    window: Arc<Window>,
    size: SharedSize,
    visible: AtomicBool,
}

impl OverlayWindow {
    /// Opens the overlay over `display`.
    pub fn create(event_loop: &ActiveEventLoop, display: &DisplayInfo, visible: bool) -> Result<Self> {
        let attributes = Window::default_attributes()
            .with_title("CRT Overlay")
            .with_transparent(true)
            .with_decorations(false)
            .with_resizable(false)
            .with_window_level(WindowLevel::AlwaysOnTop)
            .with_position(PhysicalPosition::new(display.x, display.y))
            .with_inner_size(PhysicalSize::new(display.width.max(1), display.height.max(1)))
            .with_visible(visible);

        let window = event_loop
            .create_window(attributes)
            .map_err(|e| CrtError::Unready(format!("Failed to create overlay window: {e}")))?;

        if let Err(e) = window.set_cursor_hittest(false) {
            warn!("Overlay window is not click-through on this platform: {}", e);
        }

        let inner = window.inner_size();
        let display_id = display.id;
        info!("Overlay window opened on display {} ({}x{})", display_id, inner.width, inner.height);

        Ok(Self {
            window: Arc::new(window),
            size: SharedSize::new(inner.width, inner.height),
            visible: AtomicBool::new(visible),
        })
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    /// Size handle the render target reads each frame.
    pub fn shared_size(&self) -> SharedSize {
        self.size.clone()
    }

    /// Records a new drawable size from a resize event.
    pub fn handle_resize(&self, size: PhysicalSize<u32>) {
        self.size.set(size.width, size.height);
    }
}

impl PresentationSurface for OverlayWindow {
    fn show(&self) {
        self.window.set_visible(true);
        self.visible.store(true, Ordering::Release);
    }

    fn hide(&self) {
        self.window.set_visible(false);
        self.visible.store(false, Ordering::Release);
    }

    fn is_visible(&self) -> bool {
        self.visible.load(Ordering::Acquire)
    }

    /// HWND on Windows, NSWindow on macOS, the X11 window id or Wayland surface elsewhere.
    fn window_handle(&self) -> Option<WindowHandle> {
        let handle = self.window.window_handle().ok()?;
        match handle.as_raw() {
            RawWindowHandle::Win32(h) => Some(h.hwnd.get() as WindowHandle),
            #[cfg(target_os = "macos")]
            RawWindowHandle::AppKit(h) => crate::capture::exclusion::ns_window_of_view(h.ns_view.as_ptr()),
            RawWindowHandle::Xlib(h) => Some(h.window as WindowHandle),
            RawWindowHandle::Xcb(h) => Some(h.window.get() as WindowHandle),
            RawWindowHandle::Wayland(h) => Some(h.surface.as_ptr() as usize as WindowHandle),
            _ => None,
        }
    }
}
