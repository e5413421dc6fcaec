//! The presentation surface: the overlay window the effect is drawn into.

mod overlay_window;

pub use overlay_window::OverlayWindow;

use crate::capture::WindowHandle;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A window the pipeline presents into.
///
/// Visibility changes never touch the render path; a hidden surface keeps
/// receiving frames.
pub trait PresentationSurface: Send + Sync {
    fn show(&self);
    fn hide(&self);
    fn is_visible(&self) -> bool;

    fn toggle(&self) {
        if self.is_visible() {
            self.hide();
        } else {
            self.show();
        }
    }

    /// Platform handle used to exclude the surface from capture, if any.
    fn window_handle(&self) -> Option<WindowHandle> {
        None
    }
}

/// Drawable size in pixels, written by the event loop and read by the delivery thread.
#[derive(Debug, Clone, Default)]
pub struct SharedSize(Arc<AtomicU64>);

impl SharedSize {
    pub fn new(width: u32, height: u32) -> Self {
        let size = Self::default();
        size.set(width, height);
        size
    }

    pub fn set(&self, width: u32, height: u32) {
        self.0.store(((width as u64) << 32) | height as u64, Ordering::Release);
    }

    pub fn get(&self) -> (u32, u32) {
        let packed = self.0.load(Ordering::Acquire);
        ((packed >> 32) as u32, packed as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Flag(AtomicBool);

    impl PresentationSurface for Flag {
        fn show(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
        fn hide(&self) {
            self.0.store(false, Ordering::SeqCst);
        }
        fn is_visible(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_shared_size_round_trips_extremes() {
        let size = SharedSize::new(u32::MAX, 0);
        assert_eq!(size.get(), (u32::MAX, 0));
        let clone = size.clone();
        clone.set(1920, 1080);
        assert_eq!(size.get(), (1920, 1080));
    }

    #[test]
    fn test_toggle_flips_visibility() {
        let surface = Flag::default();
        surface.toggle();
        assert!(surface.is_visible());
        surface.toggle();
        assert!(!surface.is_visible());
        assert_eq!(surface.window_handle(), None);
    }
}
