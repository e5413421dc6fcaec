//! Display capture: producers, the single-slot handoff and the delivery thread.

pub(crate) mod exclusion;
mod slot;
mod source;
mod synthetic;
mod xcap_backend;

pub use slot::{FrameSlot, PushOutcome};
pub use source::{CaptureStats, FrameSource};
pub use synthetic::{FrameInjector, InjectedProducer, SyntheticDisplays, SyntheticProducer};
pub use xcap_backend::{XcapDisplays, XcapProducer};

use crate::error::{CrtError, Result};
use std::sync::Arc;

/// Platform window handle, as a plain integer (HWND, NSWindow pointer, X11 window id).
pub type WindowHandle = u64;

/// A platform capture session feeding frames into a slot.
///
/// Producers run on their own threads and never call the frame handler
/// directly; the delivery thread in [`FrameSource`] drains the slot.
pub trait FrameProducer: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Starts pushing frames into `slot`. Returns once the session is running.
    fn start(&mut self, slot: Arc<FrameSlot>, config: &CaptureConfig) -> Result<()>;

    /// Stops the session. No frames are pushed after this returns.
    fn stop(&mut self);

    /// Keeps `window` out of the captured image where the platform allows it.
    ///
    /// Returns `Ok(false)` when the platform has no such mechanism.
    fn exclude_window(&mut self, window: WindowHandle) -> Result<bool> {
        let _ = window;
        Ok(false)
    }
}

/// Configuration for a capture session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Display to capture
    pub display_id: u32,
    /// Target capture rate
    pub fps: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            display_id: 0,
            fps: 60,
        }
    }
}

/// An attached display.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayInfo {
    pub id: u32,
    pub name: String,
    pub x: i32,
    pub y: i32,
    /// Size in device pixels
    pub width: u32,
    pub height: u32,
    pub scale_factor: f32,
    pub is_primary: bool,
}

/// Enumerates displays and opens capture sessions on them.
pub trait DisplayProvider: Send + Sync {
    fn displays(&self) -> Result<Vec<DisplayInfo>>;

    /// Builds an idle producer for display `id`.
    fn producer(&self, id: u32) -> Result<Box<dyn FrameProducer>>;

    fn display(&self, id: u32) -> Result<DisplayInfo> {
        self.displays()?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or(CrtError::DisplayNotFound(id))
    }

    /// The primary display, or the first one if none is marked primary.
    fn main_display(&self) -> Result<DisplayInfo> {
        let displays = self.displays()?;
        displays
            .iter()
            .find(|d| d.is_primary)
            .or_else(|| displays.first())
            .cloned()
            .ok_or_else(|| CrtError::Capture("no displays attached".into()))
    }
}
