//! The overlay context: one capture source, one render engine, one surface.
//!
//! Every operation a host needs goes through this object. It owns the wiring
//! between the three components and the shutdown order (capture stops before
//! the engine goes away).

use crate::capture::{CaptureConfig, CaptureStats, DisplayInfo, DisplayProvider, FrameSource};
use crate::engine::{RenderEngine, TelemetrySnapshot};
use crate::error::Result;
use crate::shader::uniforms::CrtParams;
use crate::shader::{GpuDevice, ShaderSource};
use crate::surface::PresentationSurface;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Host-facing handle on a running overlay pipeline.
pub struct OverlayContext<D: GpuDevice> {
    engine: Arc<RenderEngine<D>>,
    target: Arc<Mutex<D::Target>>,
    displays: Box<dyn DisplayProvider>,
    surface: Option<Arc<dyn PresentationSurface>>,
    source: Mutex<Option<FrameSource>>,
    // Held across start/stop; status reads only take `source`
    lifecycle: Mutex<()>,
    capture_fps: u32,
    last_error: Mutex<Option<String>>,
}

impl<D: GpuDevice> OverlayContext<D> {
    /// Wires an engine and its render target to a display provider.
    ///
    /// Capture does not start until [`OverlayContext::start_capture`].
    pub fn new(
        engine: RenderEngine<D>,
        target: D::Target,
        displays: Box<dyn DisplayProvider>,
        surface: Option<Arc<dyn PresentationSurface>>,
        capture_fps: u32,
    ) -> Self {
        Self {
            engine: Arc::new(engine),
            target: Arc::new(Mutex::new(target)),
            displays,
            surface,
            source: Mutex::new(None),
            lifecycle: Mutex::new(()),
            capture_fps,
            last_error: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &RenderEngine<D> {
        &self.engine
    }

    /// Failure of the most recent fallible operation; cleared when one succeeds.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record<T>(&self, result: Result<T>) -> Result<T> {
        *self.last_error.lock() = result.as_ref().err().map(|e| e.to_string());
        result
    }

    /// Starts capturing `display_id`, replacing any running session.
    pub fn start_capture(&self, display_id: u32) -> Result<()> {
        let result = self.start_capture_inner(display_id);
        self.record(result)
    }

    fn start_capture_inner(&self, display_id: u32) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        let previous = self.source.lock().take();
        if let Some(mut previous) = previous {
            previous.stop();
        }

        let producer = self.displays.producer(display_id)?;
        let config = CaptureConfig {
            display_id,
            fps: self.capture_fps,
        };
        let mut next = FrameSource::new(producer, config);
        next.set_excluded_window(self.surface.as_ref().and_then(|s| s.window_handle()));

        let engine = Arc::clone(&self.engine);
        let target = Arc::clone(&self.target);
        next.set_frame_handler(move |frame| {
            let mut target = target.lock();
            engine.process_frame(frame, &mut target);
        })?;
        next.start()?;

        *self.source.lock() = Some(next);
        Ok(())
    }

    /// Stops capture. No frame is processed after this returns.
    pub fn stop_capture(&self) {
        let _lifecycle = self.lifecycle.lock();
        let source = self.source.lock().take();
        if let Some(mut source) = source {
            source.stop();
        }
    }

    /// True while frames are being captured and can still be rendered.
    ///
    /// Goes false when the producer gives up or the GPU device is lost.
    pub fn is_running(&self) -> bool {
        !self.engine.is_lost() && self.source.lock().as_ref().is_some_and(|s| s.is_capturing())
    }

    pub fn capture_stats(&self) -> Option<CaptureStats> {
        self.source.lock().as_ref().map(|s| s.stats())
    }

    /// Compiles WGSL source and activates it.
    pub fn load_shader(&self, code: &str) -> Result<()> {
        self.load_shader_source(ShaderSource::wgsl(code))
    }

    pub fn load_shader_source(&self, source: ShaderSource) -> Result<()> {
        let result = self.engine.load_shader_from_source(source);
        self.record(result)
    }

    pub fn load_shader_from_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let result = self.engine.load_shader_from_file(path);
        self.record(result)
    }

    pub fn reload_shader(&self) -> Result<()> {
        let result = self.engine.reload_shader();
        self.record(result)
    }

    pub fn set_uniform_float(&self, name: &str, value: f32) {
        self.engine.set_uniform_float(name, value);
    }

    pub fn set_uniform_int(&self, name: &str, value: i32) {
        self.engine.set_uniform_int(name, value);
    }

    pub fn update_uniforms(&self, params: CrtParams) {
        self.engine.update_uniforms(params);
    }

    pub fn show_overlay(&self) {
        if let Some(surface) = &self.surface {
            surface.show();
        }
    }

    pub fn hide_overlay(&self) {
        if let Some(surface) = &self.surface {
            surface.hide();
        }
    }

    pub fn toggle_overlay(&self) {
        if let Some(surface) = &self.surface {
            surface.toggle();
        }
    }

    pub fn is_overlay_visible(&self) -> bool {
        self.surface.as_ref().is_some_and(|s| s.is_visible())
    }

    pub fn fps(&self) -> f32 {
        self.engine.current_fps()
    }

    pub fn latency_ms(&self) -> f32 {
        self.engine.current_latency_ms()
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.engine.telemetry()
    }

    pub fn displays(&self) -> Result<Vec<DisplayInfo>> {
        let result = self.displays.displays();
        self.record(result)
    }

    pub fn main_display_id(&self) -> Result<u32> {
        let result = self.displays.main_display().map(|d| d.id);
        self.record(result)
    }

    /// Pixel size of display `id`.
    pub fn display_size(&self, id: u32) -> Result<(u32, u32)> {
        let result = self.displays.display(id).map(|d| (d.width, d.height));
        self.record(result)
    }

    /// Stops capture and hides the overlay. Safe to call more than once.
    pub fn shutdown(&self) {
        let was_running = self.source.lock().is_some();
        self.stop_capture();
        self.hide_overlay();
        if was_running {
            let telemetry = self.telemetry();
            info!(
                "Overlay shut down after {} presented and {} dropped frames",
                telemetry.presented, telemetry.dropped
            );
        }
    }
}

impl<D: GpuDevice> Drop for OverlayContext<D> {
    fn drop(&mut self) {
        if self.source.get_mut().is_some() {
            warn!("Overlay context dropped while capturing; stopping capture");
        }
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameInjector, PushOutcome, SyntheticDisplays};
    use crate::error::CrtError;
    use crate::frame::{OwnedFrame, PixelFormat};
    use crate::shader::CRT_SHADER;
    use crate::testing::{wait_for, FakeDevice, FakeSurface, FakeTarget, ManualClock};
    use std::time::Duration;

    struct Harness {
        context: OverlayContext<FakeDevice>,
        injector: FrameInjector,
        clock: Arc<ManualClock>,
        target: FakeTarget,
    }

    fn harness(sizes: Vec<(u32, u32)>) -> Harness {
        let clock = Arc::new(ManualClock::new());
        let device = FakeDevice::new(Arc::clone(&clock), Duration::from_millis(2));
        let engine = RenderEngine::with_clock(device, clock.clone());
        let (displays, injector) = SyntheticDisplays::new(sizes).with_primary(1).with_injector();
        let target = FakeTarget::new(1920, 1080);
        let surface: Arc<dyn PresentationSurface> = Arc::new(FakeSurface::new(Some(7)));
        let context = OverlayContext::new(engine, target.clone(), Box::new(displays), Some(surface), 60);
        Harness {
            context,
            injector,
            clock,
            target,
        }
    }

    #[test]
    fn test_unknown_display_is_reported() {
        let h = harness(vec![(1920, 1080)]);
        assert!(matches!(h.context.start_capture(9), Err(CrtError::DisplayNotFound(9))));
        assert!(!h.context.is_running());
        assert!(h.context.last_error().unwrap().contains('9'));
    }

    #[test]
    fn test_display_queries() {
        let h = harness(vec![(1920, 1080), (2560, 1440)]);
        assert_eq!(h.context.main_display_id().unwrap(), 1);
        assert_eq!(h.context.display_size(2).unwrap(), (2560, 1440));
        assert_eq!(h.context.displays().unwrap().len(), 2);
    }

    #[test]
    fn test_uniform_before_any_shader_is_silent() {
        let h = harness(vec![(1920, 1080)]);
        h.context.set_uniform_float("maskBrightness", 0.5);
        h.context.set_uniform_int("doesNotExist", 1);
        assert!(h.context.last_error().is_none());
        assert_eq!(h.context.engine().uniforms().mask_brightness, 0.5);
    }

    #[test]
    fn test_failed_load_keeps_error_text() {
        let h = harness(vec![(1920, 1080)]);
        assert!(h.context.load_shader("fn broken(").is_err());
        assert!(h.context.last_error().unwrap().starts_with("Shader compile failed"));
        assert!(matches!(h.context.reload_shader(), Err(CrtError::NoSourceToReload)));
    }

    #[test]
    fn test_sixty_frames_on_1080p_display() {
        let h = harness(vec![(1920, 1080)]);
        h.context.load_shader(CRT_SHADER).unwrap();
        h.context.start_capture(1).unwrap();
        assert!(h.context.is_running());

        for i in 1..=60u64 {
            h.clock.advance(Duration::from_micros(14_600));
            assert_eq!(h.injector.push(OwnedFrame::blank(1920, 1080, PixelFormat::Bgra)), PushOutcome::Stored);
            assert!(wait_for(|| h.context.telemetry().presented == i));
            assert!(h.context.latency_ms() > 0.0);
        }

        let telemetry = h.context.telemetry();
        assert_eq!(telemetry.presented, 60);
        assert_eq!(telemetry.dropped, 0);
        assert!((telemetry.fps - 60.0).abs() <= 2.0, "fps {}", telemetry.fps);
        assert_eq!(h.target.presented().len(), 60);
        assert_eq!(h.context.capture_stats().unwrap().skipped, 0);
    }

    #[test]
    fn test_zero_sized_surface_drops_frames() {
        let h = harness(vec![(1920, 1080)]);
        h.context.load_shader(CRT_SHADER).unwrap();
        h.context.start_capture(1).unwrap();
        h.target.resize(0, 0);

        h.injector.push(OwnedFrame::blank(64, 64, PixelFormat::Bgra));
        assert!(wait_for(|| h.context.telemetry().dropped == 1));
        assert_eq!(h.context.telemetry().presented, 0);
    }

    #[test]
    fn test_stop_then_drop_suppresses_late_frames() {
        let h = harness(vec![(1920, 1080)]);
        h.context.load_shader(CRT_SHADER).unwrap();
        h.context.start_capture(1).unwrap();
        h.context.stop_capture();

        assert!(!h.context.is_running());
        assert_eq!(h.injector.push(OwnedFrame::blank(8, 8, PixelFormat::Bgra)), PushOutcome::Closed);
        let Harness { context, target, .. } = h;
        drop(context);
        assert!(target.presented().is_empty());
    }

    #[test]
    fn test_restart_on_other_display() {
        let h = harness(vec![(1920, 1080), (1280, 720)]);
        h.context.load_shader(CRT_SHADER).unwrap();
        h.context.start_capture(1).unwrap();
        h.context.start_capture(2).unwrap();
        assert!(h.context.is_running());

        h.injector.push(OwnedFrame::blank(1280, 720, PixelFormat::Bgra));
        assert!(wait_for(|| h.context.telemetry().presented == 1));
        assert_eq!(h.target.presented()[0].frame_size, (1280, 720));
    }

    #[test]
    fn test_device_loss_stops_running() {
        let h = harness(vec![(1920, 1080)]);
        h.context.load_shader(CRT_SHADER).unwrap();
        h.context.start_capture(1).unwrap();
        assert!(h.context.is_running());

        h.context.engine().device().lose();
        h.injector.push(OwnedFrame::blank(64, 64, PixelFormat::Bgra));
        assert!(wait_for(|| h.context.telemetry().dropped == 1));
        assert!(!h.context.is_running());
        assert!(!h.context.engine().is_ready());
    }

    #[test]
    fn test_producer_giving_up_stops_running() {
        let h = harness(vec![(1920, 1080)]);
        h.context.load_shader(CRT_SHADER).unwrap();
        h.context.start_capture(1).unwrap();

        h.injector.end_session();
        assert!(!h.context.is_running());
        h.context.start_capture(1).unwrap();
        assert!(h.context.is_running());
    }

    #[test]
    fn test_success_clears_last_error() {
        let h = harness(vec![(1920, 1080)]);
        assert!(h.context.load_shader("fn broken(").is_err());
        assert!(h.context.last_error().is_some());
        h.context.load_shader(CRT_SHADER).unwrap();
        assert!(h.context.last_error().is_none());
    }

    #[test]
    fn test_status_reads_do_not_wait_for_stop() {
        let h = harness(vec![(1920, 1080)]);
        h.context.load_shader(CRT_SHADER).unwrap();
        h.context.start_capture(1).unwrap();

        let gate = h.context.engine().device().hold_renders();
        h.injector.push(OwnedFrame::blank(64, 64, PixelFormat::Bgra));
        assert!(wait_for(|| h.context.engine().device().renders_started() == 1));

        std::thread::scope(|scope| {
            // Blocks joining the delivery thread until the render is released
            let stopping = scope.spawn(|| h.context.stop_capture());
            assert!(wait_for(|| !h.context.is_running()));
            assert!(h.context.capture_stats().is_none());
            assert!(!stopping.is_finished());
            drop(gate);
        });

        assert_eq!(h.target.presented().len(), 1);
        assert!(!h.context.is_running());
    }

    #[test]
    fn test_overlay_visibility_controls() {
        let h = harness(vec![(1920, 1080)]);
        assert!(h.context.is_overlay_visible());
        h.context.hide_overlay();
        assert!(!h.context.is_overlay_visible());
        h.context.toggle_overlay();
        assert!(h.context.is_overlay_visible());
        h.context.shutdown();
        assert!(!h.context.is_overlay_visible());
    }
}
