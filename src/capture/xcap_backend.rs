//! Screen capture through xcap.

use super::exclusion::exclude_from_capture;
use super::{CaptureConfig, DisplayInfo, DisplayProvider, FrameProducer, FrameSlot, PushOutcome, WindowHandle};
use crate::error::{CrtError, Result};
use crate::frame::{OwnedFrame, PixelFormat};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use xcap::Monitor;

/// Consecutive failed grabs after which the capture thread gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 30;

fn find_monitor(id: u32) -> Result<Monitor> {
    let monitors = Monitor::all().map_err(|e| CrtError::Capture(format!("Failed to list monitors: {e}")))?;
    monitors
        .into_iter()
        .find(|m| m.id().ok() == Some(id))
        .ok_or(CrtError::DisplayNotFound(id))
}

fn grab(monitor: &Monitor, scale_factor: f32) -> Result<OwnedFrame> {
    let image = monitor
        .capture_image()
        .map_err(|e| CrtError::Capture(format!("Failed to capture monitor: {e}")))?;
    let (width, height) = (image.width(), image.height());
    Ok(OwnedFrame::packed(width, height, PixelFormat::Rgba, scale_factor, image.into_raw()))
}

/// Polls one monitor at the configured rate.
pub struct XcapProducer {
    display_id: u32,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl XcapProducer {
    pub fn new(display_id: u32) -> Self {
        Self {
            display_id,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl FrameProducer for XcapProducer {
    fn name(&self) -> &str {
        "xcap"
    }

    fn start(&mut self, slot: Arc<FrameSlot>, config: &CaptureConfig) -> Result<()> {
        self.stop();

        // Surface permission and lookup problems here rather than on the capture thread
        let monitor = find_monitor(self.display_id)?;
        let probe = grab(&monitor, monitor.scale_factor().unwrap_or(1.0))?;
        info!("Capturing display {} at {}x{}", self.display_id, probe.width, probe.height);
        drop(monitor);

        let display_id = self.display_id;
        let interval = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);
        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);

        let thread = thread::Builder::new()
            .name("xcap-capture".into())
            .spawn(move || {
                let monitor = match find_monitor(display_id) {
                    Ok(monitor) => monitor,
                    Err(e) => {
                        error!("Capture thread could not open display {}: {}", display_id, e);
                        slot.close();
                        return;
                    }
                };
                let scale_factor = monitor.scale_factor().unwrap_or(1.0);
                let mut failures = 0;

                while running.load(Ordering::Acquire) {
                    let started = Instant::now();
                    match grab(&monitor, scale_factor) {
                        Ok(frame) => {
                            failures = 0;
                            if slot.push(frame) == PushOutcome::Closed {
                                break;
                            }
                        }
                        Err(e) => {
                            failures += 1;
                            warn!("Screen grab failed ({}/{}): {}", failures, MAX_CONSECUTIVE_FAILURES, e);
                            if failures >= MAX_CONSECUTIVE_FAILURES {
                                error!("Giving up on display {} after {} failed grabs", display_id, failures);
                                slot.close();
                                break;
                            }
                        }
                    }
                    if let Some(rest) = interval.checked_sub(started.elapsed()) {
                        thread::sleep(rest);
                    }
                }
                debug!("xcap capture thread for display {} exiting", display_id);
            })
            .map_err(|e| CrtError::Capture(format!("failed to spawn capture thread: {e}")))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn exclude_window(&mut self, window: WindowHandle) -> Result<bool> {
        exclude_from_capture(window)
    }
}

impl Drop for XcapProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Attached monitors as reported by xcap.
#[derive(Debug, Default, Clone, Copy)]
pub struct XcapDisplays;

impl DisplayProvider for XcapDisplays {
    fn displays(&self) -> Result<Vec<DisplayInfo>> {
        let monitors = Monitor::all().map_err(|e| CrtError::Capture(format!("Failed to list monitors: {e}")))?;
        let displays = monitors
            .iter()
            .filter_map(|monitor| {
                let id = monitor.id().ok()?;
                Some(DisplayInfo {
                    id,
                    name: monitor.name().unwrap_or_else(|_| format!("Display {id}")),
                    x: monitor.x().unwrap_or(0),
                    y: monitor.y().unwrap_or(0),
                    width: monitor.width().unwrap_or(0),
                    height: monitor.height().unwrap_or(0),
                    scale_factor: monitor.scale_factor().unwrap_or(1.0),
                    is_primary: monitor.is_primary().unwrap_or(false),
                })
            })
            .collect();
        Ok(displays)
    }

    fn producer(&self, id: u32) -> Result<Box<dyn FrameProducer>> {
        self.display(id)?;
        Ok(Box::new(XcapProducer::new(id)))
    }
}
