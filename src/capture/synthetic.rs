//! Capture sources that need no screen access: a generated test card and manual injection.

use super::{CaptureConfig, DisplayInfo, DisplayProvider, FrameProducer, FrameSlot, PushOutcome};
use crate::error::{CrtError, Result};
use crate::frame::{ContentRect, OwnedFrame, PixelFormat};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Extra columns and rows around the test card, like the padding real
/// capture backends add to their buffers.
const PADDING: u32 = 16;

const BARS_BGRA: [[u8; 4]; 8] = [
    [255, 255, 255, 255],
    [0, 255, 255, 255],
    [255, 255, 0, 255],
    [0, 255, 0, 255],
    [255, 0, 255, 255],
    [0, 0, 255, 255],
    [255, 0, 0, 255],
    [0, 0, 0, 255],
];

/// Magenta, so a misread content rectangle is obvious on screen.
const PAD_BGRA: [u8; 4] = [255, 0, 255, 255];

/// Builds one test-card frame: colour bars with a sweeping white line.
///
/// The buffer is over-allocated by [`PADDING`] pixels in each direction and the
/// content rectangle covers only the card.
pub fn test_card(width: u32, height: u32, scale_factor: f32, index: u64) -> OwnedFrame {
    let buffer_width = width + PADDING;
    let buffer_height = height + PADDING;
    let stride = buffer_width * 4;
    let mut data = vec![0u8; (stride * buffer_height) as usize];
    let sweep = if height > 0 { (index * 4 % height as u64) as u32 } else { 0 };

    for (y, row) in data.chunks_exact_mut(stride as usize).enumerate() {
        let y = y as u32;
        for (x, px) in row.chunks_exact_mut(4).enumerate() {
            let x = x as u32;
            let color = if x >= width || y >= height {
                PAD_BGRA
            } else if y == sweep {
                [255, 255, 255, 255]
            } else {
                BARS_BGRA[(x * 8 / width.max(1)) as usize % 8]
            };
            px.copy_from_slice(&color);
        }
    }

    OwnedFrame {
        data,
        width: buffer_width,
        height: buffer_height,
        stride,
        format: PixelFormat::Bgra,
        content_rect: ContentRect::new(0.0, 0.0, width as f32 / scale_factor, height as f32 / scale_factor),
        scale_factor,
        captured_at: Instant::now(),
    }
}

/// Generates test-card frames at the configured rate.
pub struct SyntheticProducer {
    width: u32,
    height: u32,
    scale_factor: f32,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticProducer {
    pub fn new(width: u32, height: u32, scale_factor: f32) -> Self {
        Self {
            width,
            height,
            scale_factor,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl FrameProducer for SyntheticProducer {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn start(&mut self, slot: Arc<FrameSlot>, config: &CaptureConfig) -> Result<()> {
        self.stop();
        self.running.store(true, Ordering::Release);

        let interval = Duration::from_secs_f64(1.0 / config.fps.max(1) as f64);
        let (width, height, scale) = (self.width, self.height, self.scale_factor);
        let running = Arc::clone(&self.running);
        let thread = thread::Builder::new()
            .name("synthetic-capture".into())
            .spawn(move || {
                let mut index = 0u64;
                while running.load(Ordering::Acquire) {
                    if slot.push(test_card(width, height, scale, index)) == PushOutcome::Closed {
                        break;
                    }
                    index += 1;
                    thread::sleep(interval);
                }
                debug!("Synthetic capture produced {} frames", index);
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
}

impl Drop for SyntheticProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

type SharedSlot = Arc<Mutex<Option<Arc<FrameSlot>>>>;

/// Hands frames to a running [`InjectedProducer`].
#[derive(Clone, Default)]
pub struct FrameInjector {
    slot: SharedSlot,
}

impl FrameInjector {
    /// Pushes a frame into the running session, or reports `Closed` if none is running.
    pub fn push(&self, frame: OwnedFrame) -> PushOutcome {
        match self.slot.lock().as_ref() {
            Some(slot) => slot.push(frame),
            None => PushOutcome::Closed,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Closes the running session from the producer side, as a backend does when it gives up.
    pub fn end_session(&self) {
        if let Some(slot) = self.slot.lock().as_ref() {
            slot.close();
        }
    }
}

/// A producer whose frames come from the host through a [`FrameInjector`].
pub struct InjectedProducer {
    slot: SharedSlot,
}

impl InjectedProducer {
    pub fn new() -> (Self, FrameInjector) {
        let injector = FrameInjector::default();
        (Self::attached_to(&injector), injector)
    }

    /// A producer fed by an existing injector.
    pub fn attached_to(injector: &FrameInjector) -> Self {
        Self {
            slot: Arc::clone(&injector.slot),
        }
    }
}

impl FrameProducer for InjectedProducer {
    fn name(&self) -> &str {
        "injected"
    }

    fn start(&mut self, slot: Arc<FrameSlot>, _config: &CaptureConfig) -> Result<()> {
        *self.slot.lock() = Some(slot);
        Ok(())
    }

    fn stop(&mut self) {
        self.slot.lock().take();
    }
}

/// Fixed set of fake displays.
///
/// Producers are test cards, or injected producers sharing one injector when
/// built with [`SyntheticDisplays::with_injector`].
pub struct SyntheticDisplays {
    displays: Vec<DisplayInfo>,
    injector: Option<FrameInjector>,
}

impl SyntheticDisplays {
    /// One display per size, numbered from 1.
    pub fn new(sizes: Vec<(u32, u32)>) -> Self {
        let displays = sizes
            .into_iter()
            .enumerate()
            .map(|(i, (width, height))| DisplayInfo {
                id: i as u32 + 1,
                name: format!("Synthetic {}", i + 1),
                x: 0,
                y: 0,
                width,
                height,
                scale_factor: 1.0,
                is_primary: false,
            })
            .collect();
        Self {
            displays,
            injector: None,
        }
    }

    pub fn with_primary(mut self, id: u32) -> Self {
        for display in &mut self.displays {
            display.is_primary = display.id == id;
        }
        self
    }

    /// Switches every display's producer to manual injection.
    pub fn with_injector(mut self) -> (Self, FrameInjector) {
        let injector = FrameInjector::default();
        self.injector = Some(injector.clone());
        (self, injector)
    }
}

impl DisplayProvider for SyntheticDisplays {
    fn displays(&self) -> Result<Vec<DisplayInfo>> {
        Ok(self.displays.clone())
    }

    fn producer(&self, id: u32) -> Result<Box<dyn FrameProducer>> {
        let display = self.display(id)?;
        Ok(match &self.injector {
            Some(injector) => Box::new(InjectedProducer::attached_to(injector)),
            None => Box::new(SyntheticProducer::new(display.width, display.height, display.scale_factor)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_content_excludes_padding() {
        let frame = test_card(64, 32, 2.0, 0);
        let view = frame.view();
        assert!(view.is_well_formed());
        assert_eq!(view.width, 64 + PADDING);

        let content = view.content_pixels();
        assert_eq!((content.x, content.y, content.width, content.height), (0, 0, 64, 32));
        let last_px = (frame.stride * (frame.height - 1) + (frame.width - 1) * 4) as usize;
        assert_eq!(&frame.data[last_px..last_px + 4], &PAD_BGRA);
    }

    #[test]
    fn test_card_sweep_moves() {
        let a = test_card(16, 16, 1.0, 0);
        let b = test_card(16, 16, 1.0, 1);
        assert_ne!(a.data, b.data);
    }

    #[test]
    fn test_synthetic_producer_fills_slot() {
        let mut producer = SyntheticProducer::new(32, 16, 1.0);
        let slot = Arc::new(FrameSlot::new());
        producer.start(Arc::clone(&slot), &CaptureConfig::default()).unwrap();
        let frame = slot.wait_next().unwrap();
        producer.stop();
        assert_eq!(frame.content_rect.width, 32.0);
        assert_eq!(frame.format, PixelFormat::Bgra);
    }

    #[test]
    fn test_injector_detaches_on_stop() {
        let (mut producer, injector) = InjectedProducer::new();
        assert_eq!(injector.push(OwnedFrame::blank(1, 1, PixelFormat::Bgra)), PushOutcome::Closed);

        let slot = Arc::new(FrameSlot::new());
        producer.start(Arc::clone(&slot), &CaptureConfig::default()).unwrap();
        assert_eq!(injector.push(OwnedFrame::blank(1, 1, PixelFormat::Bgra)), PushOutcome::Stored);
        producer.stop();
        assert!(!injector.is_attached());
    }

    #[test]
    fn test_unknown_display_has_no_producer() {
        let displays = SyntheticDisplays::new(vec![(640, 480)]);
        assert!(matches!(displays.producer(2), Err(CrtError::DisplayNotFound(2))));
        assert!(displays.producer(1).is_ok());
    }
}
