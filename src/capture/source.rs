//! Frame delivery: runs one handler on a dedicated thread for every captured frame.

use super::{CaptureConfig, FrameProducer, FrameSlot, WindowHandle};
use crate::error::{CrtError, Result};
use crate::frame::CapturedFrame;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

type FrameHandler = Box<dyn FnMut(&CapturedFrame<'_>) + Send>;

/// Delivery counters for the lifetime of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureStats {
    /// Frames handed to the handler
    pub delivered: u64,
    /// Frames replaced in the slot before delivery
    pub skipped: u64,
}

struct Session {
    slot: Arc<FrameSlot>,
    stopping: Arc<AtomicBool>,
    thread: JoinHandle<FrameHandler>,
}

/// A capture session plus the thread that delivers its frames.
///
/// The handler runs strictly sequentially on the delivery thread. After
/// [`FrameSource::stop`] returns it is never called again.
pub struct FrameSource {
    producer: Box<dyn FrameProducer>,
    config: CaptureConfig,
    handler: Option<FrameHandler>,
    excluded: Option<WindowHandle>,
    session: Option<Session>,
    delivered: Arc<AtomicU64>,
    skipped_before: u64,
}

impl FrameSource {
    pub fn new(producer: Box<dyn FrameProducer>, config: CaptureConfig) -> Self {
        Self {
            producer,
            config,
            handler: None,
            excluded: None,
            session: None,
            delivered: Arc::new(AtomicU64::new(0)),
            skipped_before: 0,
        }
    }

    /// Registers the frame handler, replacing any previous one.
    ///
    /// Fails while a session is running.
    pub fn set_frame_handler(&mut self, handler: impl FnMut(&CapturedFrame<'_>) + Send + 'static) -> Result<()> {
        if self.session.is_some() {
            return Err(CrtError::Unready("stop capture before replacing the frame handler".into()));
        }
        self.handler = Some(Box::new(handler));
        Ok(())
    }

    /// Window to keep out of the capture; applied on the next start.
    pub fn set_excluded_window(&mut self, window: Option<WindowHandle>) {
        self.excluded = window;
    }

    pub fn display_id(&self) -> u32 {
        self.config.display_id
    }

    /// False once stop was requested or the producer ended the session.
    pub fn is_capturing(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| !s.stopping.load(Ordering::Acquire) && !s.slot.is_closed())
    }

    pub fn stats(&self) -> CaptureStats {
        let current = self.session.as_ref().map_or(0, |s| s.slot.skipped());
        CaptureStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            skipped: self.skipped_before + current,
        }
    }

    /// Starts the producer and the delivery thread. A no-op if already running.
    pub fn start(&mut self) -> Result<()> {
        if self.session.as_ref().is_some_and(|s| s.slot.is_closed()) {
            // The producer gave up; reap the old session before starting over
            self.stop();
        }
        if self.session.is_some() {
            return Ok(());
        }
        if self.handler.is_none() {
            return Err(CrtError::Unready("no frame handler registered".into()));
        }

        if let Some(window) = self.excluded {
            match self.producer.exclude_window(window) {
                Ok(true) => info!("Excluded overlay window from capture"),
                Ok(false) => warn!("{} cannot exclude windows; the overlay may capture itself", self.producer.name()),
                Err(e) => warn!("Failed to exclude overlay window from capture: {}", e),
            }
        }

        let slot = Arc::new(FrameSlot::new());
        self.producer.start(Arc::clone(&slot), &self.config)?;

        let Some(mut handler) = self.handler.take() else {
            return Err(CrtError::Unready("no frame handler registered".into()));
        };
        let stopping = Arc::new(AtomicBool::new(false));
        let thread = {
            let slot = Arc::clone(&slot);
            let stopping = Arc::clone(&stopping);
            let delivered = Arc::clone(&self.delivered);
            thread::Builder::new()
                .name("frame-delivery".into())
                .spawn(move || {
                    while let Some(frame) = slot.wait_next() {
                        if stopping.load(Ordering::Acquire) {
                            break;
                        }
                        handler(&frame.view());
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    handler
                })
        };

        match thread {
            Ok(thread) => {
                info!(
                    "Capture started on display {} via {} at {} fps",
                    self.config.display_id,
                    self.producer.name(),
                    self.config.fps
                );
                self.session = Some(Session { slot, stopping, thread });
                Ok(())
            }
            Err(e) => {
                // The closure owning the handler was dropped with the failed spawn.
                self.producer.stop();
                slot.close();
                Err(CrtError::Capture(format!("failed to spawn delivery thread: {e}")))
            }
        }
    }

    /// Begins shutdown without waiting: stops the producer, closes the slot and
    /// tells the delivery thread to skip anything still in flight.
    pub fn request_stop(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        session.stopping.store(true, Ordering::Release);
        self.producer.stop();
        session.slot.close();
    }

    /// Joins the delivery thread. Once this returns the handler is idle and
    /// available for the next start.
    pub fn wait_stopped(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if !session.stopping.load(Ordering::Acquire) {
            session.stopping.store(true, Ordering::Release);
            self.producer.stop();
            session.slot.close();
        }

        self.skipped_before += session.slot.skipped();
        match session.thread.join() {
            Ok(handler) => self.handler = Some(handler),
            Err(_) => error!("Frame delivery thread panicked; the frame handler was lost"),
        }
        info!("Capture stopped on display {}", self.config.display_id);
    }

    pub fn stop(&mut self) {
        self.request_stop();
        self.wait_stopped();
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameInjector, InjectedProducer, PushOutcome};
    use crate::frame::{OwnedFrame, PixelFormat};
    use crate::testing::wait_for;
    use std::sync::mpsc;
    use std::time::Duration;

    fn injected() -> (FrameSource, FrameInjector) {
        let (producer, injector) = InjectedProducer::new();
        (FrameSource::new(Box::new(producer), CaptureConfig::default()), injector)
    }

    #[test]
    fn test_start_requires_handler() {
        let (mut source, _) = injected();
        assert!(matches!(source.start(), Err(CrtError::Unready(_))));
        assert!(!source.is_capturing());
    }

    #[test]
    fn test_frames_delivered_in_order() {
        let (mut source, injector) = injected();
        let (tx, rx) = mpsc::channel();
        source
            .set_frame_handler(move |frame| {
                let _ = tx.send(frame.width);
            })
            .unwrap();
        source.start().unwrap();
        assert!(source.is_capturing());

        for width in 1..=5 {
            injector.push(OwnedFrame::blank(width, 1, PixelFormat::Bgra));
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), width);
        }
        source.stop();
        assert_eq!(source.stats().delivered, 5);
    }

    #[test]
    fn test_no_delivery_after_stop() {
        let (mut source, injector) = injected();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (seen_tx, seen_rx) = mpsc::channel();
        source
            .set_frame_handler(move |frame| {
                let _ = seen_tx.send(frame.width);
                if frame.width == 1 {
                    let _ = entered_tx.send(());
                    let _ = release_rx.recv();
                }
            })
            .unwrap();
        source.start().unwrap();

        // Frame 1 blocks inside the handler while frame 2 waits in the slot.
        injector.push(OwnedFrame::blank(1, 1, PixelFormat::Bgra));
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(injector.push(OwnedFrame::blank(2, 1, PixelFormat::Bgra)), PushOutcome::Stored);

        source.request_stop();
        assert_eq!(injector.push(OwnedFrame::blank(3, 1, PixelFormat::Bgra)), PushOutcome::Closed);
        release_tx.send(()).unwrap();
        source.wait_stopped();

        let seen: Vec<u32> = seen_rx.try_iter().collect();
        assert_eq!(seen, vec![1]);
        assert_eq!(source.stats().delivered, 1);
    }

    #[test]
    fn test_restart_reuses_handler() {
        let (mut source, injector) = injected();
        let (tx, rx) = mpsc::channel();
        source
            .set_frame_handler(move |frame| {
                let _ = tx.send(frame.height);
            })
            .unwrap();

        for round in 1..=2 {
            source.start().unwrap();
            assert!(wait_for(|| injector.is_attached()));
            injector.push(OwnedFrame::blank(1, round, PixelFormat::Bgra));
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), round);
            source.stop();
            assert!(!source.is_capturing());
        }
    }

    #[test]
    fn test_producer_ending_session_stops_capturing() {
        let (mut source, injector) = injected();
        source.set_frame_handler(|_| {}).unwrap();
        source.start().unwrap();
        assert!(source.is_capturing());

        injector.end_session();
        assert!(!source.is_capturing());

        // A dead session does not block the next start
        source.start().unwrap();
        assert!(source.is_capturing());
        assert_eq!(injector.push(OwnedFrame::blank(4, 4, PixelFormat::Bgra)), PushOutcome::Stored);
        source.stop();
    }

    #[test]
    fn test_handler_cannot_change_while_running() {
        let (mut source, _injector) = injected();
        source.set_frame_handler(|_| {}).unwrap();
        source.start().unwrap();
        assert!(source.set_frame_handler(|_| {}).is_err());
        source.stop();
        assert!(source.set_frame_handler(|_| {}).is_ok());
    }

    #[test]
    fn test_skipped_frames_are_counted() {
        let (mut source, injector) = injected();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        source
            .set_frame_handler(move |frame| {
                if frame.width == 1 {
                    let _ = entered_tx.send(());
                    let _ = release_rx.recv();
                }
            })
            .unwrap();
        source.start().unwrap();

        injector.push(OwnedFrame::blank(1, 1, PixelFormat::Bgra));
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        injector.push(OwnedFrame::blank(2, 1, PixelFormat::Bgra));
        injector.push(OwnedFrame::blank(3, 1, PixelFormat::Bgra));
        release_tx.send(()).unwrap();

        assert!(wait_for(|| source.stats().delivered == 2));
        source.stop();
        assert_eq!(source.stats().skipped, 1);
    }
}
