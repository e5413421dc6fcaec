//! Single-slot frame handoff between a producer and the delivery thread.

use crate::frame::OwnedFrame;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};

/// What happened to a pushed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The slot was empty
    Stored,
    /// An undelivered frame was replaced
    Replaced,
    /// The slot is closed; the frame was discarded
    Closed,
}

struct State {
    frame: Option<OwnedFrame>,
    closed: bool,
}

/// Holds at most one frame; a newer push replaces an undelivered one.
pub struct FrameSlot {
    state: Mutex<State>,
    ready: Condvar,
    skipped: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                frame: None,
                closed: false,
            }),
            ready: Condvar::new(),
            skipped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, frame: OwnedFrame) -> PushOutcome {
        let mut state = self.state.lock();
        if state.closed {
            return PushOutcome::Closed;
        }
        let outcome = match state.frame.replace(frame) {
            Some(_) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::Replaced
            }
            None => PushOutcome::Stored,
        };
        drop(state);
        self.ready.notify_one();
        outcome
    }

    /// Blocks until a frame is available. Returns `None` once the slot is closed.
    pub fn wait_next(&self) -> Option<OwnedFrame> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(frame) = state.frame.take() {
                return Some(frame);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Discards any queued frame and wakes the waiter. Later pushes are refused.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.frame = None;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Frames replaced before they were delivered.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_most_recent_frame_wins() {
        let slot = FrameSlot::new();
        assert_eq!(slot.push(OwnedFrame::blank(1, 1, PixelFormat::Bgra)), PushOutcome::Stored);
        assert_eq!(slot.push(OwnedFrame::blank(2, 2, PixelFormat::Bgra)), PushOutcome::Replaced);
        assert_eq!(slot.push(OwnedFrame::blank(3, 3, PixelFormat::Bgra)), PushOutcome::Replaced);

        assert_eq!(slot.wait_next().unwrap().width, 3);
        assert_eq!(slot.skipped(), 2);
    }

    #[test]
    fn test_close_discards_queued_frame() {
        let slot = FrameSlot::new();
        slot.push(OwnedFrame::blank(4, 4, PixelFormat::Bgra));
        slot.close();
        assert!(slot.wait_next().is_none());
        assert_eq!(slot.push(OwnedFrame::blank(4, 4, PixelFormat::Bgra)), PushOutcome::Closed);
    }

    #[test]
    fn test_close_wakes_blocked_waiter() {
        let slot = Arc::new(FrameSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait_next().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        slot.close();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_waiter_receives_pushed_frame() {
        let slot = Arc::new(FrameSlot::new());
        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait_next().map(|f| f.width))
        };
        thread::sleep(Duration::from_millis(20));
        slot.push(OwnedFrame::blank(9, 9, PixelFormat::Rgba));
        assert_eq!(waiter.join().unwrap(), Some(9));
    }
}
