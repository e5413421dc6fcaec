//! Rolling frame-rate and latency estimates.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Span of presented frames the FPS estimate looks at.
const FPS_WINDOW: Duration = Duration::from_secs(1);
/// Weight of the newest latency sample in the moving average.
const LATENCY_SMOOTHING: f32 = 0.1;

/// Time source for telemetry timestamps.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The monotonic system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetrySnapshot {
    pub presented: u64,
    pub dropped: u64,
    pub fps: f32,
    pub latency_ms: f32,
}

struct Window {
    presented_at: VecDeque<Instant>,
    latency_ms: Option<f32>,
}

/// Frame counters plus FPS and latency estimators.
///
/// Only the delivery thread records; readers see the last published values
/// through atomics and never block it.
pub struct Telemetry {
    window: Mutex<Window>,
    fps_bits: AtomicU32,
    latency_bits: AtomicU32,
    presented: AtomicU64,
    dropped: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window {
                presented_at: VecDeque::new(),
                latency_ms: None,
            }),
            fps_bits: AtomicU32::new(0f32.to_bits()),
            latency_bits: AtomicU32::new(0f32.to_bits()),
            presented: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Folds in one presented frame received at `received` and shown at `presented`.
    pub fn record_presented(&self, received: Instant, presented: Instant) {
        let mut window = self.window.lock();

        window.presented_at.push_back(presented);
        if let Some(cutoff) = presented.checked_sub(FPS_WINDOW) {
            while window.presented_at.front().is_some_and(|t| *t < cutoff) {
                window.presented_at.pop_front();
            }
        }
        let fps = match (window.presented_at.front(), window.presented_at.len()) {
            (Some(first), n) if n >= 2 => {
                let span = presented.saturating_duration_since(*first).as_secs_f32();
                if span > 0.0 {
                    (n - 1) as f32 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let sample = presented.saturating_duration_since(received).as_secs_f32() * 1000.0;
        let latency = match window.latency_ms {
            Some(avg) => avg + LATENCY_SMOOTHING * (sample - avg),
            None => sample,
        };
        window.latency_ms = Some(latency);

        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
        self.latency_bits.store(latency.to_bits(), Ordering::Relaxed);
        self.presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames per second over the last second of presented frames; 0 before two frames.
    pub fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    /// Smoothed receive-to-present latency in milliseconds; 0 before the first frame.
    pub fn latency_ms(&self) -> f32 {
        f32::from_bits(self.latency_bits.load(Ordering::Relaxed))
    }

    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            presented: self.presented(),
            dropped: self.dropped(),
            fps: self.fps(),
            latency_ms: self.latency_ms(),
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(telemetry: &Telemetry, start: Instant, frames: u32, spacing: Duration, cost: Duration) {
        for i in 0..frames {
            let received = start + spacing * i;
            telemetry.record_presented(received, received + cost);
        }
    }

    #[test]
    fn test_zero_before_first_frame() {
        let telemetry = Telemetry::new();
        assert_eq!(telemetry.snapshot(), TelemetrySnapshot::default());
    }

    #[test]
    fn test_single_frame_sets_latency_but_not_fps() {
        let telemetry = Telemetry::new();
        let t0 = Instant::now();
        telemetry.record_presented(t0, t0 + Duration::from_millis(4));
        assert_eq!(telemetry.fps(), 0.0);
        assert!((telemetry.latency_ms() - 4.0).abs() < 0.01);
    }

    #[test]
    fn test_fps_converges_to_fixed_interval() {
        let telemetry = Telemetry::new();
        let spacing = Duration::from_micros(16_600);
        feed(&telemetry, Instant::now(), 60, spacing, Duration::from_millis(2));

        let expected = 59.0 / (spacing * 59).as_secs_f32();
        assert!((telemetry.fps() - expected).abs() < 0.5, "fps {}", telemetry.fps());
        assert_eq!(telemetry.presented(), 60);
    }

    #[test]
    fn test_window_only_covers_last_second() {
        let telemetry = Telemetry::new();
        let t0 = Instant::now();
        feed(&telemetry, t0, 30, Duration::from_millis(100), Duration::ZERO);
        feed(&telemetry, t0 + Duration::from_secs(5), 31, Duration::from_millis(20), Duration::ZERO);
        assert!((telemetry.fps() - 50.0).abs() < 1.0, "fps {}", telemetry.fps());
    }

    #[test]
    fn test_latency_is_smoothed() {
        let telemetry = Telemetry::new();
        let t0 = Instant::now();
        telemetry.record_presented(t0, t0 + Duration::from_millis(10));
        telemetry.record_presented(t0, t0 + Duration::from_millis(20));
        assert!((telemetry.latency_ms() - 11.0).abs() < 0.01);
    }

    #[test]
    fn test_dropped_frames_do_not_touch_fps() {
        let telemetry = Telemetry::new();
        telemetry.record_dropped();
        telemetry.record_dropped();
        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.dropped, 2);
        assert_eq!(snapshot.presented, 0);
        assert_eq!(snapshot.fps, 0.0);
    }
}
