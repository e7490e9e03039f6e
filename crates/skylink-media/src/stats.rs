//! Stream counters, rate derivation, and the health classifier.
//!
//! Counters are plain atomics so the GStreamer streaming threads can bump
//! them from pad probes without taking a lock; the rate tracker converts
//! the cumulative values into instantaneous fps/kbps on a ≥1 Hz tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

use skylink_common::models::StreamHealth;

/// Cumulative counters updated from pad probes.
#[derive(Debug, Default)]
pub struct StreamCounters {
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    pub errors: AtomicU64,
}

impl StreamCounters {
    pub fn add_frames(&self, n: u64) {
        self.frames.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.frames.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.frames.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
            self.errors.load(Ordering::Relaxed),
        )
    }
}

/// Converts cumulative counters into instantaneous rates by differencing
/// against the previous sample window. Windows shorter than half a second
/// are ignored to keep the rates stable.
#[derive(Debug, Default)]
pub struct RateTracker {
    last_time: Option<Instant>,
    last_frames: u64,
    last_bytes: u64,
    pub fps: f64,
    pub kbps: f64,
}

impl RateTracker {
    pub fn sample(&mut self, now: Instant, frames: u64, bytes: u64) {
        let Some(last) = self.last_time else {
            self.last_time = Some(now);
            self.last_frames = frames;
            self.last_bytes = bytes;
            return;
        };

        let elapsed = now.duration_since(last).as_secs_f64();
        if elapsed < 0.5 {
            return;
        }

        let frames_delta = frames.saturating_sub(self.last_frames);
        let bytes_delta = bytes.saturating_sub(self.last_bytes);

        self.fps = frames_delta as f64 / elapsed;
        self.kbps = (bytes_delta as f64 * 8.0) / (elapsed * 1000.0);

        self.last_time = Some(now);
        self.last_frames = frames;
        self.last_bytes = bytes;
    }

    pub fn reset(&mut self) {
        *self = RateTracker::default();
    }
}

/// Formatted stats block embedded in the stream status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub current_fps: f64,
    pub current_kbps: f64,
    pub uptime_s: Option<u64>,
    pub health: StreamHealth,
}

/// Discrete health classifier from fps attainment and error count.
pub fn classify_health(errors: u64, current_fps: f64, target_fps: u32) -> StreamHealth {
    if errors > 10 {
        return StreamHealth::Poor;
    }
    let fps_rate = if target_fps > 0 {
        current_fps / target_fps as f64 * 100.0
    } else {
        100.0
    };
    if fps_rate >= 95.0 && errors <= 2 {
        StreamHealth::Good
    } else if fps_rate >= 80.0 || errors <= 5 {
        StreamHealth::Fair
    } else {
        StreamHealth::Poor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // ─── Rates ──────────────────────────────────────────────────────────

    #[test]
    fn rates_from_counter_deltas() {
        let mut tracker = RateTracker::default();
        let t0 = Instant::now();
        tracker.sample(t0, 0, 0);
        tracker.sample(t0 + Duration::from_secs(1), 30, 125_000);

        assert!((tracker.fps - 30.0).abs() < 1e-9);
        assert!((tracker.kbps - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn short_window_is_ignored() {
        let mut tracker = RateTracker::default();
        let t0 = Instant::now();
        tracker.sample(t0, 0, 0);
        tracker.sample(t0 + Duration::from_millis(100), 100, 100_000);
        assert_eq!(tracker.fps, 0.0);
    }

    #[test]
    fn counter_reset_does_not_go_negative() {
        let mut tracker = RateTracker::default();
        let t0 = Instant::now();
        tracker.sample(t0, 1000, 1_000_000);
        tracker.sample(t0 + Duration::from_secs(1), 10, 10_000);
        assert_eq!(tracker.fps, 0.0);
        assert_eq!(tracker.kbps, 0.0);
    }

    // ─── Health ─────────────────────────────────────────────────────────

    #[test]
    fn healthy_stream_is_good() {
        assert_eq!(classify_health(0, 29.5, 30), StreamHealth::Good);
        assert_eq!(classify_health(2, 30.0, 30), StreamHealth::Good);
    }

    #[test]
    fn degraded_fps_is_fair() {
        assert_eq!(classify_health(0, 25.0, 30), StreamHealth::Fair);
        assert_eq!(classify_health(4, 28.0, 30), StreamHealth::Fair);
    }

    #[test]
    fn error_burst_is_poor() {
        assert_eq!(classify_health(11, 30.0, 30), StreamHealth::Poor);
    }

    #[test]
    fn slow_and_erroring_is_poor() {
        assert_eq!(classify_health(6, 10.0, 30), StreamHealth::Poor);
    }

    #[test]
    fn counters_snapshot_and_reset() {
        let counters = StreamCounters::default();
        counters.add_frames(10);
        counters.add_bytes(5000);
        counters.add_error();
        assert_eq!(counters.snapshot(), (10, 5000, 1));
        counters.reset();
        assert_eq!(counters.snapshot(), (0, 0, 0));
    }
}
