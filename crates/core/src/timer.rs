//! Frame timing.

use std::time::{Duration, Instant};

/// Tracks per-frame delta time and a windowed average frame rate.
///
/// The renderer ticks it once per presented frame and logs the average
/// whenever a report window closes.
#[derive(Debug)]
pub struct FrameTimer {
    start: Instant,
    last_tick: Instant,
    frames: u64,
    window_start: Instant,
    window_frames: u32,
    report_interval: Duration,
}

/// Average frame statistics for one closed report window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameStats {
    pub frames: u32,
    pub fps: f64,
    pub avg_frame_ms: f64,
}

impl FrameTimer {
    /// Create a timer whose report window is `report_interval` long.
    pub fn new(report_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            frames: 0,
            window_start: now,
            window_frames: 0,
            report_interval,
        }
    }

    /// Total time since the timer was created or last reset.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Number of frames ticked so far.
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    /// Record a frame. Returns the delta since the previous tick.
    pub fn tick(&mut self) -> Duration {
        self.tick_at(Instant::now())
    }

    /// Returns statistics once the current report window has elapsed,
    /// and starts a new window.
    pub fn take_report(&mut self) -> Option<FrameStats> {
        self.take_report_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> Duration {
        let delta = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        self.frames += 1;
        self.window_frames += 1;
        delta
    }

    fn take_report_at(&mut self, now: Instant) -> Option<FrameStats> {
        let window = now.saturating_duration_since(self.window_start);
        if window < self.report_interval || self.window_frames == 0 {
            return None;
        }

        let secs = window.as_secs_f64();
        let stats = FrameStats {
            frames: self.window_frames,
            fps: f64::from(self.window_frames) / secs,
            avg_frame_ms: secs * 1000.0 / f64::from(self.window_frames),
        };
        self.window_start = now;
        self.window_frames = 0;
        Some(stats)
    }

    /// Reset all counters to the current time.
    pub fn reset(&mut self) {
        *self = Self::new(self.report_interval);
    }
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counts_frames() {
        let mut timer = FrameTimer::default();
        let base = timer.last_tick;
        let delta = timer.tick_at(base + Duration::from_millis(16));
        assert_eq!(delta, Duration::from_millis(16));
        timer.tick_at(base + Duration::from_millis(32));
        assert_eq!(timer.frame_count(), 2);
    }

    #[test]
    fn test_report_only_after_interval() {
        let mut timer = FrameTimer::new(Duration::from_secs(1));
        let base = timer.window_start;
        for i in 1..=10 {
            timer.tick_at(base + Duration::from_millis(50 * i));
        }
        assert!(timer.take_report_at(base + Duration::from_millis(500)).is_none());

        let stats = timer
            .take_report_at(base + Duration::from_secs(2))
            .expect("window elapsed");
        assert_eq!(stats.frames, 10);
        assert!((stats.fps - 5.0).abs() < 1e-9);
        assert!((stats.avg_frame_ms - 200.0).abs() < 1e-9);

        // New window starts empty.
        assert!(timer.take_report_at(base + Duration::from_secs(4)).is_none());
    }
}
