use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

/// A half-open reader window `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub start: i64,
    pub end: i64,
}

impl Window {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Window length in milliseconds.
    pub fn len_ms(&self) -> i64 {
        self.end - self.start
    }

    /// Milliseconds of `[from, to)` that fall inside this window.
    pub fn overlap(&self, from: i64, to: i64) -> i64 {
        let lo = from.max(self.start);
        let hi = to.min(self.end);
        (hi - lo).max(0)
    }
}

/// Reader clock: maps wall time onto the fixed cadence grid and the
/// writer's rotation buckets.
#[derive(Debug, Clone, Copy)]
pub struct WindowClock {
    cadence_ms: i64,
    rotation_ms: i64,
}

impl WindowClock {
    /// Create a clock from the reader cadence and writer rotation interval.
    pub fn new(cadence: Duration, rotation_interval: Duration) -> Result<Self> {
        let cadence_ms = duration_millis(cadence);
        let rotation_ms = duration_millis(rotation_interval);

        if cadence_ms <= 0 {
            bail!("cadence must be at least 1ms");
        }

        if rotation_ms <= 0 {
            bail!("rotation_interval must be at least 1ms");
        }

        Ok(Self {
            cadence_ms,
            rotation_ms,
        })
    }

    pub fn cadence_ms(&self) -> i64 {
        self.cadence_ms
    }

    pub fn rotation_ms(&self) -> i64 {
        self.rotation_ms
    }

    /// Start of the cadence slot containing `ts`.
    pub fn floor(&self, ts: i64) -> i64 {
        floor_to(ts, self.cadence_ms)
    }

    /// Writer bucket directory key for `ts`.
    pub fn bucket_of(&self, ts: i64) -> i64 {
        floor_to(ts, self.rotation_ms)
    }

    /// Writer buckets to scan for a cycle ending at `curr`: the current one
    /// and the one before it, oldest first.
    pub fn scan_buckets(&self, curr: i64) -> [i64; 2] {
        let current = self.bucket_of(curr);
        [current - self.rotation_ms, current]
    }

    /// The reader window that starts at `start`.
    pub fn window_at(&self, start: i64) -> Window {
        Window::new(start, start + self.cadence_ms)
    }

    /// The window emitted by a cycle whose cadence slot starts at `curr`.
    ///
    /// Emission trails parsing by one window: aligning `[a, b)` needs a
    /// writer snapshot ending after `b`, which only the latest parse can supply.
    pub fn emission_window(&self, curr: i64) -> Window {
        self.window_at(curr - 2 * self.cadence_ms)
    }
}

/// Floor `ts` to a multiple of `interval` (euclidean, so negatives round down).
pub fn floor_to(ts: i64, interval: i64) -> i64 {
    ts - ts.rem_euclid(interval)
}

/// Current wall time in epoch milliseconds.
pub fn now_millis() -> i64 {
    system_time_millis(SystemTime::now())
}

/// Convert a `SystemTime` to epoch milliseconds, clamping pre-epoch values to 0.
pub fn system_time_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Convert epoch milliseconds back to a `SystemTime`.
pub fn millis_to_system_time(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

/// Render epoch milliseconds as RFC 3339 for logs.
pub fn format_millis(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> WindowClock {
        WindowClock::new(Duration::from_secs(5), Duration::from_secs(5)).expect("valid params")
    }

    #[test]
    fn test_floor_to_grid() {
        assert_eq!(floor_to(12_345, 5_000), 10_000);
        assert_eq!(floor_to(10_000, 5_000), 10_000);
        assert_eq!(floor_to(-1, 5_000), -5_000);
    }

    #[test]
    fn test_emission_window_trails_by_one() {
        let c = clock();
        let curr = c.floor(1_000_007_300);
        assert_eq!(curr, 1_000_005_000);

        let w = c.emission_window(curr);
        assert_eq!(w.start, 999_995_000);
        assert_eq!(w.end, 1_000_000_000);
        assert_eq!(w.len_ms(), 5_000);
    }

    #[test]
    fn test_scan_buckets_with_coarser_rotation() {
        let c = WindowClock::new(Duration::from_secs(5), Duration::from_secs(10))
            .expect("valid params");
        assert_eq!(c.scan_buckets(25_000), [10_000, 20_000]);
    }

    #[test]
    fn test_window_overlap() {
        let w = Window::new(1_000, 2_000);
        assert_eq!(w.overlap(500, 1_500), 500);
        assert_eq!(w.overlap(1_200, 1_300), 100);
        assert_eq!(w.overlap(1_900, 5_000), 100);
        assert_eq!(w.overlap(2_000, 3_000), 0);
        assert_eq!(w.overlap(0, 900), 0);
    }

    #[test]
    fn test_clock_new_rejects_zero_cadence() {
        let result = WindowClock::new(Duration::ZERO, Duration::from_secs(5));
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("cadence"));
    }

    #[test]
    fn test_clock_new_rejects_zero_rotation() {
        let result = WindowClock::new(Duration::from_secs(5), Duration::from_micros(10));
        assert!(result
            .expect_err("should fail")
            .to_string()
            .contains("rotation_interval"));
    }

    #[test]
    fn test_millis_round_trip_and_format() {
        let t = millis_to_system_time(1_566_413_987_986);
        assert_eq!(system_time_millis(t), 1_566_413_987_986);
        assert_eq!(format_millis(0), "1970-01-01T00:00:00.000Z");
    }
}
