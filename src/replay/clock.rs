//! Capture-time to wall-time mapping
//!
//! The shifter pins its anchor on the first source timestamp it sees; every
//! later timestamp maps to `wall_start + (source - source_start) / rate`.
//! A rate above 1.0 accelerates replay relative to capture pacing.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Anchor {
    source_start_ms: i64,
    wall_start: Instant,
}

/// Maps capture timestamps to wall-clock replay instants at a configurable
/// speed multiplier.
pub struct TimeShifter {
    rate: f64,
    anchor: Mutex<Option<Anchor>>,
}

impl TimeShifter {
    /// `rate` is clamped below at a small positive value; 1.0 replays at the
    /// original pace.
    pub fn new(rate: f64) -> Self {
        Self {
            rate: rate.max(0.001),
            anchor: Mutex::new(None),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Wall-clock instant at which `source_ms` should be replayed. The first
    /// call pins the anchor to now.
    pub fn to_real_time(&self, source_ms: i64) -> Instant {
        let anchor = {
            let mut guard = self.anchor.lock();
            *guard.get_or_insert_with(|| Anchor {
                source_start_ms: source_ms,
                wall_start: Instant::now(),
            })
        };
        let delta_ms = (source_ms - anchor.source_start_ms).max(0) as f64 / self.rate;
        anchor.wall_start + Duration::from_millis(delta_ms as u64)
    }

    /// Inverse mapping for diagnostics: the source timestamp corresponding
    /// to a wall instant. `None` before the anchor is pinned.
    pub fn to_source_time(&self, wall: Instant) -> Option<i64> {
        let anchor = (*self.anchor.lock())?;
        let elapsed_ms = wall.saturating_duration_since(anchor.wall_start).as_millis() as f64;
        Some(anchor.source_start_ms + (elapsed_ms * self.rate) as i64)
    }

    /// Scale a capture-side duration into its replay-side duration.
    pub fn shift_duration(&self, source_ms: i64) -> Duration {
        Duration::from_millis((source_ms.max(0) as f64 / self.rate) as u64)
    }
}
