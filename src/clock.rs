//! Monotonic and wall clock services.
//!
//! Matches schedule off a monotonic `Instant`-based clock so tick timing is
//! immune to wall-clock adjustments; everything persisted (expiry times,
//! reset boundaries, record timestamps) uses wall-clock epoch seconds.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Current wall-clock time as epoch seconds, the unit used throughout the
/// data model (expiry, createTime, resetSchedule).
pub fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

/// Current wall-clock time in milliseconds, used for message/record
/// timestamps that need sub-second ordering.
pub fn now_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

/// A monotonic tick source for a single match's scheduler. Not `Clone`:
/// each match owns exactly one.
pub struct TickClock {
    started_at: Instant,
    tick_rate_hz: u32,
}

impl TickClock {
    pub fn new(tick_rate_hz: u32) -> Self {
        Self {
            started_at: Instant::now(),
            tick_rate_hz,
        }
    }

    pub fn tick_interval(&self) -> tokio::time::Duration {
        tokio::time::Duration::from_secs_f64(1.0 / self.tick_rate_hz as f64)
    }

    pub fn elapsed_ticks(&self) -> u64 {
        (self.started_at.elapsed().as_secs_f64() * self.tick_rate_hz as f64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_secs_is_positive_and_increasing() {
        let a = now_epoch_secs();
        assert!(a > 0);
        let b = now_epoch_millis();
        assert!(b >= a * 1000);
    }

    #[test]
    fn tick_interval_matches_rate() {
        let clock = TickClock::new(10);
        assert_eq!(clock.tick_interval(), tokio::time::Duration::from_millis(100));
    }
}
