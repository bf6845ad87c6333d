//! Presentation timestamp helpers
//!
//! Producers stamp frames in nanoseconds; encoders and the muxer work in
//! microseconds.

use std::time::Instant;

/// Convert a nanosecond capture timestamp to encoder microseconds
#[inline]
pub fn ns_to_us(timestamp_ns: i64) -> i64 {
    timestamp_ns / 1_000
}

/// Monotonic clock for synthetic frame timestamps
///
/// Never yields zero, which the pipeline reserves for invalid frames.
#[derive(Debug, Clone)]
pub struct PTSClock {
    start: Instant,
}

impl PTSClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Elapsed time since clock creation, in nanoseconds (>= 1)
    #[inline]
    pub fn now_ns(&self) -> i64 {
        let elapsed = self.start.elapsed().as_nanos();
        i64::try_from(elapsed).unwrap_or(i64::MAX).max(1)
    }
}

impl Default for PTSClock {
    fn default() -> Self {
        Self::new()
    }
}
