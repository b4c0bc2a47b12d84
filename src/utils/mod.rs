//! Utility functions and helpers for the taskloom implementation.

pub mod histogram;

pub use histogram::{
    HistogramData, record_count, record_time, snapshot, snapshot_names,
};

use once_cell::sync::Lazy;
use std::time::Instant;

/// Process-wide monotonic epoch used to encode instants as atomic integers.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Returns the current time as microseconds since the process epoch.
///
/// The value is strictly positive, so zero can serve as a "never" sentinel in
/// atomic slots.
pub fn monotonic_micros() -> u64 {
    EPOCH.elapsed().as_micros() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_monotonic_micros_advances() {
        let a = monotonic_micros();
        std::thread::sleep(Duration::from_millis(2));
        let b = monotonic_micros();
        assert!(b > a);
        assert!(a > 0);
    }
}
