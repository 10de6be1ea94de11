//! Time functions used throughout kestrel.
//!
//! Sample stores and aggregation contexts deal in epoch seconds. The
//! functions here are the single place the crate touches the wall clock;
//! everything downstream takes explicit timestamps so tests can feed their
//! own.

use chrono::Utc;
use std::time::Instant;

/// The current time in epoch seconds.
pub fn now() -> i64 {
    Utc::now().timestamp()
}

/// The current time in fractional epoch seconds.
///
/// Counter rates divide by sub-second intervals, so the stores keep float
/// timestamps internally and truncate to whole seconds only at the payload
/// boundary.
pub fn now_f64() -> f64 {
    let now = Utc::now();
    (now.timestamp() as f64) + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

/// Nanoseconds elapsed since `i`, saturating at `u64::MAX`.
pub fn elapsed_ns(i: Instant) -> u64 {
    let elapsed = i.elapsed();
    (elapsed.as_secs().saturating_mul(1_000_000_000))
        .saturating_add(u64::from(elapsed.subsec_nanos()))
}
