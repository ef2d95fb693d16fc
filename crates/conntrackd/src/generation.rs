//! Generation clock for the expiry policy.
//!
//! A generation is a small label derived from the wall clock: the
//! nanosecond timestamp divided by [`GENERATION_LENGTH`], modulo 256.
//! Entries are stamped with the generation at which they become eligible
//! for eviction; compaction drops entries whose stamp matches the current
//! generation. Packing expiry into a byte keeps the per-entry cost flat and
//! lets compaction be a linear filter instead of a timer wheel.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Interval between compaction passes over the translation index.
pub const COMPACT_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Length of one generation. Must be greater than [`COMPACT_INTERVAL`] so
/// every generation survives at least two compaction passes before its
/// label is reused.
pub const GENERATION_LENGTH: Duration = Duration::from_secs(4 * 60);

/// How many generations into the future fresh registrations are stamped.
pub const EXPIRY_GENERATIONS: u8 = 3;

/// Nanoseconds since the Unix epoch.
pub fn unix_now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

/// The generation label for the given instant.
pub fn current_generation(now_nanos: u64) -> u8 {
    ((now_nanos / GENERATION_LENGTH.as_nanos() as u64) % 256) as u8
}

/// The generation label `n` generations after the given instant, wrapping
/// modulo 256.
pub fn nth_generation(now_nanos: u64, n: u8) -> u8 {
    current_generation(now_nanos).wrapping_add(n)
}
