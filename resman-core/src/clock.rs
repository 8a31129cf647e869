//! Monotonic millisecond clock used for debounce deadlines and timed waits.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the first call in this process.
///
/// The epoch is anchored lazily, so the very first reading is 0. Deadlines
/// derived from it are always strictly positive because they add a window.
pub(crate) fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}
