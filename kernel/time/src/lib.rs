//! The monotonic scheduler tick counter.
//!
//! Sleep timeouts and per-task runtime accounting both measure time in
//! ticks of this counter. The timer interrupt path (or the test
//! harness) advances it by calling [`tick()`]; nothing here assumes a
//! particular tick frequency beyond the nominal [`HZ`].

#![no_std]

use core::sync::atomic::{AtomicU64, Ordering};

/// Nominal ticks per second, used by accounting constants.
pub const HZ: u64 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// The current tick count. Monotonically non-decreasing.
pub fn now_ticks() -> u64 {
    TICKS.load(Ordering::SeqCst)
}

/// Advances the tick counter by one and returns the new value.
///
/// Called from the periodic timer path; safe to call concurrently with
/// readers, though a single timer source is the expected arrangement.
pub fn tick() -> u64 {
    TICKS.fetch_add(1, Ordering::SeqCst) + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let a = now_ticks();
        let b = tick();
        assert!(b > a);
        assert!(now_ticks() >= b);
    }
}
