// Global Timer Tick Counter
//
// Tracks the monotonic tick count advanced by the bootstrap CPU's periodic
// timer interrupt. Everything that needs wall-clock-ish time (log
// timestamps, message timestamps, uptime) derives it from here; scheduling
// decisions use each run queue's own clock instead.
//
// Implementation details:
// - `TICKS` and the frequency are atomics so the interrupt handler and
//   readers on other CPUs never need a lock
// - Only CPU 0 calls `advance`; other CPUs only read

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::TIMER_HZ;

static TICKS: AtomicU64 = AtomicU64::new(0);
static FREQUENCY_HZ: AtomicU64 = AtomicU64::new(TIMER_HZ);

pub fn set_frequency(hz: u64) {
    if hz != 0 {
        FREQUENCY_HZ.store(hz, Ordering::Relaxed);
    }
}

pub fn frequency() -> u64 {
    FREQUENCY_HZ.load(Ordering::Relaxed)
}

pub(crate) fn advance() -> u64 {
    TICKS.fetch_add(1, Ordering::Relaxed) + 1
}

pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

pub fn uptime_ms() -> u64 {
    ticks_to_ms(get_ticks(), frequency())
}

pub const fn ticks_to_ms(ticks: u64, hz: u64) -> u64 {
    ticks.saturating_mul(1000) / hz
}

/// Number of ticks a sleep of `ms` milliseconds lasts at `hz`.
pub const fn ms_to_ticks(ms: u64, hz: u64) -> u64 {
    ms.saturating_mul(hz) / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_at_default_rate() {
        assert_eq!(ms_to_ticks(100, 100), 10);
        assert_eq!(ms_to_ticks(5, 100), 0);
        assert_eq!(ticks_to_ms(250, 100), 2500);
    }

    #[test]
    fn advance_is_monotonic() {
        let before = get_ticks();
        let after = advance();
        assert!(after > before);
        assert!(get_ticks() >= after);
    }
}
