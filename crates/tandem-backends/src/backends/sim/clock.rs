//! Simulated device tick counter

use std::time::Instant;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Tick counter derived from the host monotonic clock
///
/// Ticks are host nanoseconds since the clock was created, converted at the
/// configured counter frequency, so readings never go backwards.
#[derive(Debug)]
pub(crate) struct SimClock {
    origin: Instant,
    frequency: u64,
}

impl SimClock {
    pub(crate) fn new(frequency: u64) -> Self {
        Self {
            origin: Instant::now(),
            frequency: frequency.max(1),
        }
    }

    pub(crate) fn ticks(&self) -> u64 {
        let nanos = self.origin.elapsed().as_nanos() as u64;
        let seconds = nanos / NANOS_PER_SEC;
        let remainder = nanos % NANOS_PER_SEC;
        seconds * self.frequency + remainder * self.frequency / NANOS_PER_SEC
    }

    pub(crate) fn frequency(&self) -> u64 {
        self.frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ticks_are_monotonic() {
        let clock = SimClock::new(50_000_000);
        let mut last = clock.ticks();
        for _ in 0..1000 {
            let now = clock.ticks();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_ticks_follow_frequency() {
        let clock = SimClock::new(1_000_000);
        std::thread::sleep(Duration::from_millis(10));
        // 10ms at 1MHz is at least 10_000 ticks
        assert!(clock.ticks() >= 10_000);
    }
}
